//! Domain model (names, definitions, runs, failure kinds, retry decisions).
//!
//! 副作用を持たない型だけを置く。ストアやホストスケジューラへのアクセスは ports / app 側。

pub mod decision;
pub mod definition;
pub mod errors;
pub mod ids;
pub mod names;
pub mod outcome;
pub mod retry;
pub mod run;
pub mod time;

pub use decision::{Decider, Decision, DefaultDecider};
pub use definition::{
    Constraints, DefinitionError, DefinitionLimits, OsVersion, TaskDefinition,
    TaskDefinitionBuilder, Trigger, DEFAULT_MAX_RETRIES,
};
pub use errors::{FailureKind, RunError};
pub use ids::RunId;
pub use names::{HandlerKey, NameError, TaskName};
pub use outcome::{HandlerFailure, WakeOutcome};
pub use retry::RetryPolicy;
pub use run::{RunState, TaskRun};
