//! Task definitions: what the application registers at startup.
//!
//! A definition is immutable once registered. Re-registering the same name
//! with different content replaces it (the registry decides, not this module).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::names::{HandlerKey, NameError, TaskName};
use super::time::add_duration;

/// Attempt budget used when the caller does not set one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// When a task becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Runs every `interval`, first after `initial_delay`.
    Periodic {
        interval: Duration,
        #[serde(default)]
        initial_delay: Duration,
    },

    /// Runs once, not before `earliest_start`.
    OneOff { earliest_start: DateTime<Utc> },
}

impl Trigger {
    pub fn periodic(interval: Duration) -> Self {
        Trigger::Periodic {
            interval,
            initial_delay: Duration::ZERO,
        }
    }

    pub fn one_off_at(earliest_start: DateTime<Utc>) -> Self {
        Trigger::OneOff { earliest_start }
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self, Trigger::Periodic { .. })
    }

    /// When the first run of a freshly armed definition is due.
    pub fn first_due(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Trigger::Periodic { initial_delay, .. } => add_duration(now, *initial_delay),
            Trigger::OneOff { earliest_start } => (*earliest_start).max(now),
        }
    }
}

/// Dotted OS version (`17.4`, `14.0.1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl OsVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid OS version '{0}'")]
pub struct OsVersionParseError(String);

impl FromStr for OsVersion {
    type Err = OsVersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(OsVersionParseError(s.to_string()));
        }
        let mut numbers = [0u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| OsVersionParseError(s.to_string()))?;
        }
        Ok(Self::new(numbers[0], numbers[1], numbers[2]))
    }
}

impl TryFrom<String> for OsVersion {
    type Error = OsVersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OsVersion> for String {
    fn from(v: OsVersion) -> Self {
        v.to_string()
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Preconditions the host enforces before it wakes the process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub requires_network: bool,

    #[serde(default)]
    pub requires_external_power: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_os_version: Option<OsVersion>,
}

/// Host-imposed limits used to validate definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefinitionLimits {
    pub min_periodic_interval: Duration,
}

/// DefinitionError は登録時の検証エラー（呼び出し側の設定ミス）
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("periodic interval must be non-zero")]
    ZeroInterval,

    #[error("periodic interval {interval:?} is below the host minimum {minimum:?}")]
    IntervalBelowMinimum { interval: Duration, minimum: Duration },

    #[error("earliest start {earliest_start} is in the past (now {now})")]
    StartInPast {
        earliest_start: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("max_retries must allow at least one attempt")]
    ZeroRetries,

    #[error("invalid handler key: {0}")]
    HandlerKey(NameError),

    #[error("input does not encode as JSON: {0}")]
    Input(String),
}

/// A registered unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: TaskName,
    pub handler: HandlerKey,
    pub trigger: Trigger,

    #[serde(default)]
    pub constraints: Constraints,

    /// Total attempt budget of one run (first try included).
    pub max_retries: u32,

    /// Opaque input handed to the handler on every wake.
    #[serde(default)]
    pub input: serde_json::Value,
}

impl TaskDefinition {
    pub fn builder(name: TaskName, handler: HandlerKey, trigger: Trigger) -> TaskDefinitionBuilder {
        TaskDefinitionBuilder {
            definition: TaskDefinition {
                name,
                handler,
                trigger,
                constraints: Constraints::default(),
                max_retries: DEFAULT_MAX_RETRIES,
                input: serde_json::Value::Null,
            },
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.trigger.is_periodic()
    }

    /// Check the definition against host limits at registration time.
    pub fn validate(
        &self,
        limits: &DefinitionLimits,
        now: DateTime<Utc>,
    ) -> Result<(), DefinitionError> {
        if self.max_retries == 0 {
            return Err(DefinitionError::ZeroRetries);
        }
        match &self.trigger {
            Trigger::Periodic { interval, .. } => {
                if interval.is_zero() {
                    return Err(DefinitionError::ZeroInterval);
                }
                if *interval < limits.min_periodic_interval {
                    return Err(DefinitionError::IntervalBelowMinimum {
                        interval: *interval,
                        minimum: limits.min_periodic_interval,
                    });
                }
            }
            Trigger::OneOff { earliest_start } => {
                if *earliest_start < now {
                    return Err(DefinitionError::StartInPast {
                        earliest_start: *earliest_start,
                        now,
                    });
                }
            }
        }
        Ok(())
    }
}

pub struct TaskDefinitionBuilder {
    definition: TaskDefinition,
}

impl TaskDefinitionBuilder {
    pub fn constraints(mut self, constraints: Constraints) -> Self {
        self.definition.constraints = constraints;
        self
    }

    pub fn requires_network(mut self) -> Self {
        self.definition.constraints.requires_network = true;
        self
    }

    pub fn requires_external_power(mut self) -> Self {
        self.definition.constraints.requires_external_power = true;
        self
    }

    pub fn min_os_version(mut self, version: OsVersion) -> Self {
        self.definition.constraints.min_os_version = Some(version);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.definition.max_retries = max_retries;
        self
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.definition.input = input;
        self
    }

    pub fn build(self) -> TaskDefinition {
        self.definition
    }
}
