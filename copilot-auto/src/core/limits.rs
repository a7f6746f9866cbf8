//! Iteration and wall-clock ceilings for a supervised run.

use std::fmt;
use std::time::Duration;

use crate::core::types::RunConfig;

/// Configured ceilings for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub max_iterations: u32,
    pub max_duration: Duration,
}

/// The ceiling a run crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
    Iterations { count: u32, max: u32 },
    Duration { elapsed: Duration, max: Duration },
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitExceeded::Iterations { max, .. } => {
                write!(f, "maximum iterations ({max}) reached")
            }
            LimitExceeded::Duration { max, .. } => {
                write!(f, "maximum duration ({}ms) reached", max.as_millis())
            }
        }
    }
}

impl LimitPolicy {
    pub fn new(max_iterations: u32, max_duration: Duration) -> Self {
        Self {
            max_iterations,
            max_duration,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.max_iterations, config.max_duration())
    }

    /// Check a run's progress against the ceilings.
    ///
    /// The iteration ceiling is checked first and wins when both are crossed.
    pub fn evaluate(&self, iterations: u32, elapsed: Duration) -> Option<LimitExceeded> {
        if iterations >= self.max_iterations {
            return Some(LimitExceeded::Iterations {
                count: iterations,
                max: self.max_iterations,
            });
        }
        if elapsed >= self.max_duration {
            return Some(LimitExceeded::Duration {
                elapsed,
                max: self.max_duration,
            });
        }
        None
    }
}
