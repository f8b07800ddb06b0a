use chrono::Duration;
use thiserror::Error;

/// User-facing rejections. Returned synchronously; the state is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CycleError {
    #[error("a mining cycle is already running")]
    AlreadyMining,

    #[error("cooldown active, {}s remaining", .remaining.num_seconds())]
    CooldownActive { remaining: Duration },
}

impl CycleError {
    /// Remaining cooldown, if this is a cooldown rejection.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            CycleError::CooldownActive { remaining } => Some(*remaining),
            CycleError::AlreadyMining => None,
        }
    }
}
