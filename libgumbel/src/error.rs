use thiserror::Error;

/// The closed set of failure kinds that may cross a component boundary.
///
/// Every internal failure is mapped into one of these four kinds before it
/// leaves the component that produced it, so callers can match exhaustively.
#[derive(Error, Debug)]
pub enum StatsError {
    /// The time or memory budget ran out before any usable estimate existed.
    /// Retrying the same call with larger budgets may succeed.
    #[error("result unavailable: {0}")]
    ResultUnavailable(String),

    /// A non-budget internal failure. Retrying the identical call may succeed.
    #[error("transient failure: {0}")]
    TransientFailure(String),

    /// The inputs are inconsistent with estimability (degenerate matrix,
    /// non-negative expected score, malformed persisted record, seed
    /// mismatch). Not retriable without changing the inputs.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An allocation failed. Always reported distinctly from InvalidInput.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),
}

impl StatsError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        StatsError::InvalidInput(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        StatsError::ResultUnavailable(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        StatsError::TransientFailure(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, StatsError>;

impl From<std::io::Error> for StatsError {
    fn from(e: std::io::Error) -> Self {
        StatsError::InvalidInput(format!("i/o failure: {e}"))
    }
}

impl From<std::collections::TryReserveError> for StatsError {
    fn from(e: std::collections::TryReserveError) -> Self {
        StatsError::ResourceExhaustion(format!("allocation failed: {e}"))
    }
}
