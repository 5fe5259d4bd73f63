use thiserror::Error;

/// Errors raised inside the scheduler. None of them cross the public
/// submit/notify/remove boundary; those report failure as `false`.
#[derive(Debug, Error)]
pub enum SchedError {
    #[error(transparent)]
    Core(#[from] rtsched_core::CoreError),

    #[error("thread policy error: {0}")]
    Policy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("trace sink error: {0}")]
    Trace(String),
}
