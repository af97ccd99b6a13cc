use drover_lib::ChainError;

/// Errors produced by the pipeline itself. Stage failures are isolated
/// to their task unit; nothing here escapes `start`.
#[derive(thiserror::Error, Debug)]
pub enum ExecutorError {
    #[error("executor is already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Execution exceeded the per-task timeout.
    #[error("task execution exceeded {0} ms")]
    TaskTimeout(u64),

    /// The healthy-claim predicate failed before or during execution.
    #[error("claim inside the {0} ms expiry buffer")]
    ClaimExpired(u64),

    /// Last attempt of a retryable stage failed; carries the final
    /// underlying cause.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: ChainError,
    },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    /// The per-task signal fired for a reason other than a timeout
    /// (stop, rollback, explicit cancel).
    #[error("task cancelled")]
    Cancelled,
}
