use crate::trace::TraceError;

/// Failures that stop a whole run.
///
/// Build failures never show up here; they are recorded per item. Categories:
/// - Setup: config, manifest, lock, parallelism. Nothing has been launched.
/// - Trace: a trace session could not be opened.
/// - Internal: a scheduler task died.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    // Setup
    #[error("Config error: {0}")]
    Config(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid degree of parallelism: {0}")]
    InvalidParallelism(String),

    // Trace
    #[error("Trace session failed: {0}")]
    TraceSession(#[source] TraceError),

    // Internal
    #[error("Scheduler task panicked: {0}")]
    SchedulerPanicked(String),
}

impl RunError {
    /// True when the run stopped before any build was launched.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            RunError::Config(_)
                | RunError::Manifest(_)
                | RunError::Lock(_)
                | RunError::InvalidParallelism(_)
        )
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Config(_)
            | RunError::Manifest(_)
            | RunError::Lock(_)
            | RunError::InvalidParallelism(_) => 2,
            RunError::TraceSession(_) => 3,
            RunError::SchedulerPanicked(_) => 4,
        }
    }
}

/// Bridge for handlers that still return `Result<T, String>`.
impl From<RunError> for String {
    fn from(err: RunError) -> String {
        err.to_string()
    }
}

impl From<TraceError> for RunError {
    fn from(err: TraceError) -> Self {
        RunError::TraceSession(err)
    }
}
