use thiserror::Error;

#[derive(Error, Debug)]
pub enum JudgeError {
    #[error("Language not supported: {0}")]
    UnsupportedLanguage(String),

    #[error("Queue is full: {depth} jobs already waiting")]
    BackPressure { depth: usize },

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Judge pool is shut down")]
    ShutDown,

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JudgeError {
    /// Judge-side failures that say nothing about the submission and may be retried
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            JudgeError::Workspace(_) | JudgeError::Spawn(_) | JudgeError::Io(_)
        )
    }
}
