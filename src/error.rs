use thiserror::Error;

/// Convenience type alias for Results with AtelierError
pub type Result<T> = std::result::Result<T, AtelierError>;

/// Main error type for Atelier
///
/// This enum represents all possible errors that can occur within the
/// system. The taxonomy is intentionally small and closed: callers dispatch
/// on these variants to decide between retrying, pausing, re-queueing a task,
/// or terminating the process.
#[derive(Error, Debug)]
pub enum AtelierError {
    /// The underlying container or sandbox died. Always recoverable at a
    /// higher level: the scheduler restarts the runner.
    #[error("environment crashed: {message}")]
    EnvironmentCrashed { message: String },

    /// A checked command exited non-zero.
    #[error("process failed with code {returncode:?}: {command}")]
    Process {
        command: String,
        returncode: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// A git operation failed; carries the branch it ran against and stderr.
    #[error("git operation on branch {branch:?} failed: {stderr}")]
    GitRepo {
        branch: Option<String>,
        stderr: String,
    },

    /// `git diff` (or another plumbing command) returned an unexpected code.
    #[error("git command failed with code {returncode}: {message}")]
    GitCommandFailure {
        message: String,
        returncode: i32,
        stdout: String,
        stderr: String,
    },

    /// Filetree sync failed; triggers the daemon resurrection path.
    #[error("mutagen sync {operation} failed for session {session_name}: {message}")]
    MutagenSync {
        operation: String,
        session_name: String,
        message: String,
    },

    #[error("file not found in environment: {path}")]
    FileNotFound { path: String },

    #[error("path is a directory (recursive copy required): {path}")]
    IsADirectory { path: String },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("invalid token")]
    InvalidToken,

    #[error("invalid email: {0}")]
    InvalidEmail(String),

    /// A required table is missing from the database file.
    #[error("missing SQL table: {table}")]
    MissingSqlTable { table: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("timeout: {message}")]
    Timeout { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Multiple strands failed concurrently; the group aggregates and
    /// deduplicates them, keeping one designated main error.
    #[error("{count} strands failed: {main_message}")]
    ConcurrencyGroup {
        count: usize,
        main_message: String,
        messages: Vec<String>,
    },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AtelierError {
    pub fn environment_crashed(message: impl Into<String>) -> Self {
        AtelierError::EnvironmentCrashed {
            message: message.into(),
        }
    }

    /// Whether this error warrants immediate process termination.
    ///
    /// The allow-list is deliberately tiny: only conditions where continuing
    /// can corrupt state or spin forever, like the database file becoming
    /// unreachable mid-run.
    pub fn is_irrecoverable(&self) -> bool {
        match self {
            AtelierError::Database(err) => {
                let message = err.to_string();
                message.contains("disk I/O error") || message.contains("unable to open database file")
            }
            AtelierError::MissingSqlTable { .. } => false,
            _ => false,
        }
    }
}
