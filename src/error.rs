use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("invalid path pattern '{0}': {1}")]
    InvalidPattern(String, String),

    #[error("ttl must be positive, got {0}")]
    InvalidTtl(i64),

    #[error("agent name must contain alphanumeric characters: '{0}'")]
    InvalidAgentName(String),

    #[error("project '{0}' not found")]
    ProjectNotFound(String),

    #[error("agent '{0}' not registered for project '{1}'")]
    AgentNotFound(String, String),

    #[error("timed out waiting for archive lock: {0}")]
    LockTimeout(String),

    #[error("archive path escapes the project subtree: '{0}'")]
    PathOutsideArchive(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl WardenError {
    /// Stable machine-readable code for CLI/JSON consumers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPattern(_, _) => "invalid_pattern",
            Self::InvalidTtl(_) => "invalid_ttl",
            Self::InvalidAgentName(_) => "invalid_agent_name",
            Self::ProjectNotFound(_) => "project_not_found",
            Self::AgentNotFound(_, _) => "agent_not_found",
            Self::LockTimeout(_) => "lock_timeout",
            Self::PathOutsideArchive(_) => "path_outside_archive",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Db(_) => "db_error",
            Self::Git(_) => "git_error",
            Self::Image(_) => "image_error",
        }
    }

    /// Whether a caller may retry the same call unchanged and expect it to
    /// succeed once contention clears. True only for lock timeouts; no
    /// durable write happened in that case.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
