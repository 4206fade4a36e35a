use thiserror::Error;

/// Every failure an orchestrator action can report back to its caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// Wrong actor, wrong phase, unknown chart, malformed result.
    #[error("{0}")]
    Validation(String),

    /// The slot for this event or referee is already held.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    /// The input window expired; only an operator rearm reopens it.
    #[error("{0} timed out. A referee needs to restart the match.")]
    Stalled(String),

    /// The durable write failed; in-memory state was left untouched.
    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("resume failed: {0}")]
    Resume(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl MatchError {
    pub fn validation(message: impl Into<String>) -> Self {
        MatchError::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        MatchError::Conflict(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        MatchError::NotFound(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MatchError::Validation(_) => "validation",
            MatchError::Conflict(_) => "conflict",
            MatchError::NotFound(_) => "not_found",
            MatchError::Stalled(_) => "stalled",
            MatchError::Persistence(_) => "persistence",
            MatchError::Resume(_) => "resume",
            MatchError::Config(_) => "config",
        }
    }
}

pub type MatchResult<T> = Result<T, MatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stalled_message_names_the_window() {
        let err = MatchError::Stalled("Ban selection".to_string());
        assert_eq!(
            err.to_string(),
            "Ban selection timed out. A referee needs to restart the match."
        );
        assert_eq!(err.kind(), "stalled");
    }

    #[test]
    fn test_persistence_message_is_prefixed() {
        let err = MatchError::Persistence("disk full".to_string());
        assert_eq!(err.to_string(), "persistence failed: disk full");
    }
}
