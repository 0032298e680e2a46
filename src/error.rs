use thiserror::Error;

pub type VoteResult<T> = Result<T, VoteError>;

/// Failures surfaced by the vote core.
#[derive(Debug, Error)]
pub enum VoteError {
    /// The voter already holds a vote that can no longer be changed.
    #[error("already voted in poll {poll_id}")]
    DuplicateVote { poll_id: String },

    /// Another session moved the vote away from `expected` first.
    #[error("vote in poll {poll_id} is no longer on option {expected}")]
    StaleVote { poll_id: String, expected: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("invalid poll: {0}")]
    InvalidPoll(String),

    #[error("poll {poll_id} is closed")]
    PollClosed { poll_id: String },

    /// The backing store did not complete the call.
    #[error("remote call failed: {0}")]
    Network(String),

    /// A stored value could not be read back.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for VoteError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => VoteError::NotFound("row not found".to_string()),
            other => VoteError::Network(other.to_string()),
        }
    }
}

/// Local vote cache failures. Logged and absorbed, never shown to the voter.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("vote cache i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("vote cache is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}
