/// Client-side synchronization engine for collaborative group workspaces.
/// Keeps boards, tasks and notes of one group consistent across clients via
/// a real-time event channel plus an optimistic mutation path to the backend.
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

mod model;
pub use model::*;

mod events;
pub use events::*;

mod cache;
pub use cache::*;

mod lock;
pub use lock::*;

mod typing;
pub use typing::*;

mod backend;
pub use backend::*;

mod mutation;
pub use mutation::*;

mod connection;
pub use connection::*;

mod session;
pub use session::*;

/// Lock-specific failures, always user-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LockError {
    #[error("note is locked by another user")]
    AlreadyLocked { holder: UserId },

    #[error("lock is held by a different user")]
    NotLockOwner,
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Terminal, user-fixable (e.g. empty required field).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Terminal; the caller must re-fetch the authoritative state.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// Retried with bounded backoff before being surfaced.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Connection-level failure; triggers reconnect + resync.
    #[error("channel error: {0}")]
    Channel(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Group identifier; also the real-time channel scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub uuid::Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoardId(pub uuid::Uuid);

impl BoardId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for BoardId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub uuid::Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NoteId(pub uuid::Uuid);

impl NoteId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for NoteId {
    fn default() -> Self {
        Self::new()
    }
}

/// User identifier; users are referenced, never owned, by group entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine tunables. The defaults match the documented contract: typing
/// entries expire after 5s of silence, reconnect backoff caps at 30s.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// First delay after a failed mutation submission; doubles per attempt.
    pub retry_base: Duration,
    /// Upper bound for the mutation retry delay.
    pub retry_cap: Duration,
    /// Transient failures are retried at most this many times.
    pub max_retries: u32,
    /// First delay after a dropped channel connection; doubles per attempt.
    pub reconnect_base: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_cap: Duration,
    /// A typing entry is evicted after this much silence.
    pub typing_expiry: Duration,
    /// Minimum interval between outgoing typing notifications.
    pub typing_throttle: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_millis(250),
            retry_cap: Duration::from_secs(5),
            max_retries: 5,
            reconnect_base: Duration::from_millis(500),
            reconnect_cap: Duration::from_secs(30),
            typing_expiry: Duration::from_secs(5),
            typing_throttle: Duration::from_secs(2),
        }
    }
}
