/// Group entities kept in sync across clients: boards, tasks and notes.
/// Boards and tasks carry a server-assigned `updated_at` revision; notes use
/// an explicit integer version because note content is guarded by a
/// pessimistic lock and optimistic version checks.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{BoardId, GroupId, NoteId, TaskId, UserId};

/// User information, referenced by entities for assignment and locking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            email: email.into(),
        }
    }
}

/// An ordered column of tasks within a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub id: BoardId,
    pub group_id: GroupId,
    pub name: String,
    pub description: String,
    pub color: String,
    /// Column position within the group.
    pub position: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// A unit of work belonging to exactly one board at a time.
/// `(board_id, position)` is unique within a board; moving a task changes
/// both fields atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub board_id: BoardId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub due_date: Option<DateTime<Utc>>,
    pub assignee: Option<UserId>,
    pub tags: BTreeSet<String>,
    /// Position within the owning board.
    pub position: i64,
    pub updated_at: DateTime<Utc>,
}

/// A collaboratively edited text document with pessimistic locking.
/// `version` starts at 1 and increases by exactly 1 per successful content
/// mutation; content may only change while the mutator holds the lock or the
/// note is unlocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub group_id: GroupId,
    pub title: String,
    pub content: String,
    pub version: u64,
    #[serde(rename = "bloqueada_por")]
    pub locked_by: Option<UserId>,
    #[serde(rename = "ultimo_editor")]
    pub last_editor: Option<UserId>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    pub fn new(group_id: GroupId, title: impl Into<String>) -> Self {
        Self {
            id: NoteId::new(),
            group_id,
            title: title.into(),
            content: String::new(),
            version: 1,
            locked_by: None,
            last_editor: None,
            updated_at: Utc::now(),
        }
    }
}

/// Common view over cached entities: an id plus an ordered revision used to
/// discard duplicate or out-of-order channel deliveries.
pub trait Entity: Clone {
    type Rev: PartialOrd + Copy;

    fn entity_id(&self) -> uuid::Uuid;
    fn rev(&self) -> Self::Rev;
}

impl Entity for Board {
    type Rev = DateTime<Utc>;

    fn entity_id(&self) -> uuid::Uuid {
        self.id.0
    }

    fn rev(&self) -> Self::Rev {
        self.updated_at
    }
}

impl Entity for Task {
    type Rev = DateTime<Utc>;

    fn entity_id(&self) -> uuid::Uuid {
        self.id.0
    }

    fn rev(&self) -> Self::Rev {
        self.updated_at
    }
}

impl Entity for Note {
    type Rev = u64;

    fn entity_id(&self) -> uuid::Uuid {
        self.id.0
    }

    fn rev(&self) -> Self::Rev {
        self.version
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_wire_field_names() {
        let mut note = Note::new(GroupId::new(), "Groceries");
        note.locked_by = Some(UserId::new());
        note.last_editor = Some(UserId::new());

        let json = serde_json::to_value(&note).unwrap();
        assert!(json.get("bloqueada_por").is_some());
        assert!(json.get("ultimo_editor").is_some());
        assert!(json.get("locked_by").is_none());

        let back: Note = serde_json::from_value(json).unwrap();
        assert_eq!(back, note);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
    }
}
