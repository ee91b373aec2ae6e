/// Server-pushed events delivered over the group channel.
/// The enumeration is closed: every callback the channel publishes maps to
/// exactly one variant, consumed uniformly by the cache, the lock
/// coordinator and the typing tracker.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Board, BoardId, Note, NoteId, Task, TaskId, User, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "board_created")]
    BoardCreated { board: Board },

    #[serde(rename = "board_updated")]
    BoardUpdated { board: Board },

    #[serde(rename = "board_deleted")]
    BoardDeleted { board_id: BoardId },

    #[serde(rename = "task_created")]
    TaskCreated { task: Task },

    #[serde(rename = "task_updated")]
    TaskUpdated { task: Task },

    /// Carries the old board id so clients can invalidate both columns.
    #[serde(rename = "task_moved")]
    TaskMoved { task: Task, from_board_id: BoardId },

    #[serde(rename = "task_deleted")]
    TaskDeleted { task_id: TaskId },

    #[serde(rename = "note_created")]
    NoteCreated { note: Note },

    #[serde(rename = "note_updated")]
    NoteUpdated { note: Note },

    #[serde(rename = "note_deleted")]
    NoteDeleted { note_id: NoteId },

    #[serde(rename = "note_locked")]
    NoteLocked {
        note_id: NoteId,
        #[serde(rename = "bloqueada_por")]
        locked_by: UserId,
    },

    #[serde(rename = "note_unlocked")]
    NoteUnlocked { note_id: NoteId },

    #[serde(rename = "user_typing")]
    UserTyping {
        note_id: NoteId,
        user: User,
        at: DateTime<Utc>,
    },

    #[serde(rename = "user_stopped_typing")]
    UserStoppedTyping { note_id: NoteId, user_id: UserId },
}

/// What a subscription delivers: either a decoded server event, or a signal
/// that the channel (re)connected and the caller must fetch a fresh snapshot
/// because events may have been missed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelItem {
    ResyncNeeded,
    Event(ServerEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;
    use crate::GroupId;

    #[test]
    fn test_event_tag_round_trip() {
        let board = fixtures::board(GroupId::new(), "Compras", 0);
        let event = ServerEvent::BoardCreated { board };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "board_created");

        let back: ServerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_lock_event_wire_name() {
        let event = ServerEvent::NoteLocked {
            note_id: NoteId::new(),
            locked_by: UserId::new(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "note_locked");
        assert!(json.get("bloqueada_por").is_some());
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let json = serde_json::json!({ "type": "board_exploded" });
        assert!(serde_json::from_value::<ServerEvent>(json).is_err());
    }
}
