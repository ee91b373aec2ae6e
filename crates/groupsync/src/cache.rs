/// In-memory authoritative view of one group's entities.
/// The cache is the single source of truth for the UI; it is mutated only by
/// the mutation queue (local intents) and the session event loop (remote
/// events), and both paths funnel through the revision check here.
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Board, BoardId, Entity, GroupId, Note, NoteId, ServerEvent, Task, TaskId};

/// Outcome of applying a remote event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The event carried newer state and was applied.
    Applied,
    /// Duplicate or out-of-order delivery; discarded.
    Stale,
    /// A terminal deletion was applied.
    Removed,
    /// The event does not target cached state (e.g. typing presence).
    Ignored,
}

/// Full group state as returned by the backend snapshot endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub boards: Vec<Board>,
    pub tasks: Vec<Task>,
    pub notes: Vec<Note>,
}

/// Per-kind store keyed by id, with revision-guarded upserts.
#[derive(Debug, Clone)]
struct Store<E: Entity> {
    entries: HashMap<uuid::Uuid, E>,
}

// Derived Default would demand E: Default, which the entities do not carry.
impl<E: Entity> Default for Store<E> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<E: Entity> Store<E> {
    fn upsert_if_newer(&mut self, entity: E) -> Applied {
        match self.entries.get(&entity.entity_id()) {
            Some(current) if entity.rev() <= current.rev() => Applied::Stale,
            _ => {
                self.entries.insert(entity.entity_id(), entity);
                Applied::Applied
            }
        }
    }

    fn put(&mut self, entity: E) {
        self.entries.insert(entity.entity_id(), entity);
    }

    fn remove(&mut self, id: uuid::Uuid) -> Option<E> {
        self.entries.remove(&id)
    }

    fn get(&self, id: uuid::Uuid) -> Option<&E> {
        self.entries.get(&id)
    }

    fn values(&self) -> impl Iterator<Item = &E> {
        self.entries.values()
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntityCache {
    boards: Store<Board>,
    tasks: Store<Task>,
    notes: Store<Note>,
    /// Ids removed by deletion events. Deletion is terminal: a replayed
    /// event carrying a dead id must not resurrect the entity.
    tombstones: HashSet<uuid::Uuid>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a server-pushed event. Updates land only if strictly newer than
    /// the cached revision; deletions are terminal regardless of revision,
    /// including against replayed pre-delete events; creations degrade to
    /// guarded updates when the id already exists.
    pub fn apply(&mut self, event: &ServerEvent) -> Applied {
        match event {
            ServerEvent::BoardCreated { board } | ServerEvent::BoardUpdated { board } => {
                if self.tombstones.contains(&board.id.0) {
                    return Applied::Stale;
                }
                self.boards.upsert_if_newer(board.clone())
            }

            ServerEvent::BoardDeleted { board_id } => {
                let (removed, orphans) = self.remove_board_cascade(*board_id);
                self.tombstones.insert(board_id.0);
                for task in &orphans {
                    self.tombstones.insert(task.id.0);
                }
                if removed.is_none() {
                    return Applied::Stale;
                }
                debug!(
                    board = %board_id.0,
                    cascaded_tasks = orphans.len(),
                    "board removed from cache"
                );
                Applied::Removed
            }

            ServerEvent::TaskCreated { task }
            | ServerEvent::TaskUpdated { task }
            | ServerEvent::TaskMoved { task, .. } => {
                if self.tombstones.contains(&task.id.0) {
                    return Applied::Stale;
                }
                self.tasks.upsert_if_newer(task.clone())
            }

            ServerEvent::TaskDeleted { task_id } => {
                self.tombstones.insert(task_id.0);
                match self.tasks.remove(task_id.0) {
                    Some(_) => Applied::Removed,
                    None => Applied::Stale,
                }
            }

            ServerEvent::NoteCreated { note } | ServerEvent::NoteUpdated { note } => {
                if self.tombstones.contains(&note.id.0) {
                    return Applied::Stale;
                }
                self.notes.upsert_if_newer(note.clone())
            }

            ServerEvent::NoteDeleted { note_id } => {
                self.tombstones.insert(note_id.0);
                match self.notes.remove(note_id.0) {
                    Some(_) => Applied::Removed,
                    None => Applied::Stale,
                }
            }

            // Lock transitions are authoritative and do not bump the note
            // version; they mutate the lock holder in place.
            ServerEvent::NoteLocked { note_id, locked_by } => {
                match self.notes.entries.get_mut(&note_id.0) {
                    Some(note) => {
                        note.locked_by = Some(*locked_by);
                        Applied::Applied
                    }
                    None => Applied::Stale,
                }
            }

            ServerEvent::NoteUnlocked { note_id } => {
                match self.notes.entries.get_mut(&note_id.0) {
                    Some(note) => {
                        note.locked_by = None;
                        Applied::Applied
                    }
                    None => Applied::Stale,
                }
            }

            ServerEvent::UserTyping { .. } | ServerEvent::UserStoppedTyping { .. } => {
                Applied::Ignored
            }
        }
    }

    /// Replace the whole cache with an authoritative snapshot. Used after a
    /// reconnect, where the channel offers no replay across the gap.
    pub fn resync(&mut self, snapshot: GroupSnapshot) {
        self.boards.entries.clear();
        self.tasks.entries.clear();
        self.notes.entries.clear();
        // The snapshot is fresh server truth; an id it carries is alive
        // again no matter what was deleted before the gap.
        self.tombstones.clear();

        for board in snapshot.boards {
            self.boards.put(board);
        }
        for task in snapshot.tasks {
            self.tasks.put(task);
        }
        for note in snapshot.notes {
            self.notes.put(note);
        }
    }

    pub fn get_board(&self, id: BoardId) -> Option<&Board> {
        self.boards.get(id.0)
    }

    pub fn get_task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id.0)
    }

    pub fn get_note(&self, id: NoteId) -> Option<&Note> {
        self.notes.get(id.0)
    }

    /// Boards of a group in column order.
    pub fn boards_in_group(&self, group_id: GroupId) -> Vec<&Board> {
        let mut boards: Vec<_> = self
            .boards
            .values()
            .filter(|b| b.group_id == group_id)
            .collect();
        boards.sort_by_key(|b| b.position);
        boards
    }

    /// Tasks of a board in position order.
    pub fn tasks_on_board(&self, board_id: BoardId) -> Vec<&Task> {
        let mut tasks: Vec<_> = self
            .tasks
            .values()
            .filter(|t| t.board_id == board_id)
            .collect();
        tasks.sort_by_key(|t| t.position);
        tasks
    }

    pub fn notes_in_group(&self, group_id: GroupId) -> Vec<&Note> {
        let mut notes: Vec<_> = self
            .notes
            .values()
            .filter(|n| n.group_id == group_id)
            .collect();
        notes.sort_by(|a, b| a.title.cmp(&b.title));
        notes
    }

    // Unguarded entry points for the mutation queue: optimistic applies,
    // rollbacks and ack reconciliation all bypass the revision check because
    // the queue owns the before/after bookkeeping.

    pub fn put_board(&mut self, board: Board) {
        self.boards.put(board);
    }

    pub fn put_task(&mut self, task: Task) {
        self.tasks.put(task);
    }

    pub fn put_note(&mut self, note: Note) {
        self.notes.put(note);
    }

    pub fn remove_task(&mut self, id: TaskId) -> Option<Task> {
        self.tasks.remove(id.0)
    }

    pub fn remove_note(&mut self, id: NoteId) -> Option<Note> {
        self.notes.remove(id.0)
    }

    /// Remove a board together with its tasks. Deleting a board is terminal
    /// for the column, so the tasks cannot stay behind as orphans.
    pub fn remove_board_cascade(&mut self, id: BoardId) -> (Option<Board>, Vec<Task>) {
        let board = self.boards.remove(id.0);
        if board.is_none() {
            return (None, Vec::new());
        }

        let orphan_ids: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.board_id == id)
            .map(|t| t.id)
            .collect();

        let orphans = orphan_ids
            .into_iter()
            .filter_map(|tid| self.tasks.remove(tid.0))
            .collect();

        (board, orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;
    use crate::{Note, UserId};
    use chrono::Duration;

    #[test]
    fn test_stale_event_is_noop() {
        let group = GroupId::new();
        let mut cache = EntityCache::new();

        let mut board = fixtures::board(group, "Casa", 0);
        assert_eq!(
            cache.apply(&ServerEvent::BoardCreated {
                board: board.clone()
            }),
            Applied::Applied
        );

        // Same revision delivered again: duplicate, discarded.
        board.name = "Casa renombrada".to_string();
        assert_eq!(
            cache.apply(&ServerEvent::BoardUpdated {
                board: board.clone()
            }),
            Applied::Stale
        );
        assert_eq!(cache.get_board(board.id).unwrap().name, "Casa");

        // Strictly newer revision wins.
        board.updated_at += Duration::seconds(1);
        assert_eq!(
            cache.apply(&ServerEvent::BoardUpdated {
                board: board.clone()
            }),
            Applied::Applied
        );
        assert_eq!(cache.get_board(board.id).unwrap().name, "Casa renombrada");
    }

    #[test]
    fn test_delete_is_terminal_regardless_of_version() {
        let group = GroupId::new();
        let mut cache = EntityCache::new();
        let board = fixtures::board(group, "Viaje", 0);
        cache.put_board(board.clone());

        assert_eq!(
            cache.apply(&ServerEvent::BoardDeleted { board_id: board.id }),
            Applied::Removed
        );
        assert!(cache.get_board(board.id).is_none());

        // A second delete for the same id is a duplicate.
        assert_eq!(
            cache.apply(&ServerEvent::BoardDeleted { board_id: board.id }),
            Applied::Stale
        );
    }

    #[test]
    fn test_replayed_update_cannot_resurrect_deleted_note() {
        let group = GroupId::new();
        let mut cache = EntityCache::new();
        let mut note = Note::new(group, "Acta");
        note.version = 3;

        assert_eq!(
            cache.apply(&ServerEvent::NoteUpdated { note: note.clone() }),
            Applied::Applied
        );
        assert_eq!(
            cache.apply(&ServerEvent::NoteDeleted { note_id: note.id }),
            Applied::Removed
        );

        // The same update delivered again after the delete stays dead.
        assert_eq!(
            cache.apply(&ServerEvent::NoteUpdated { note: note.clone() }),
            Applied::Stale
        );
        assert!(cache.get_note(note.id).is_none());

        // So does a replayed create for the same id.
        assert_eq!(
            cache.apply(&ServerEvent::NoteCreated { note: note.clone() }),
            Applied::Stale
        );
        assert!(cache.get_note(note.id).is_none());
    }

    #[test]
    fn test_cascaded_tasks_stay_dead_after_board_delete() {
        let group = GroupId::new();
        let mut cache = EntityCache::new();
        let board = fixtures::board(group, "Mudanza", 0);
        let mut task = fixtures::task(board.id, "Empacar cajas", 0);
        cache.put_board(board.clone());
        cache.put_task(task.clone());

        cache.apply(&ServerEvent::BoardDeleted { board_id: board.id });

        // A replayed pre-delete task update must not bring the orphan back.
        task.updated_at += Duration::seconds(1);
        assert_eq!(
            cache.apply(&ServerEvent::TaskUpdated { task: task.clone() }),
            Applied::Stale
        );
        assert!(cache.get_task(task.id).is_none());
    }

    #[test]
    fn test_resync_revives_snapshot_ids_after_delete() {
        let group = GroupId::new();
        let mut cache = EntityCache::new();
        let note = Note::new(group, "Acta");
        cache.put_note(note.clone());
        cache.apply(&ServerEvent::NoteDeleted { note_id: note.id });

        // The server says the note exists; snapshot truth overrides the
        // tombstone and later updates for the id apply again.
        cache.resync(GroupSnapshot {
            boards: vec![],
            tasks: vec![],
            notes: vec![note.clone()],
        });
        assert!(cache.get_note(note.id).is_some());

        let mut newer = note.clone();
        newer.version += 1;
        assert_eq!(
            cache.apply(&ServerEvent::NoteUpdated { note: newer }),
            Applied::Applied
        );
    }

    #[test]
    fn test_board_delete_cascades_tasks() {
        let group = GroupId::new();
        let mut cache = EntityCache::new();
        let board = fixtures::board(group, "Mudanza", 0);
        let task = fixtures::task(board.id, "Empacar cajas", 0);
        cache.put_board(board.clone());
        cache.put_task(task.clone());

        cache.apply(&ServerEvent::BoardDeleted { board_id: board.id });
        assert!(cache.get_task(task.id).is_none());
    }

    #[test]
    fn test_task_moved_relocates_under_guard() {
        let group = GroupId::new();
        let mut cache = EntityCache::new();
        let board_a = fixtures::board(group, "Pendientes", 0);
        let board_b = fixtures::board(group, "Hechas", 1);
        let mut task = fixtures::task(board_a.id, "Pagar renta", 2);
        cache.put_board(board_a.clone());
        cache.put_board(board_b.clone());
        cache.put_task(task.clone());

        let from = task.board_id;
        task.board_id = board_b.id;
        task.position = 0;
        task.updated_at += Duration::seconds(1);

        assert_eq!(
            cache.apply(&ServerEvent::TaskMoved {
                task: task.clone(),
                from_board_id: from,
            }),
            Applied::Applied
        );
        assert!(cache.tasks_on_board(board_a.id).is_empty());
        assert_eq!(cache.tasks_on_board(board_b.id).len(), 1);
    }

    #[test]
    fn test_note_version_guard() {
        let group = GroupId::new();
        let mut cache = EntityCache::new();
        let mut note = Note::new(group, "Lista");
        note.version = 3;
        cache.put_note(note.clone());

        // Version 3 again: stale.
        assert_eq!(
            cache.apply(&ServerEvent::NoteUpdated { note: note.clone() }),
            Applied::Stale
        );

        note.version = 4;
        note.content = "leche, pan".to_string();
        assert_eq!(
            cache.apply(&ServerEvent::NoteUpdated { note: note.clone() }),
            Applied::Applied
        );
        assert_eq!(cache.get_note(note.id).unwrap().version, 4);
    }

    #[test]
    fn test_lock_events_mutate_holder_in_place() {
        let group = GroupId::new();
        let mut cache = EntityCache::new();
        let note = Note::new(group, "Acta");
        let holder = UserId::new();
        cache.put_note(note.clone());

        cache.apply(&ServerEvent::NoteLocked {
            note_id: note.id,
            locked_by: holder,
        });
        let cached = cache.get_note(note.id).unwrap();
        assert_eq!(cached.locked_by, Some(holder));
        assert_eq!(cached.version, note.version);

        cache.apply(&ServerEvent::NoteUnlocked { note_id: note.id });
        assert_eq!(cache.get_note(note.id).unwrap().locked_by, None);
    }

    #[test]
    fn test_resync_replaces_state() {
        let group = GroupId::new();
        let mut cache = EntityCache::new();
        let stale_board = fixtures::board(group, "Vieja", 0);
        cache.put_board(stale_board.clone());

        let fresh_board = fixtures::board(group, "Nueva", 0);
        cache.resync(GroupSnapshot {
            boards: vec![fresh_board.clone()],
            tasks: vec![],
            notes: vec![],
        });

        assert!(cache.get_board(stale_board.id).is_none());
        assert!(cache.get_board(fresh_board.id).is_some());
    }
}
