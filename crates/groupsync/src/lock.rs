/// Note lock coordination. Each note is either unlocked or held by exactly
/// one user; only the holder may mutate content. Expected transitions return
/// typed outcomes rather than panicking, and remote lock events override
/// local state unconditionally since the backend owns lock lifetimes.
use std::collections::HashMap;

use tracing::debug;

use crate::{LockError, NoteId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked { holder: UserId },
}

#[derive(Debug, Clone, Default)]
pub struct LockCoordinator {
    locks: HashMap<NoteId, UserId>,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, note_id: NoteId) -> LockState {
        match self.locks.get(&note_id) {
            Some(holder) => LockState::Locked { holder: *holder },
            None => LockState::Unlocked,
        }
    }

    pub fn holder(&self, note_id: NoteId) -> Option<UserId> {
        self.locks.get(&note_id).copied()
    }

    /// Whether `user` may edit the note's content right now.
    pub fn can_edit(&self, note_id: NoteId, user: UserId) -> bool {
        match self.locks.get(&note_id) {
            None => true,
            Some(holder) => *holder == user,
        }
    }

    /// Acquire the lock for `user`. Succeeds only from `Unlocked` (or when
    /// `user` already holds it); never queues or blocks behind another
    /// holder, so the UI can immediately tell the user who has the note.
    pub fn acquire(&mut self, note_id: NoteId, user: UserId) -> Result<(), LockError> {
        match self.locks.get(&note_id) {
            Some(holder) if *holder != user => Err(LockError::AlreadyLocked { holder: *holder }),
            _ => {
                self.locks.insert(note_id, user);
                Ok(())
            }
        }
    }

    /// Release the lock. Succeeds only when `user` is the current holder.
    pub fn release(&mut self, note_id: NoteId, user: UserId) -> Result<(), LockError> {
        match self.locks.get(&note_id) {
            Some(holder) if *holder == user => {
                self.locks.remove(&note_id);
                Ok(())
            }
            _ => Err(LockError::NotLockOwner),
        }
    }

    /// Apply a remote `note_locked` event. Authoritative: another client may
    /// have acquired the lock without any local request.
    pub fn apply_remote_lock(&mut self, note_id: NoteId, holder: UserId) {
        if let Some(previous) = self.locks.insert(note_id, holder) {
            if previous != holder {
                debug!(note = %note_id.0, "lock holder replaced by remote event");
            }
        }
    }

    /// Apply a remote `note_unlocked` event, including backend TTL expiry of
    /// an abandoned lock.
    pub fn apply_remote_unlock(&mut self, note_id: NoteId) {
        self.locks.remove(&note_id);
    }

    /// Rebuild lock state from snapshot data after a resync.
    pub fn rebuild(&mut self, holders: impl IntoIterator<Item = (NoteId, UserId)>) {
        self.locks.clear();
        self.locks.extend(holders);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_succeeds_only_from_unlocked() {
        let mut locks = LockCoordinator::new();
        let note = NoteId::new();
        let alice = UserId::new();
        let bob = UserId::new();

        assert_eq!(locks.state(note), LockState::Unlocked);
        assert!(locks.acquire(note, alice).is_ok());
        assert_eq!(locks.state(note), LockState::Locked { holder: alice });

        // Second requester is told who holds it.
        assert_eq!(
            locks.acquire(note, bob),
            Err(LockError::AlreadyLocked { holder: alice })
        );

        // Re-acquiring one's own lock is idempotent.
        assert!(locks.acquire(note, alice).is_ok());
    }

    #[test]
    fn test_release_requires_ownership() {
        let mut locks = LockCoordinator::new();
        let note = NoteId::new();
        let alice = UserId::new();
        let bob = UserId::new();

        // Releasing an unlocked note fails.
        assert_eq!(locks.release(note, alice), Err(LockError::NotLockOwner));

        locks.acquire(note, alice).unwrap();
        assert_eq!(locks.release(note, bob), Err(LockError::NotLockOwner));
        assert!(locks.release(note, alice).is_ok());
        assert_eq!(locks.state(note), LockState::Unlocked);
    }

    #[test]
    fn test_remote_events_are_authoritative() {
        let mut locks = LockCoordinator::new();
        let note = NoteId::new();
        let alice = UserId::new();
        let bob = UserId::new();

        locks.acquire(note, alice).unwrap();

        // The backend says bob holds it now; local state follows.
        locks.apply_remote_lock(note, bob);
        assert_eq!(locks.holder(note), Some(bob));
        assert!(!locks.can_edit(note, alice));
        assert!(locks.can_edit(note, bob));

        locks.apply_remote_unlock(note);
        assert!(locks.can_edit(note, alice));
    }

    #[test]
    fn test_rebuild_from_snapshot() {
        let mut locks = LockCoordinator::new();
        let stale_note = NoteId::new();
        let fresh_note = NoteId::new();
        let carol = UserId::new();

        locks.acquire(stale_note, carol).unwrap();
        locks.rebuild([(fresh_note, carol)]);

        assert_eq!(locks.state(stale_note), LockState::Unlocked);
        assert_eq!(locks.state(fresh_note), LockState::Locked { holder: carol });
    }
}
