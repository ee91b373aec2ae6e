/// Ephemeral "who is typing" presence per note. Entries expire after a fixed
/// silence window so a client that disconnects mid-keystroke never leaves a
/// ghost indicator behind; outgoing notifications are throttled so a user
/// typing continuously does not flood the channel.
use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::{NoteId, SyncConfig, User, UserId};

#[derive(Debug, Clone)]
struct TypingEntry {
    user: User,
    deadline: Instant,
}

#[derive(Debug)]
pub struct TypingTracker {
    expiry: Duration,
    throttle: Duration,
    entries: HashMap<(NoteId, UserId), TypingEntry>,
    last_sent: HashMap<(NoteId, UserId), Instant>,
}

impl TypingTracker {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            expiry: config.typing_expiry,
            throttle: config.typing_throttle,
            entries: HashMap::new(),
            last_sent: HashMap::new(),
        }
    }

    /// Record that `user` is typing in `note_id`, local or remote. Re-arms
    /// the expiry deadline on every call.
    pub fn start_typing(&mut self, note_id: NoteId, user: User) {
        let key = (note_id, user.id);
        self.entries.insert(
            key,
            TypingEntry {
                user,
                deadline: Instant::now() + self.expiry,
            },
        );
    }

    /// Explicit stop signal; evicts immediately.
    pub fn stop_typing(&mut self, note_id: NoteId, user_id: UserId) {
        self.entries.remove(&(note_id, user_id));
    }

    /// Users currently typing in `note_id`, expired entries excluded.
    pub fn active_typers(&self, note_id: NoteId) -> Vec<&User> {
        let now = Instant::now();
        let mut typers: Vec<&User> = self
            .entries
            .iter()
            .filter(|((nid, _), entry)| *nid == note_id && entry.deadline > now)
            .map(|(_, entry)| &entry.user)
            .collect();
        typers.sort_by(|a, b| a.name.cmp(&b.name));
        typers
    }

    /// Drop every expired entry. Called periodically by the session loop.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.deadline > now);
    }

    /// Whether a local typing notification should be sent now. At most one
    /// send per throttle interval per (note, user) pair.
    pub fn should_broadcast(&mut self, note_id: NoteId, user_id: UserId) -> bool {
        let now = Instant::now();
        let key = (note_id, user_id);
        match self.last_sent.get(&key) {
            Some(last) if now.duration_since(*last) < self.throttle => false,
            _ => {
                self.last_sent.insert(key, now);
                true
            }
        }
    }

    /// Forget the throttle window, so the next keystroke after an explicit
    /// stop notifies immediately.
    pub fn reset_throttle(&mut self, note_id: NoteId, user_id: UserId) {
        self.last_sent.remove(&(note_id, user_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> User {
        User::new(UserId::new(), name, format!("{name}@example.com"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_silence() {
        let mut tracker = TypingTracker::new(&SyncConfig::default());
        let note = NoteId::new();
        let ana = user("ana");

        tracker.start_typing(note, ana.clone());
        assert_eq!(tracker.active_typers(note).len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(tracker.active_typers(note).is_empty());

        tracker.sweep();
        assert!(tracker.entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_rearms_deadline() {
        let mut tracker = TypingTracker::new(&SyncConfig::default());
        let note = NoteId::new();
        let ana = user("ana");

        tracker.start_typing(note, ana.clone());
        tokio::time::advance(Duration::from_secs(4)).await;
        tracker.start_typing(note, ana.clone());
        tokio::time::advance(Duration::from_secs(4)).await;

        // 8s since the first signal, 4s since the refresh: still active.
        assert_eq!(tracker.active_typers(note).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_evicts() {
        let mut tracker = TypingTracker::new(&SyncConfig::default());
        let note = NoteId::new();
        let ana = user("ana");

        tracker.start_typing(note, ana.clone());
        tracker.stop_typing(note, ana.id);
        assert!(tracker.active_typers(note).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_throttle() {
        let mut tracker = TypingTracker::new(&SyncConfig::default());
        let note = NoteId::new();
        let ana = user("ana");

        assert!(tracker.should_broadcast(note, ana.id));
        assert!(!tracker.should_broadcast(note, ana.id));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(tracker.should_broadcast(note, ana.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typers_scoped_per_note() {
        let mut tracker = TypingTracker::new(&SyncConfig::default());
        let note_a = NoteId::new();
        let note_b = NoteId::new();

        tracker.start_typing(note_a, user("ana"));
        tracker.start_typing(note_b, user("bruno"));

        assert_eq!(tracker.active_typers(note_a).len(), 1);
        assert_eq!(tracker.active_typers(note_a)[0].name, "ana");
        assert_eq!(tracker.active_typers(note_b)[0].name, "bruno");
    }
}
