/// Per-group session: composes the cache, lock coordinator, typing tracker,
/// mutation queue and channel subscription behind one object with a defined
/// lifecycle. Created per login session, torn down on logout; never a
/// process-wide singleton.
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    Applied, Backend, Board, BoardId, ChannelItem, ConnectionManager, EntityCache, GroupId,
    LockCoordinator, LockError, Mutation, MutationId, MutationOutcome, MutationQueue, Note,
    NoteId, Result, ServerEvent, Subscription, SyncConfig, SyncError, Task, TaskId, TaskPriority,
    TaskStatus, TypingTracker, User, UserId,
};

pub struct GroupSession {
    group_id: GroupId,
    user: User,
    cache: Arc<RwLock<EntityCache>>,
    locks: Arc<Mutex<LockCoordinator>>,
    typing: Arc<Mutex<TypingTracker>>,
    backend: Arc<dyn Backend>,
    queue: MutationQueue,
    outcomes: Option<mpsc::UnboundedReceiver<MutationOutcome>>,
    event_task: JoinHandle<()>,
}

impl GroupSession {
    /// Subscribe to the group channel and start the event loop. The first
    /// `ResyncNeeded` from the fresh subscription hydrates the cache.
    pub fn start(
        group_id: GroupId,
        user: User,
        backend: Arc<dyn Backend>,
        manager: &ConnectionManager,
        config: SyncConfig,
    ) -> Result<Self> {
        let subscription = manager.subscribe(group_id)?;

        let cache = Arc::new(RwLock::new(EntityCache::new()));
        let locks = Arc::new(Mutex::new(LockCoordinator::new()));
        let typing = Arc::new(Mutex::new(TypingTracker::new(&config)));

        let (queue, outcomes) =
            MutationQueue::spawn(group_id, cache.clone(), backend.clone(), config);

        let event_task = tokio::spawn(event_loop(
            subscription,
            group_id,
            backend.clone(),
            cache.clone(),
            locks.clone(),
            typing.clone(),
        ));

        Ok(Self {
            group_id,
            user,
            cache,
            locks,
            typing,
            backend,
            queue,
            outcomes: Some(outcomes),
            event_task,
        })
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// The UI renders from this cache; it is the single source of truth.
    pub fn cache(&self) -> Arc<RwLock<EntityCache>> {
        self.cache.clone()
    }

    /// Stream of mutation outcomes for surfacing failures. Yields once.
    pub fn take_outcomes(&mut self) -> Option<mpsc::UnboundedReceiver<MutationOutcome>> {
        self.outcomes.take()
    }

    // --- Boards ---

    pub async fn create_board(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        color: impl Into<String>,
    ) -> Result<(BoardId, MutationId)> {
        let position = {
            let cache = self.cache.read().await;
            cache.boards_in_group(self.group_id).len() as i64
        };
        let board = Board {
            id: BoardId::new(),
            group_id: self.group_id,
            name: name.into(),
            description: description.into(),
            color: color.into(),
            position,
            updated_at: Utc::now(),
        };
        let board_id = board.id;
        let mutation_id = self.queue.enqueue(Mutation::CreateBoard { board }).await?;
        Ok((board_id, mutation_id))
    }

    /// Rename, recolor or reorder; the whole board value is submitted.
    pub async fn update_board(&self, board: Board) -> Result<MutationId> {
        self.queue.enqueue(Mutation::UpdateBoard { board }).await
    }

    pub async fn delete_board(&self, board_id: BoardId) -> Result<MutationId> {
        self.queue.enqueue(Mutation::DeleteBoard { board_id }).await
    }

    // --- Tasks ---

    pub async fn create_task(
        &self,
        board_id: BoardId,
        title: impl Into<String>,
    ) -> Result<(TaskId, MutationId)> {
        let position = {
            let cache = self.cache.read().await;
            cache.tasks_on_board(board_id).len() as i64
        };
        let task = Task {
            id: TaskId::new(),
            board_id,
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Medium,
            due_date: None,
            assignee: None,
            tags: Default::default(),
            position,
            updated_at: Utc::now(),
        };
        let task_id = task.id;
        let mutation_id = self.queue.enqueue(Mutation::CreateTask { task }).await?;
        Ok((task_id, mutation_id))
    }

    pub async fn update_task(&self, task: Task) -> Result<MutationId> {
        self.queue.enqueue(Mutation::UpdateTask { task }).await
    }

    pub async fn move_task(
        &self,
        task_id: TaskId,
        to_board: BoardId,
        position: i64,
    ) -> Result<MutationId> {
        self.queue
            .enqueue(Mutation::MoveTask {
                task_id,
                to_board,
                position,
            })
            .await
    }

    pub async fn delete_task(&self, task_id: TaskId) -> Result<MutationId> {
        self.queue.enqueue(Mutation::DeleteTask { task_id }).await
    }

    // --- Notes ---

    pub async fn create_note(&self, title: impl Into<String>) -> Result<(NoteId, MutationId)> {
        let note = Note::new(self.group_id, title);
        let note_id = note.id;
        let mutation_id = self.queue.enqueue(Mutation::CreateNote { note }).await?;
        Ok((note_id, mutation_id))
    }

    /// Edit note content. Rejected client-side while another user holds the
    /// lock, before anything reaches the queue.
    pub async fn edit_note(&self, note_id: NoteId, content: impl Into<String>) -> Result<MutationId> {
        {
            let locks = self.locks.lock().await;
            if let Some(holder) = locks.holder(note_id) {
                if holder != self.user.id {
                    return Err(SyncError::Lock(LockError::AlreadyLocked { holder }));
                }
            }
        }

        let base_version = {
            let cache = self.cache.read().await;
            cache
                .get_note(note_id)
                .ok_or_else(|| SyncError::Validation("unknown note".into()))?
                .version
        };

        self.queue
            .enqueue(Mutation::UpdateNoteContent {
                note_id,
                content: content.into(),
                base_version,
            })
            .await
    }

    pub async fn delete_note(&self, note_id: NoteId) -> Result<MutationId> {
        self.queue.enqueue(Mutation::DeleteNote { note_id }).await
    }

    // --- Locks ---

    /// Acquire the note lock via the backend. Fails fast locally when the
    /// lock is known to be held by someone else.
    pub async fn request_lock(&self, note_id: NoteId) -> Result<()> {
        {
            let locks = self.locks.lock().await;
            if let Some(holder) = locks.holder(note_id) {
                if holder != self.user.id {
                    return Err(SyncError::Lock(LockError::AlreadyLocked { holder }));
                }
            }
        }

        let note = self
            .backend
            .lock_note(self.group_id, note_id, self.user.id)
            .await?;
        self.locks
            .lock()
            .await
            .apply_remote_lock(note_id, self.user.id);
        self.cache.write().await.put_note(note);
        Ok(())
    }

    pub async fn release_lock(&self, note_id: NoteId) -> Result<()> {
        {
            let locks = self.locks.lock().await;
            match locks.holder(note_id) {
                Some(holder) if holder == self.user.id => {}
                _ => return Err(SyncError::Lock(LockError::NotLockOwner)),
            }
        }

        let note = self
            .backend
            .unlock_note(self.group_id, note_id, self.user.id)
            .await?;
        self.locks.lock().await.apply_remote_unlock(note_id);
        self.cache.write().await.put_note(note);
        Ok(())
    }

    /// Break a lock the user believes is abandoned. The backend decides;
    /// there is no local override.
    pub async fn force_unlock(&self, note_id: NoteId) -> Result<()> {
        let note = self
            .backend
            .force_unlock_note(self.group_id, note_id, self.user.id)
            .await?;
        self.locks.lock().await.apply_remote_unlock(note_id);
        self.cache.write().await.put_note(note);
        Ok(())
    }

    pub async fn lock_holder(&self, note_id: NoteId) -> Option<UserId> {
        self.locks.lock().await.holder(note_id)
    }

    // --- Typing presence ---

    /// Call on every local keystroke. The outgoing notification is
    /// throttled; presence failures are logged, never surfaced.
    pub async fn begin_typing(&self, note_id: NoteId) {
        let should_send = {
            let mut typing = self.typing.lock().await;
            typing.start_typing(note_id, self.user.clone());
            typing.should_broadcast(note_id, self.user.id)
        };

        if should_send {
            if let Err(error) = self
                .backend
                .notify_typing(self.group_id, note_id, &self.user, true)
                .await
            {
                debug!(%error, "typing notification dropped");
            }
        }
    }

    pub async fn end_typing(&self, note_id: NoteId) {
        {
            let mut typing = self.typing.lock().await;
            typing.stop_typing(note_id, self.user.id);
            typing.reset_throttle(note_id, self.user.id);
        }

        if let Err(error) = self
            .backend
            .notify_typing(self.group_id, note_id, &self.user, false)
            .await
        {
            debug!(%error, "typing notification dropped");
        }
    }

    pub async fn active_typers(&self, note_id: NoteId) -> Vec<User> {
        self.typing
            .lock()
            .await
            .active_typers(note_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Tear the session down: unsubscribes the channel and stops routing
    /// events. In-flight mutation submissions settle against the backend on
    /// their own.
    pub async fn shutdown(self) {
        self.event_task.abort();
        debug!(group = %self.group_id.0, "session shut down");
    }
}

async fn event_loop(
    mut subscription: Subscription,
    group_id: GroupId,
    backend: Arc<dyn Backend>,
    cache: Arc<RwLock<EntityCache>>,
    locks: Arc<Mutex<LockCoordinator>>,
    typing: Arc<Mutex<TypingTracker>>,
) {
    let mut sweep = tokio::time::interval(std::time::Duration::from_secs(1));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            item = subscription.recv() => match item {
                Some(ChannelItem::ResyncNeeded) => {
                    resync(group_id, &backend, &cache, &locks).await;
                }
                Some(ChannelItem::Event(event)) => {
                    route_event(&event, &cache, &locks, &typing).await;
                }
                None => break,
            },
            _ = sweep.tick() => {
                typing.lock().await.sweep();
            }
        }
    }
    debug!(group = %group_id.0, "event loop ended");
}

async fn resync(
    group_id: GroupId,
    backend: &Arc<dyn Backend>,
    cache: &Arc<RwLock<EntityCache>>,
    locks: &Arc<Mutex<LockCoordinator>>,
) {
    match backend.fetch_group(group_id).await {
        Ok(snapshot) => {
            let holders: Vec<(NoteId, UserId)> = snapshot
                .notes
                .iter()
                .filter_map(|n| n.locked_by.map(|holder| (n.id, holder)))
                .collect();
            locks.lock().await.rebuild(holders);
            cache.write().await.resync(snapshot);
            debug!(group = %group_id.0, "resynced from snapshot");
        }
        Err(error) => {
            // The next reconnect will request another snapshot.
            warn!(group = %group_id.0, %error, "resync fetch failed");
        }
    }
}

async fn route_event(
    event: &ServerEvent,
    cache: &Arc<RwLock<EntityCache>>,
    locks: &Arc<Mutex<LockCoordinator>>,
    typing: &Arc<Mutex<TypingTracker>>,
) {
    match event {
        ServerEvent::NoteLocked { note_id, locked_by } => {
            locks.lock().await.apply_remote_lock(*note_id, *locked_by);
        }
        ServerEvent::NoteUnlocked { note_id } => {
            locks.lock().await.apply_remote_unlock(*note_id);
        }
        ServerEvent::NoteDeleted { note_id } => {
            locks.lock().await.apply_remote_unlock(*note_id);
        }
        ServerEvent::UserTyping { note_id, user, .. } => {
            typing.lock().await.start_typing(*note_id, user.clone());
        }
        ServerEvent::UserStoppedTyping { note_id, user_id } => {
            typing.lock().await.stop_typing(*note_id, *user_id);
        }
        _ => {}
    }

    let applied = cache.write().await.apply(event);
    if applied == Applied::Stale {
        debug!("discarded stale or duplicate event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Connector, EventStream, GroupSnapshot, ServerAck};
    use async_trait::async_trait;
    use futures_util::StreamExt;

    /// Connector whose stream stays open and never yields.
    struct IdleConnector;

    #[async_trait]
    impl Connector for IdleConnector {
        async fn connect(&self, _group_id: GroupId) -> Result<EventStream> {
            Ok(futures::stream::pending().boxed())
        }
    }

    /// Backend that grants every lock request and echoes notes.
    struct GrantingBackend;

    #[async_trait]
    impl Backend for GrantingBackend {
        async fn fetch_group(&self, _group_id: GroupId) -> Result<GroupSnapshot> {
            Ok(GroupSnapshot::default())
        }

        async fn submit(&self, _group_id: GroupId, _mutation: &Mutation) -> Result<ServerAck> {
            Ok(ServerAck::Deleted)
        }

        async fn lock_note(
            &self,
            group_id: GroupId,
            note_id: NoteId,
            user: UserId,
        ) -> Result<Note> {
            let mut note = Note::new(group_id, "nota");
            note.id = note_id;
            note.locked_by = Some(user);
            Ok(note)
        }

        async fn unlock_note(
            &self,
            group_id: GroupId,
            note_id: NoteId,
            _user: UserId,
        ) -> Result<Note> {
            let mut note = Note::new(group_id, "nota");
            note.id = note_id;
            Ok(note)
        }

        async fn force_unlock_note(
            &self,
            group_id: GroupId,
            note_id: NoteId,
            user: UserId,
        ) -> Result<Note> {
            self.unlock_note(group_id, note_id, user).await
        }

        async fn notify_typing(
            &self,
            _group_id: GroupId,
            _note_id: NoteId,
            _user: &User,
            _active: bool,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn session(group: GroupId, user: User) -> GroupSession {
        let manager = ConnectionManager::new(Arc::new(IdleConnector), SyncConfig::default());
        GroupSession::start(
            group,
            user,
            Arc::new(GrantingBackend),
            &manager,
            SyncConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_edit_rejected_while_locked_by_other() {
        let group = GroupId::new();
        let ana = User::new(UserId::new(), "ana", "ana@example.com");
        let bruno = UserId::new();
        let session = session(group, ana);

        let note = Note::new(group, "Acta");
        session.cache.write().await.put_note(note.clone());
        session
            .locks
            .lock()
            .await
            .apply_remote_lock(note.id, bruno);

        let err = session.edit_note(note.id, "intento").await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Lock(LockError::AlreadyLocked { holder }) if holder == bruno
        ));

        // The optimistic path was never reached.
        assert_eq!(
            session.cache.read().await.get_note(note.id).unwrap().content,
            ""
        );
    }

    #[tokio::test]
    async fn test_request_lock_fast_fails_on_known_holder() {
        let group = GroupId::new();
        let ana = User::new(UserId::new(), "ana", "ana@example.com");
        let bruno = UserId::new();
        let session = session(group, ana);

        let note_id = NoteId::new();
        session
            .locks
            .lock()
            .await
            .apply_remote_lock(note_id, bruno);

        let err = session.request_lock(note_id).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Lock(LockError::AlreadyLocked { holder }) if holder == bruno
        ));
    }

    #[tokio::test]
    async fn test_lock_round_trip_updates_state() {
        let group = GroupId::new();
        let ana = User::new(UserId::new(), "ana", "ana@example.com");
        let ana_id = ana.id;
        let session = session(group, ana);

        let note_id = NoteId::new();
        session.request_lock(note_id).await.unwrap();
        assert_eq!(session.lock_holder(note_id).await, Some(ana_id));
        assert_eq!(
            session
                .cache
                .read()
                .await
                .get_note(note_id)
                .unwrap()
                .locked_by,
            Some(ana_id)
        );

        session.release_lock(note_id).await.unwrap();
        assert_eq!(session.lock_holder(note_id).await, None);
    }

    #[tokio::test]
    async fn test_release_requires_holding_the_lock() {
        let group = GroupId::new();
        let ana = User::new(UserId::new(), "ana", "ana@example.com");
        let session = session(group, ana);

        let err = session.release_lock(NoteId::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Lock(LockError::NotLockOwner)));
    }
}
