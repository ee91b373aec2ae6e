/// Optimistic mutation queue. Local intents are applied to the cache on
/// admission, then submitted to the backend in enqueue order per entity;
/// distinct entities submit concurrently. Acks reconcile the cache to the
/// authoritative server value; terminal rejections roll the optimistic
/// change back and abort queued successors for the same entity; transient
/// failures retry with bounded exponential backoff.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use crate::{
    Backend, Board, BoardId, EntityCache, GroupId, Note, NoteId, Result, ServerAck, ServerEvent,
    SyncConfig, SyncError, Task, TaskId,
};

/// A local change to one entity, queued for submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    CreateBoard { board: Board },
    UpdateBoard { board: Board },
    DeleteBoard { board_id: BoardId },
    CreateTask { task: Task },
    UpdateTask { task: Task },
    MoveTask {
        task_id: TaskId,
        to_board: BoardId,
        position: i64,
    },
    DeleteTask { task_id: TaskId },
    CreateNote { note: Note },
    UpdateNoteContent {
        note_id: NoteId,
        content: String,
        base_version: u64,
    },
    DeleteNote { note_id: NoteId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Board,
    Task,
    Note,
}

/// Ordering key: mutations sharing a key are never reordered or coalesced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: uuid::Uuid,
}

impl Mutation {
    pub fn key(&self) -> EntityKey {
        match self {
            Mutation::CreateBoard { board } | Mutation::UpdateBoard { board } => EntityKey {
                kind: EntityKind::Board,
                id: board.id.0,
            },
            Mutation::DeleteBoard { board_id } => EntityKey {
                kind: EntityKind::Board,
                id: board_id.0,
            },
            Mutation::CreateTask { task } | Mutation::UpdateTask { task } => EntityKey {
                kind: EntityKind::Task,
                id: task.id.0,
            },
            Mutation::MoveTask { task_id, .. } | Mutation::DeleteTask { task_id } => EntityKey {
                kind: EntityKind::Task,
                id: task_id.0,
            },
            Mutation::CreateNote { note } => EntityKey {
                kind: EntityKind::Note,
                id: note.id.0,
            },
            Mutation::UpdateNoteContent { note_id, .. } | Mutation::DeleteNote { note_id } => {
                EntityKey {
                    kind: EntityKind::Note,
                    id: note_id.0,
                }
            }
        }
    }

    /// Local checks for user-fixable mistakes, caught before the cache is
    /// touched.
    pub fn validate(&self) -> Result<()> {
        match self {
            Mutation::CreateBoard { board } | Mutation::UpdateBoard { board }
                if board.name.trim().is_empty() =>
            {
                Err(SyncError::Validation("board name must not be empty".into()))
            }
            Mutation::CreateTask { task } | Mutation::UpdateTask { task }
                if task.title.trim().is_empty() =>
            {
                Err(SyncError::Validation("task title must not be empty".into()))
            }
            Mutation::CreateNote { note } if note.title.trim().is_empty() => {
                Err(SyncError::Validation("note title must not be empty".into()))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationId(pub uuid::Uuid);

impl MutationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct MutationOutcome {
    pub id: MutationId,
    pub key: EntityKey,
    pub status: MutationStatus,
}

#[derive(Debug)]
pub enum MutationStatus {
    /// Acknowledged; the cache now holds the authoritative server value.
    Completed,
    /// Terminal rejection (or exhausted retries); the optimistic change was
    /// rolled back.
    Failed(SyncError),
    /// A preceding mutation for the same entity failed terminally; this one
    /// was never submitted because it was built on rolled-back state.
    Aborted,
}

/// Cache entry captured before an optimistic apply, for rollback.
#[derive(Debug, Clone)]
enum Snapshot {
    Board {
        prior: Option<Board>,
        cascaded: Vec<Task>,
    },
    Task {
        prior: Option<Task>,
    },
    Note {
        prior: Option<Note>,
    },
}

impl Snapshot {
    fn restore(self, key: EntityKey, cache: &mut EntityCache) {
        match self {
            Snapshot::Board { prior, cascaded } => {
                match prior {
                    Some(board) => cache.put_board(board),
                    None => {
                        cache.remove_board_cascade(BoardId(key.id));
                    }
                }
                for task in cascaded {
                    cache.put_task(task);
                }
            }
            Snapshot::Task { prior } => match prior {
                Some(task) => cache.put_task(task),
                None => {
                    cache.remove_task(TaskId(key.id));
                }
            },
            Snapshot::Note { prior } => match prior {
                Some(note) => cache.put_note(note),
                None => {
                    cache.remove_note(NoteId(key.id));
                }
            },
        }
    }
}

fn apply_optimistic(cache: &mut EntityCache, mutation: &Mutation) -> Result<Snapshot> {
    match mutation {
        Mutation::CreateBoard { board } => {
            let prior = cache.get_board(board.id).cloned();
            cache.put_board(board.clone());
            Ok(Snapshot::Board {
                prior,
                cascaded: Vec::new(),
            })
        }

        Mutation::UpdateBoard { board } => {
            let prior = cache
                .get_board(board.id)
                .cloned()
                .ok_or_else(|| SyncError::Validation("unknown board".into()))?;
            cache.put_board(board.clone());
            Ok(Snapshot::Board {
                prior: Some(prior),
                cascaded: Vec::new(),
            })
        }

        Mutation::DeleteBoard { board_id } => {
            let (prior, cascaded) = cache.remove_board_cascade(*board_id);
            let prior = prior.ok_or_else(|| SyncError::Validation("unknown board".into()))?;
            Ok(Snapshot::Board {
                prior: Some(prior),
                cascaded,
            })
        }

        Mutation::CreateTask { task } => {
            let prior = cache.get_task(task.id).cloned();
            cache.put_task(task.clone());
            Ok(Snapshot::Task { prior })
        }

        Mutation::UpdateTask { task } => {
            let prior = cache
                .get_task(task.id)
                .cloned()
                .ok_or_else(|| SyncError::Validation("unknown task".into()))?;
            cache.put_task(task.clone());
            Ok(Snapshot::Task { prior: Some(prior) })
        }

        Mutation::MoveTask {
            task_id,
            to_board,
            position,
        } => {
            let prior = cache
                .get_task(*task_id)
                .cloned()
                .ok_or_else(|| SyncError::Validation("unknown task".into()))?;
            // A move changes board and position atomically.
            let mut moved = prior.clone();
            moved.board_id = *to_board;
            moved.position = *position;
            cache.put_task(moved);
            Ok(Snapshot::Task { prior: Some(prior) })
        }

        Mutation::DeleteTask { task_id } => {
            let prior = cache
                .remove_task(*task_id)
                .ok_or_else(|| SyncError::Validation("unknown task".into()))?;
            Ok(Snapshot::Task { prior: Some(prior) })
        }

        Mutation::CreateNote { note } => {
            let prior = cache.get_note(note.id).cloned();
            cache.put_note(note.clone());
            Ok(Snapshot::Note { prior })
        }

        Mutation::UpdateNoteContent {
            note_id,
            content,
            base_version,
        } => {
            let prior = cache
                .get_note(*note_id)
                .cloned()
                .ok_or_else(|| SyncError::Validation("unknown note".into()))?;
            if prior.version != *base_version {
                return Err(SyncError::Conflict(format!(
                    "note is at version {}, edit was built against {}",
                    prior.version, base_version
                )));
            }
            let mut updated = prior.clone();
            updated.content = content.clone();
            cache.put_note(updated);
            Ok(Snapshot::Note { prior: Some(prior) })
        }

        Mutation::DeleteNote { note_id } => {
            let prior = cache
                .remove_note(*note_id)
                .ok_or_else(|| SyncError::Validation("unknown note".into()))?;
            Ok(Snapshot::Note { prior: Some(prior) })
        }
    }
}

/// Acks flow through the same revision guard as channel events, so a delayed
/// acknowledgement cannot regress state a newer event already delivered.
fn reconcile(cache: &mut EntityCache, ack: &ServerAck) {
    match ack {
        ServerAck::Board(board) => {
            cache.apply(&ServerEvent::BoardUpdated {
                board: board.clone(),
            });
        }
        ServerAck::Task(task) => {
            cache.apply(&ServerEvent::TaskUpdated { task: task.clone() });
        }
        ServerAck::Note(note) => {
            cache.apply(&ServerEvent::NoteUpdated { note: note.clone() });
        }
        ServerAck::Deleted => {}
    }
}

#[derive(Debug)]
struct Pending {
    id: MutationId,
    mutation: Mutation,
    snapshot: Snapshot,
}

struct Done {
    key: EntityKey,
    result: Result<ServerAck>,
}

/// An enqueue request awaiting admission by the dispatcher.
struct Enqueue {
    mutation: Mutation,
    reply: oneshot::Sender<Result<MutationId>>,
}

/// Handle to the queue. Cloneable; dropping every clone shuts the
/// dispatcher down once in-flight submissions have settled.
#[derive(Clone)]
pub struct MutationQueue {
    cmd_tx: mpsc::UnboundedSender<Enqueue>,
}

impl MutationQueue {
    /// Spawn the dispatcher. Returns the handle plus the stream of outcomes
    /// the UI listens on.
    pub fn spawn(
        group_id: GroupId,
        cache: Arc<RwLock<EntityCache>>,
        backend: Arc<dyn Backend>,
        config: SyncConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MutationOutcome>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            group_id,
            cache,
            backend,
            config,
            cmd_rx,
            done_tx,
            done_rx,
            outcome_tx,
            queues: HashMap::new(),
            in_flight: HashMap::new(),
            accepting: true,
        };
        tokio::spawn(dispatcher.run());

        (MutationQueue { cmd_tx }, outcome_rx)
    }

    /// Validate, then hand the mutation to the dispatcher, which applies it
    /// optimistically and queues it for submission. The optimistic apply
    /// happens inside the dispatcher so that apply, queue membership and any
    /// rollback are serialized by one task and a concurrent failure for the
    /// same entity can never interleave between them. The returned id
    /// correlates with a later outcome.
    pub async fn enqueue(&self, mutation: Mutation) -> Result<MutationId> {
        mutation.validate()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Enqueue {
                mutation,
                reply: reply_tx,
            })
            .map_err(|_| SyncError::Channel("mutation queue is shut down".into()))?;
        reply_rx
            .await
            .map_err(|_| SyncError::Channel("mutation queue is shut down".into()))?
    }
}

struct Dispatcher {
    group_id: GroupId,
    cache: Arc<RwLock<EntityCache>>,
    backend: Arc<dyn Backend>,
    config: SyncConfig,
    cmd_rx: mpsc::UnboundedReceiver<Enqueue>,
    done_tx: mpsc::UnboundedSender<Done>,
    done_rx: mpsc::UnboundedReceiver<Done>,
    outcome_tx: mpsc::UnboundedSender<MutationOutcome>,
    /// Waiting mutations, FIFO per entity.
    queues: HashMap<EntityKey, VecDeque<Pending>>,
    /// The mutation currently being submitted per entity.
    in_flight: HashMap<EntityKey, Pending>,
    accepting: bool,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            if !self.accepting && self.in_flight.is_empty() {
                break;
            }

            tokio::select! {
                // Enqueues are admitted before completions so a successor
                // enqueued before a failure is known to the abort pass.
                biased;

                cmd = self.cmd_rx.recv(), if self.accepting => match cmd {
                    Some(Enqueue { mutation, reply }) => {
                        let admitted = self.admit(mutation).await;
                        let _ = reply.send(admitted);
                    }
                    None => self.accepting = false,
                },
                done = self.done_rx.recv() => {
                    if let Some(done) = done {
                        self.on_done(done).await;
                    }
                }
            }
        }
        debug!("mutation dispatcher stopped");
    }

    /// Apply a mutation optimistically against current cache state, capture
    /// its rollback snapshot, and register it in its entity's queue.
    async fn admit(&mut self, mutation: Mutation) -> Result<MutationId> {
        let snapshot = {
            let mut cache = self.cache.write().await;
            apply_optimistic(&mut cache, &mutation)?
        };

        let id = MutationId::new();
        let key = mutation.key();
        self.queues.entry(key).or_default().push_back(Pending {
            id,
            mutation,
            snapshot,
        });
        self.maybe_submit(key);
        Ok(id)
    }

    /// Start the next waiting mutation for `key` unless one is in flight.
    fn maybe_submit(&mut self, key: EntityKey) {
        if self.in_flight.contains_key(&key) {
            return;
        }
        let Some(queue) = self.queues.get_mut(&key) else {
            return;
        };
        let Some(pending) = queue.pop_front() else {
            return;
        };

        let mutation = pending.mutation.clone();
        self.in_flight.insert(key, pending);

        let backend = self.backend.clone();
        let group_id = self.group_id;
        let config = self.config.clone();
        let done_tx = self.done_tx.clone();

        tokio::spawn(async move {
            let result = submit_with_retry(&*backend, group_id, &mutation, &config).await;
            let _ = done_tx.send(Done { key, result });
        });
    }

    async fn on_done(&mut self, done: Done) {
        let key = done.key;
        let Some(pending) = self.in_flight.remove(&key) else {
            return;
        };

        match done.result {
            Ok(ack) => {
                {
                    let mut cache = self.cache.write().await;
                    reconcile(&mut cache, &ack);
                }
                self.emit(pending.id, key, MutationStatus::Completed);
                self.maybe_submit(key);
            }
            Err(error) => {
                warn!(?key, %error, "mutation failed, rolling back");
                let successors: Vec<Pending> = self
                    .queues
                    .remove(&key)
                    .map(|q| q.into_iter().collect())
                    .unwrap_or_default();

                {
                    let mut cache = self.cache.write().await;
                    // Snapshots restore newest-first so the entity ends at
                    // its state before the failed mutation.
                    let mut aborted = Vec::new();
                    for pending in successors.into_iter().rev() {
                        aborted.push(pending.id);
                        pending.snapshot.restore(key, &mut cache);
                    }
                    pending.snapshot.restore(key, &mut cache);
                    drop(cache);

                    for id in aborted.into_iter().rev() {
                        self.emit(id, key, MutationStatus::Aborted);
                    }
                }
                self.emit(pending.id, key, MutationStatus::Failed(error));
            }
        }
    }

    fn emit(&self, id: MutationId, key: EntityKey, status: MutationStatus) {
        let _ = self.outcome_tx.send(MutationOutcome { id, key, status });
    }
}

async fn submit_with_retry(
    backend: &dyn Backend,
    group_id: GroupId,
    mutation: &Mutation,
    config: &SyncConfig,
) -> Result<ServerAck> {
    let mut attempt = 0u32;
    let mut delay = config.retry_base;

    loop {
        match backend.submit(group_id, mutation).await {
            Ok(ack) => return Ok(ack),
            Err(error) if error.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                debug!(%error, attempt, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, config.retry_cap);
            }
            Err(error) => return Err(error),
        }
    }
}
