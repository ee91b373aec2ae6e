/// Backend REST seam. The engine talks to the backend through the `Backend`
/// trait so tests can substitute an in-memory implementation; `HttpBackend`
/// is the production client and owns the mapping from HTTP status codes to
/// the error taxonomy.
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::{
    Board, GroupId, GroupSnapshot, LockError, Mutation, Note, NoteId, Result, SyncError, Task,
    User, UserId,
};

/// Authoritative server state returned by an acknowledged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerAck {
    Board(Board),
    Task(Task),
    Note(Note),
    Deleted,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch the full current state of a group. Used on every (re)connect to
    /// close the gap the channel cannot replay.
    async fn fetch_group(&self, group_id: GroupId) -> Result<GroupSnapshot>;

    /// Submit one mutation and return the authoritative result.
    async fn submit(&self, group_id: GroupId, mutation: &Mutation) -> Result<ServerAck>;

    /// Acquire the note lock for `user`. The backend owns lock lifetimes
    /// (TTL expiry included); a denial carries the current holder.
    async fn lock_note(&self, group_id: GroupId, note_id: NoteId, user: UserId) -> Result<Note>;

    async fn unlock_note(&self, group_id: GroupId, note_id: NoteId, user: UserId) -> Result<Note>;

    /// Break a lock the user believes is stale. Always a backend decision,
    /// never a local override.
    async fn force_unlock_note(
        &self,
        group_id: GroupId,
        note_id: NoteId,
        user: UserId,
    ) -> Result<Note>;

    /// Publish a typing indicator for fan-out to the group channel.
    async fn notify_typing(
        &self,
        group_id: GroupId,
        note_id: NoteId,
        user: &User,
        active: bool,
    ) -> Result<()>;
}

/// Body of a 423 Locked rejection.
#[derive(Debug, Deserialize)]
struct LockedBody {
    #[serde(rename = "bloqueada_por")]
    locked_by: UserId,
}

pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Map a non-success response onto the taxonomy: 400/422 validation,
    /// 409 conflict, 423 lock denial, 5xx transient.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!(%status, "backend rejected request");

        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(SyncError::Validation(body))
            }
            StatusCode::CONFLICT => Err(SyncError::Conflict(body)),
            StatusCode::LOCKED => match serde_json::from_str::<LockedBody>(&body) {
                Ok(locked) => Err(SyncError::Lock(LockError::AlreadyLocked {
                    holder: locked.locked_by,
                })),
                Err(_) => Err(SyncError::Conflict(body)),
            },
            s if s.is_server_error() => {
                Err(SyncError::Transient(format!("server error {s}: {body}")))
            }
            s => Err(SyncError::Channel(format!("unexpected status {s}: {body}"))),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))
    }

    async fn send_json<B, T>(&self, method: reqwest::Method, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .request(method, self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(path))
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch_group(&self, group_id: GroupId) -> Result<GroupSnapshot> {
        self.get_json(&format!("groups/{}", group_id.0)).await
    }

    async fn submit(&self, group_id: GroupId, mutation: &Mutation) -> Result<ServerAck> {
        use reqwest::Method;
        let g = group_id.0;

        match mutation {
            Mutation::CreateBoard { board } => {
                let board: Board = self
                    .send_json(Method::POST, &format!("groups/{g}/boards"), board)
                    .await?;
                Ok(ServerAck::Board(board))
            }
            Mutation::UpdateBoard { board } => {
                let path = format!("groups/{g}/boards/{}", board.id.0);
                let board: Board = self.send_json(Method::PUT, &path, board).await?;
                Ok(ServerAck::Board(board))
            }
            Mutation::DeleteBoard { board_id } => {
                self.delete(&format!("groups/{g}/boards/{}", board_id.0))
                    .await?;
                Ok(ServerAck::Deleted)
            }
            Mutation::CreateTask { task } => {
                let task: Task = self
                    .send_json(Method::POST, &format!("groups/{g}/tasks"), task)
                    .await?;
                Ok(ServerAck::Task(task))
            }
            Mutation::UpdateTask { task } => {
                let path = format!("groups/{g}/tasks/{}", task.id.0);
                let task: Task = self.send_json(Method::PUT, &path, task).await?;
                Ok(ServerAck::Task(task))
            }
            Mutation::MoveTask {
                task_id,
                to_board,
                position,
            } => {
                let path = format!("groups/{g}/tasks/{}/move", task_id.0);
                let body = json!({ "to_board": to_board, "position": position });
                let task: Task = self.send_json(Method::POST, &path, &body).await?;
                Ok(ServerAck::Task(task))
            }
            Mutation::DeleteTask { task_id } => {
                self.delete(&format!("groups/{g}/tasks/{}", task_id.0))
                    .await?;
                Ok(ServerAck::Deleted)
            }
            Mutation::CreateNote { note } => {
                let note: Note = self
                    .send_json(Method::POST, &format!("groups/{g}/notes"), note)
                    .await?;
                Ok(ServerAck::Note(note))
            }
            Mutation::UpdateNoteContent {
                note_id,
                content,
                base_version,
            } => {
                let path = format!("groups/{g}/notes/{}/content", note_id.0);
                let body = json!({ "content": content, "version": base_version });
                let note: Note = self.send_json(Method::PUT, &path, &body).await?;
                Ok(ServerAck::Note(note))
            }
            Mutation::DeleteNote { note_id } => {
                self.delete(&format!("groups/{g}/notes/{}", note_id.0))
                    .await?;
                Ok(ServerAck::Deleted)
            }
        }
    }

    async fn lock_note(&self, group_id: GroupId, note_id: NoteId, user: UserId) -> Result<Note> {
        let path = format!("groups/{}/notes/{}/lock", group_id.0, note_id.0);
        self.send_json(reqwest::Method::POST, &path, &json!({ "user_id": user }))
            .await
    }

    async fn unlock_note(&self, group_id: GroupId, note_id: NoteId, user: UserId) -> Result<Note> {
        let path = format!("groups/{}/notes/{}/unlock", group_id.0, note_id.0);
        self.send_json(reqwest::Method::POST, &path, &json!({ "user_id": user }))
            .await
    }

    async fn force_unlock_note(
        &self,
        group_id: GroupId,
        note_id: NoteId,
        user: UserId,
    ) -> Result<Note> {
        let path = format!("groups/{}/notes/{}/force-unlock", group_id.0, note_id.0);
        self.send_json(reqwest::Method::POST, &path, &json!({ "user_id": user }))
            .await
    }

    async fn notify_typing(
        &self,
        group_id: GroupId,
        note_id: NoteId,
        user: &User,
        active: bool,
    ) -> Result<()> {
        let path = format!("groups/{}/notes/{}/typing", group_id.0, note_id.0);
        let body = json!({ "user": user, "active": active });
        let response = self
            .client
            .post(self.url(&path))
            .json(&body)
            .send()
            .await
            .map_err(|e| SyncError::Transient(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }
}
