//! Live chat over the `chat_sessions` / `chat_messages` tables.
//!
//! The transport that pushes new rows is external. Rows may arrive in any
//! order, so [`ChatTranscript`] orders by the stored `created_at` (then id)
//! and drops duplicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::backend::{BackendError, Filter, Query, RowStore};
use crate::state_store::{CHAT_GUEST_ID, CHAT_SESSION_ID, StateError, StateStore};

pub const CHAT_SESSIONS_TABLE: &str = "chat_sessions";
pub const CHAT_MESSAGES_TABLE: &str = "chat_messages";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("could not decode chat row: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("message is empty")]
    EmptyMessage,

    #[error("chat session {0} not found")]
    SessionNotFound(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Active,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub guest_identifier: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl ChatSession {
    /// Short form shown in the admin list.
    pub fn guest_label(&self) -> &str {
        let end = self.guest_identifier.char_indices().nth(8).map_or(self.guest_identifier.len(), |(i, _)| i);
        &self.guest_identifier[..end]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub content: String,
    pub sender_type: SenderType,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct NewSession<'a> {
    guest_identifier: &'a str,
    status: SessionStatus,
}

#[derive(Serialize)]
struct NewMessage<'a> {
    session_id: Uuid,
    content: &'a str,
    sender_type: SenderType,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatTranscript {
    messages: Vec<ChatMessage>,
}

impl ChatTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Inserts in `(created_at, id)` order. Returns false for a message already held.
    pub fn push(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        let key = (message.created_at, message.id);
        let at = self.messages.partition_point(|m| (m.created_at, m.id) < key);
        self.messages.insert(at, message);
        true
    }

    /// A pushed insert notification, as the raw row.
    pub fn push_row(&mut self, row: Value) -> Result<bool, serde_json::Error> {
        Ok(self.push(serde_json::from_value(row)?))
    }
}

impl FromIterator<ChatMessage> for ChatTranscript {
    fn from_iter<I: IntoIterator<Item = ChatMessage>>(iter: I) -> Self {
        let mut transcript = ChatTranscript::new();
        for message in iter {
            transcript.push(message);
        }
        transcript
    }
}

fn first_row<T: serde::de::DeserializeOwned>(rows: Vec<Value>) -> Result<Option<T>, ChatError> {
    match rows.into_iter().next() {
        Some(row) => Ok(Some(serde_json::from_value(row)?)),
        None => Ok(None),
    }
}

pub struct ChatService<S, K> {
    rows: S,
    state: K,
}

impl<S: RowStore, K: StateStore> ChatService<S, K> {
    pub fn new(rows: S, state: K) -> Self {
        Self { rows, state }
    }

    /// This visitor's identifier, created on first use and kept.
    pub fn guest_id(&self) -> Result<String, ChatError> {
        if let Some(id) = self.state.get(&CHAT_GUEST_ID).filter(|id| !id.is_empty()) {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        self.state.set(&CHAT_GUEST_ID, &id)?;
        Ok(id)
    }

    pub fn current_session(&self) -> Option<Uuid> {
        self.state.get(&CHAT_SESSION_ID).and_then(|id| id.parse().ok())
    }

    async fn ensure_session(&self) -> Result<Uuid, ChatError> {
        if let Some(id) = self.current_session() {
            return Ok(id);
        }
        let guest_id = self.guest_id()?;
        let row = serde_json::to_value(NewSession { guest_identifier: &guest_id, status: SessionStatus::Open })?;
        let session: ChatSession = first_row(self.rows.insert(CHAT_SESSIONS_TABLE, vec![row]).await?)?
            .ok_or_else(|| BackendError::Status { status: 500, message: "no chat session returned".into() })?;
        self.state.set(&CHAT_SESSION_ID, &session.id.to_string())?;
        info!(session = %session.id, "chat session started");
        Ok(session.id)
    }

    async fn insert_message(
        &self,
        session_id: Uuid,
        content: &str,
        sender_type: SenderType,
    ) -> Result<ChatMessage, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let row = serde_json::to_value(NewMessage { session_id, content, sender_type })?;
        first_row(self.rows.insert(CHAT_MESSAGES_TABLE, vec![row]).await?)?
            .ok_or_else(|| BackendError::Status { status: 500, message: "no chat message returned".into() }.into())
    }

    /// Guest side. The first message opens a session.
    pub async fn send(&self, content: &str) -> Result<ChatMessage, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let session_id = self.ensure_session().await?;
        self.insert_message(session_id, content, SenderType::User).await
    }

    /// Guest side: the current session's messages, oldest first.
    pub async fn history(&self) -> Result<ChatTranscript, ChatError> {
        match self.current_session() {
            Some(id) => self.messages(id).await,
            None => Ok(ChatTranscript::new()),
        }
    }

    pub async fn messages(&self, session_id: Uuid) -> Result<ChatTranscript, ChatError> {
        let query = Query::new()
            .filter(Filter::eq("session_id", session_id.to_string()))
            .order_asc("created_at");
        let rows = self.rows.select(CHAT_MESSAGES_TABLE, &query).await?;
        let messages = rows.into_iter().map(serde_json::from_value).collect::<Result<Vec<ChatMessage>, _>>()?;
        Ok(messages.into_iter().collect())
    }

    /// Admin side: open and active sessions, newest first.
    pub async fn open_sessions(&self) -> Result<Vec<ChatSession>, ChatError> {
        let query = Query::new()
            .filter(Filter::any_of("status", vec![Value::from("open"), Value::from("active")]))
            .order_desc("created_at");
        let rows = self.rows.select(CHAT_SESSIONS_TABLE, &query).await?;
        Ok(rows.into_iter().map(serde_json::from_value).collect::<Result<Vec<ChatSession>, _>>()?)
    }

    /// Admin opens a session. An `open` session becomes `active`.
    pub async fn open_session(&self, session_id: Uuid) -> Result<(ChatSession, ChatTranscript), ChatError> {
        let query = Query::new().filter(Filter::eq("id", session_id.to_string())).limit(1);
        let mut session: ChatSession = first_row(self.rows.select(CHAT_SESSIONS_TABLE, &query).await?)?
            .ok_or(ChatError::SessionNotFound(session_id))?;
        if session.status == SessionStatus::Open {
            session = self.set_status(session_id, SessionStatus::Active).await?;
        }
        let transcript = self.messages(session_id).await?;
        Ok((session, transcript))
    }

    pub async fn reply(&self, session_id: Uuid, content: &str) -> Result<ChatMessage, ChatError> {
        self.insert_message(session_id, content, SenderType::Admin).await
    }

    pub async fn set_status(&self, session_id: Uuid, status: SessionStatus) -> Result<ChatSession, ChatError> {
        let rows = self
            .rows
            .update(
                CHAT_SESSIONS_TABLE,
                &[Filter::eq("id", session_id.to_string())],
                serde_json::json!({ "status": status.as_str() }),
            )
            .await?;
        info!(session = %session_id, status = status.as_str(), "chat session status changed");
        first_row(rows)?.ok_or(ChatError::SessionNotFound(session_id))
    }
}
