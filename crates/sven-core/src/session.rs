// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The conversation domain model (Session/Message/Part/Summary/RevertInfo)
//! and the persistent, filesystem-backed Session Store.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use uuid::Uuid;

use crate::snapshot::SnapshotStore;
use crate::status::SessionStatus;

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolUseStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// A tagged content unit within a `Message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        status: ToolUseStatus,
    },
    ToolResult {
        tool_id: String,
        output: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        is_compacted: bool,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        metadata: Option<Value>,
    },
    Reasoning {
        text: String,
    },
    Image {
        media_type: String,
        data: String,
    },
    Patch {
        hash: String,
        files: Vec<String>,
    },
    StepStart {
        pre_hash: Option<String>,
    },
    StepFinish {
        tokens_in: u64,
        tokens_out: u64,
        cost: f64,
    },
}

impl Part {
    pub fn text(s: impl Into<String>) -> Self {
        Part::Text { text: s.into() }
    }

    pub fn as_tool_use(&self) -> Option<(&str, &str, &Value)> {
        match self {
            Part::ToolUse { id, name, input, .. } => Some((id, name, input)),
            _ => None,
        }
    }

    pub fn as_tool_result_id(&self) -> Option<&str> {
        match self {
            Part::ToolResult { tool_id, .. } => Some(tool_id),
            _ => None,
        }
    }
}

/// One message in a session's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default = "short_id")]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub tokens_cache: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub is_summary: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: short_id(),
            role,
            parts: vec![Part::text(content.clone())],
            content,
            created_at: now(),
            updated_at: now(),
            tokens_in: 0,
            tokens_out: 0,
            tokens_cache: 0,
            cost: 0.0,
            agent: None,
            finish_reason: None,
            error: None,
            is_summary: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Every `tool_use` id in this message's parts, in order.
    pub fn tool_use_ids(&self) -> Vec<String> {
        self.parts.iter().filter_map(|p| p.as_tool_use().map(|(id, ..)| id.to_string())).collect()
    }

    /// Every `tool_id` referenced by a `tool_result` part, in order.
    pub fn tool_result_ids(&self) -> Vec<String> {
        self.parts.iter().filter_map(|p| p.as_tool_result_id().map(|s| s.to_string())).collect()
    }

    pub fn approx_tokens(&self) -> usize {
        self.content.len() / 4 + self.parts.iter().map(part_approx_tokens).sum::<usize>()
    }
}

fn part_approx_tokens(p: &Part) -> usize {
    match p {
        Part::Text { text } => text.len() / 4,
        Part::ToolResult { output, .. } => output.len() / 4,
        Part::Reasoning { text } => text.len() / 4,
        _ => 0,
    }
}

/// Aggregate counters tracked alongside a session's message list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub file_count: u64,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub tool_calls: u64,
    #[serde(default)]
    pub cost: f64,
}

impl Summary {
    fn record_message(&mut self, msg: &Message) {
        self.tokens_in += msg.tokens_in;
        self.tokens_out += msg.tokens_out;
        self.cost += msg.cost;
        for part in &msg.parts {
            if let Part::ToolUse { .. } = part {
                self.tool_calls += 1;
            }
            if let Part::Patch { files, .. } = part {
                for f in files {
                    if !self.files.contains(f) {
                        self.files.push(f.clone());
                    }
                }
                self.file_count = self.files.len() as u64;
            }
        }
    }
}

/// Where a session is currently pinned by a revert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertInfo {
    pub message_id: String,
    pub snapshot_hash: String,
    #[serde(default)]
    pub diff: Option<String>,
}

/// A persisted conversation: identity, history, and running aggregates.
/// `status` is transient — it is never written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "short_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub summary: Summary,
    #[serde(skip)]
    pub status: Option<SessionStatus>,
    #[serde(default)]
    pub revert: Option<RevertInfo>,
    #[serde(default = "now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "now")]
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(agent: impl Into<String>, model: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: short_id(),
            title: String::new(),
            agent: agent.into(),
            model: model.into(),
            provider: provider.into(),
            parent_id: None,
            messages: Vec::new(),
            summary: Summary::default(),
            status: None,
            revert: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    /// Title has never been set by the user or a prior title-generation run.
    pub fn has_placeholder_title(&self) -> bool {
        let t = self.title.trim();
        t.is_empty() || t == "New Session" || t.starts_with("Session ")
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] crate::snapshot::SnapshotError),
}

/// Durable, filesystem-backed conversation store. One JSON document per
/// session, named `<id>.json`, under `dir`. All documents are loaded by a
/// background task spawned at construction; operations await a single-shot
/// latch rather than blocking the caller on startup.
pub struct SessionStore {
    dir: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
    loaded: Arc<OnceCell<()>>,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Arc<Self> {
        let store = Arc::new(Self { dir, sessions: RwLock::new(HashMap::new()), loaded: Arc::new(OnceCell::new()) });
        let bg = store.clone();
        tokio::spawn(async move {
            let _ = bg.load_all().await;
            let _ = bg.loaded.set(());
        });
        store
    }

    async fn ensure_loaded(&self) {
        self.loaded.get_or_init(|| async { self.load_all().await.unwrap_or(()) }).await;
    }

    async fn load_all(&self) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut loaded = HashMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bytes) = tokio::fs::read(&path).await {
                if let Ok(session) = serde_json::from_slice::<Session>(&bytes) {
                    loaded.insert(session.id.clone(), session);
                }
            }
        }
        *self.sessions.write().await = loaded;
        Ok(())
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Write-then-rename so a crash mid-write never corrupts the prior file.
    async fn persist(&self, session: &Session) -> Result<(), SessionError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let final_path = self.path_for(&session.id);
        let tmp_path = self.dir.join(format!("{}.json.tmp-{}", session.id, Uuid::new_v4().simple()));
        let bytes = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    pub async fn create(&self, agent: impl Into<String>, model: impl Into<String>, provider: impl Into<String>) -> Result<Session, SessionError> {
        self.ensure_loaded().await;
        let session = Session::new(agent, model, provider);
        self.persist(&session).await?;
        self.sessions.write().await.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.ensure_loaded().await;
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Session> {
        self.ensure_loaded().await;
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn delete(&self, id: &str) -> Result<(), SessionError> {
        self.ensure_loaded().await;
        self.sessions.write().await.remove(id);
        let path = self.path_for(id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    pub async fn add_message(&self, session_id: &str, mut message: Message) -> Result<Message, SessionError> {
        self.ensure_loaded().await;
        let mut guard = self.sessions.write().await;
        let session = guard.get_mut(session_id).ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if message.id.is_empty() {
            message.id = short_id();
        }
        message.created_at = now();
        session.summary.record_message(&message);
        session.messages.push(message.clone());
        session.updated_at = now();
        let snapshot = session.clone();
        drop(guard);
        self.persist(&snapshot).await?;
        Ok(message)
    }

    pub async fn update_message(&self, session_id: &str, message_id: &str, mutator: impl FnOnce(&mut Message)) -> Result<(), SessionError> {
        self.ensure_loaded().await;
        let mut guard = self.sessions.write().await;
        let session = guard.get_mut(session_id).ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let msg = session
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| SessionError::NotFound(message_id.to_string()))?;
        mutator(msg);
        msg.updated_at = now();
        session.updated_at = now();
        let snapshot = session.clone();
        drop(guard);
        self.persist(&snapshot).await
    }

    pub async fn replace_messages(&self, session_id: &str, messages: Vec<Message>) -> Result<(), SessionError> {
        self.ensure_loaded().await;
        let mut guard = self.sessions.write().await;
        let session = guard.get_mut(session_id).ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.messages = messages;
        session.updated_at = now();
        let snapshot = session.clone();
        drop(guard);
        self.persist(&snapshot).await
    }

    pub async fn update_title(&self, session_id: &str, title: impl Into<String>) -> Result<(), SessionError> {
        self.ensure_loaded().await;
        let mut guard = self.sessions.write().await;
        let session = guard.get_mut(session_id).ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.title = title.into();
        session.updated_at = now();
        let snapshot = session.clone();
        drop(guard);
        self.persist(&snapshot).await
    }

    /// Transient: updates the in-memory status only, never persisted.
    pub async fn update_status(&self, session_id: &str, status: Option<SessionStatus>) -> Result<(), SessionError> {
        self.ensure_loaded().await;
        let mut guard = self.sessions.write().await;
        let session = guard.get_mut(session_id).ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.status = status;
        Ok(())
    }

    pub async fn set_revert(&self, session_id: &str, info: RevertInfo) -> Result<(), SessionError> {
        self.ensure_loaded().await;
        let mut guard = self.sessions.write().await;
        let session = guard.get_mut(session_id).ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.revert = Some(info);
        session.updated_at = now();
        let snapshot = session.clone();
        drop(guard);
        self.persist(&snapshot).await
    }

    /// Collect every `patch` part at or after `message_id`, revert those
    /// files in the snapshot store, and pin the session at the last user
    /// message before (and including) the target.
    pub async fn revert(&self, session_id: &str, message_id: &str, snapshot: &SnapshotStore, current_hash: &str) -> Result<(), SessionError> {
        self.ensure_loaded().await;
        let session = self.get(session_id).await.ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let target_idx = session
            .messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| SessionError::NotFound(message_id.to_string()))?;

        let mut pin_message_id = message_id.to_string();
        for (idx, msg) in session.messages.iter().enumerate() {
            if idx < target_idx {
                continue;
            }
            for part in &msg.parts {
                if let Part::Patch { hash, files } = part {
                    snapshot.revert(hash, files).await?;
                }
            }
            if idx <= target_idx && msg.role == Role::User {
                pin_message_id = msg.id.clone();
            }
        }
        // Prefer the nearest user message at or before the target as the pin.
        if let Some(last_user) = session.messages[..=target_idx].iter().rev().find(|m| m.role == Role::User) {
            pin_message_id = last_user.id.clone();
        }

        self.set_revert(session_id, RevertInfo { message_id: pin_message_id, snapshot_hash: current_hash.to_string(), diff: None }).await
    }

    /// Restore the working tree to the snapshot recorded at revert time and
    /// clear the pin.
    pub async fn unrevert(&self, session_id: &str, snapshot: &SnapshotStore) -> Result<(), SessionError> {
        self.ensure_loaded().await;
        let session = self.get(session_id).await.ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if let Some(info) = &session.revert {
            snapshot.restore(&info.snapshot_hash).await?;
        }
        let mut guard = self.sessions.write().await;
        let session = guard.get_mut(session_id).ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.revert = None;
        session.updated_at = now();
        let snap = session.clone();
        drop(guard);
        self.persist(&snap).await
    }

    /// Irreversible: truncate messages from the pinned message onward and
    /// clear the pin.
    pub async fn cleanup_revert(&self, session_id: &str) -> Result<(), SessionError> {
        self.ensure_loaded().await;
        let mut guard = self.sessions.write().await;
        let session = guard.get_mut(session_id).ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if let Some(info) = session.revert.take() {
            if let Some(idx) = session.messages.iter().position(|m| m.id == info.message_id) {
                session.messages.truncate(idx);
            }
        }
        session.updated_at = now();
        let snapshot = session.clone();
        drop(guard);
        self.persist(&snapshot).await
    }

    /// Copy messages `[0, at_index)` into a fresh session with a new id and
    /// `parent_id` set to the source session.
    pub async fn fork(&self, session_id: &str, at_index: usize) -> Result<Session, SessionError> {
        self.ensure_loaded().await;
        let source = self.get(session_id).await.ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        let mut fork = Session::new(source.agent.clone(), source.model.clone(), source.provider.clone());
        fork.parent_id = Some(source.id.clone());
        fork.title = source.title.clone();
        fork.messages = source.messages[..at_index.min(source.messages.len())]
            .iter()
            .cloned()
            .map(|mut m| {
                m.id = short_id();
                m
            })
            .collect();
        for msg in &fork.messages {
            fork.summary.record_message(msg);
        }
        self.persist(&fork).await?;
        self.sessions.write().await.insert(fork.id.clone(), fork.clone());
        Ok(fork)
    }

    pub async fn export(&self, session_id: &str) -> Result<String, SessionError> {
        let session = self.get(session_id).await.ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        Ok(serde_json::to_string_pretty(&session)?)
    }

    /// Import a session document, always assigning a fresh identifier
    /// regardless of the one carried in the document.
    pub async fn import(&self, json: &str) -> Result<Session, SessionError> {
        self.ensure_loaded().await;
        let mut session: Session = serde_json::from_str(json)?;
        session.id = short_id();
        session.parent_id = None;
        session.created_at = now();
        session.updated_at = now();
        self.persist(&session).await?;
        self.sessions.write().await.insert(session.id.clone(), session.clone());
        Ok(session)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
