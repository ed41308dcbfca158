// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Per-session lifecycle state. Idle is represented by absence from the map,
/// not as a variant here, matching the source's "empty == idle" convention.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    Busy,
    Retry { attempt: u32, message: String, next_at_ms: i64 },
}

type ChangeCallback = Box<dyn Fn(&str, Option<&SessionStatus>) + Send + Sync>;

/// Shared, lock-guarded session-status map with a single change-callback slot.
/// Never persisted — status resets to idle (absent) on process restart.
pub struct StatusManager {
    inner: RwLock<HashMap<String, SessionStatus>>,
    on_change: RwLock<Option<ChangeCallback>>,
}

impl StatusManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: RwLock::new(HashMap::new()), on_change: RwLock::new(None) })
    }

    /// Register the single change-callback slot, replacing any previous one.
    pub async fn on_change(&self, cb: impl Fn(&str, Option<&SessionStatus>) + Send + Sync + 'static) {
        *self.on_change.write().await = Some(Box::new(cb));
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionStatus> {
        self.inner.read().await.get(session_id).cloned()
    }

    pub async fn set(&self, session_id: &str, status: SessionStatus) {
        self.inner.write().await.insert(session_id.to_string(), status.clone());
        self.notify(session_id, Some(&status)).await;
    }

    /// Transition to idle, i.e. remove the entry entirely.
    pub async fn set_idle(&self, session_id: &str) {
        self.inner.write().await.remove(session_id);
        self.notify(session_id, None).await;
    }

    async fn notify(&self, session_id: &str, status: Option<&SessionStatus>) {
        if let Some(cb) = self.on_change.read().await.as_ref() {
            cb(session_id, status);
        }
    }
}

impl Default for StatusManager {
    fn default() -> Self {
        Self { inner: RwLock::new(HashMap::new()), on_change: RwLock::new(None) }
    }
}
