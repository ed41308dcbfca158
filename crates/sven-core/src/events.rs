// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The event stream the conductor emits to a single subscriber (the UI).
use tokio::sync::mpsc;

/// Diff payload attached to a tool_end event or a `tool_result` part's
/// metadata, capped at 10 KB by the caller before it reaches this type.
#[derive(Debug, Clone)]
pub struct DiffPayload {
    pub path: String,
    pub old_content: String,
    pub new_content: String,
    pub language: Option<String>,
    pub is_fragment: bool,
}

/// One event in the conductor's output stream. Carries only the fields
/// meaningful for its variant.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Text { content: String },
    Thinking { content: String },
    ToolStart { tool_id: String, tool_name: String, detail: String },
    ToolEnd { tool_id: String, tool_name: String, content: String, is_error: bool, diff: Option<DiffPayload> },
    Retry { attempt: u32, message: String, next_at_ms: i64 },
    Compaction { tokens_before: u64, tokens_after: u64 },
    StepStart { step: u32 },
    StepEnd { step: u32, tokens_in: u64, tokens_out: u64, cost: f64 },
    Error { message: String },
    Done,
}

/// Best-effort event delivery: at most one subscriber, never blocking the
/// emitting side beyond the subscriber's own channel capacity. With no
/// subscriber attached, events are silently discarded.
#[derive(Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<AgentEvent>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self { tx: None }
    }

    pub fn attach(&mut self, tx: mpsc::Sender<AgentEvent>) {
        self.tx = Some(tx);
    }

    pub fn detach(&mut self) {
        self.tx = None;
    }

    /// Send the event if a subscriber is attached. Uses `try_send` so a
    /// full or closed channel never stalls the conductor's own loop.
    pub fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscriber_does_not_panic() {
        let sink = EventSink::new();
        sink.emit(AgentEvent::Done);
    }

    #[tokio::test]
    async fn emit_with_subscriber_delivers_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = EventSink::new();
        sink.attach(tx);
        sink.emit(AgentEvent::Text { content: "hi".into() });
        let received = rx.recv().await.unwrap();
        assert!(matches!(received, AgentEvent::Text { content } if content == "hi"));
    }

    #[tokio::test]
    async fn detach_stops_delivery() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = EventSink::new();
        sink.attach(tx);
        sink.detach();
        sink.emit(AgentEvent::Done);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_channel_does_not_block_emit() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = EventSink::new();
        sink.attach(tx);
        sink.emit(AgentEvent::Done);
        sink.emit(AgentEvent::Done); // second emit: channel full, dropped, not blocked
        assert!(rx.try_recv().is_ok());
    }
}
