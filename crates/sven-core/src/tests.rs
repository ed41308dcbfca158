// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the conductor's model ↔ tool loop.
///
/// Uses `ScriptedMockProvider` so every scenario is deterministic and
/// requires no network access.
#[cfg(test)]
mod conductor_tests {
    use std::sync::Arc;

    use sven_config::{AgentConfig, AgentMode};
    use sven_model::ScriptedMockProvider;
    use sven_tools::{PermissionEngine, ShellTool, ToolRegistry, WriteTool};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::agent::{Conductor, InputImage, RunOutcome};
    use crate::events::{AgentEvent, EventSink};
    use crate::runtime_context::AgentRuntimeContext;
    use crate::status::StatusManager;

    // ── Helpers ──────────────────────────────────────────────────────────────

    struct Harness {
        _data_dir: TempDir,
        conductor: Conductor,
    }

    async fn harness_with(model: ScriptedMockProvider, tools: ToolRegistry, config: AgentConfig) -> Harness {
        let data_dir = TempDir::new().unwrap();
        let sessions = crate::session::SessionStore::new(data_dir.path().join("sessions"));
        let conductor = Conductor::new(
            Arc::new(tools),
            Arc::new(model),
            Arc::new(config),
            PermissionEngine::new(vec![]),
            AgentRuntimeContext::default(),
            sessions,
            None,
            StatusManager::new(),
            data_dir.path().to_path_buf(),
        );
        Harness { _data_dir: data_dir, conductor }
    }

    async fn new_session(h: &Harness) -> String {
        h.conductor.sessions.create("agent", "mock-model", "mock").await.unwrap().id
    }

    fn attached_sink() -> (EventSink, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let mut sink = EventSink::new();
        sink.attach(tx);
        (sink, rx)
    }

    async fn drain(rx: &mut mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    // ── Basic text turn ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn single_text_turn_completes_and_persists_reply() {
        let model = ScriptedMockProvider::always_text("hello from the conductor");
        let h = harness_with(model, ToolRegistry::default(), AgentConfig::default()).await;
        let session_id = new_session(&h).await;
        let (sink, mut rx) = attached_sink();

        let outcome = h
            .conductor
            .run(&session_id, "hi".into(), vec![], AgentMode::Agent, &sink, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Done);

        let events = drain(&mut rx).await;
        assert!(events.iter().any(|e| matches!(e, AgentEvent::Done)));

        let session = h.conductor.sessions.get(&session_id).await.unwrap();
        let assistant = session.messages.iter().find(|m| m.role == crate::session::Role::Assistant).unwrap();
        assert!(assistant.parts.iter().any(|p| matches!(p, crate::session::Part::Text { text } if text.contains("hello"))));
    }

    #[tokio::test]
    async fn user_message_is_appended_before_the_model_is_called() {
        let model = ScriptedMockProvider::always_text("reply");
        let h = harness_with(model, ToolRegistry::default(), AgentConfig::default()).await;
        let session_id = new_session(&h).await;
        let (sink, _rx) = attached_sink();

        h.conductor.run(&session_id, "my question".into(), vec![], AgentMode::Agent, &sink, CancellationToken::new()).await.unwrap();

        let session = h.conductor.sessions.get(&session_id).await.unwrap();
        let user_msg = session.messages.iter().find(|m| m.role == crate::session::Role::User).unwrap();
        assert!(user_msg.parts.iter().any(|p| matches!(p, crate::session::Part::Text { text } if text == "my question")));
    }

    #[tokio::test]
    async fn images_attach_as_image_parts_on_the_user_turn() {
        let model = ScriptedMockProvider::always_text("I see it").with_vision();
        let h = harness_with(model, ToolRegistry::default(), AgentConfig::default()).await;
        let session_id = new_session(&h).await;
        let (sink, _rx) = attached_sink();

        let images = vec![InputImage { media_type: "image/png".into(), data: "abc=".into() }];
        h.conductor.run(&session_id, "what is this?".into(), images, AgentMode::Agent, &sink, CancellationToken::new()).await.unwrap();

        let session = h.conductor.sessions.get(&session_id).await.unwrap();
        let user_msg = session.messages.iter().find(|m| m.role == crate::session::Role::User).unwrap();
        assert!(user_msg.parts.iter().any(|p| matches!(p, crate::session::Part::Image { .. })));
    }

    // ── Tool call round-trip ─────────────────────────────────────────────────

    #[tokio::test]
    async fn tool_call_round_trip_emits_start_and_end_events() {
        let model = ScriptedMockProvider::tool_then_text("tc-1", "shell", r#"{"command":"echo ok"}"#, "done");
        let mut reg = ToolRegistry::new();
        reg.register(ShellTool::default());
        let h = harness_with(model, reg, AgentConfig::default()).await;
        let session_id = new_session(&h).await;
        let (sink, mut rx) = attached_sink();

        let outcome = h
            .conductor
            .run(&session_id, "run something".into(), vec![], AgentMode::Agent, &sink, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Done);

        let events = drain(&mut rx).await;
        let started = events.iter().any(|e| matches!(e, AgentEvent::ToolStart { tool_name, .. } if tool_name == "shell"));
        let finished = events.iter().any(|e| matches!(e, AgentEvent::ToolEnd { tool_name, is_error: false, .. } if tool_name == "shell"));
        assert!(started, "should emit ToolStart for shell tool");
        assert!(finished, "should emit a successful ToolEnd for shell tool");
    }

    #[tokio::test]
    async fn tool_result_is_appended_to_session_history() {
        let model = ScriptedMockProvider::tool_then_text("tc-1", "shell", r#"{"command":"echo hi"}"#, "done");
        let mut reg = ToolRegistry::new();
        reg.register(ShellTool::default());
        let h = harness_with(model, reg, AgentConfig::default()).await;
        let session_id = new_session(&h).await;
        let (sink, _rx) = attached_sink();

        h.conductor.run(&session_id, "run".into(), vec![], AgentMode::Agent, &sink, CancellationToken::new()).await.unwrap();

        let session = h.conductor.sessions.get(&session_id).await.unwrap();
        let has_tool_result = session.messages.iter().any(|m| m.parts.iter().any(|p| matches!(p, crate::session::Part::ToolResult { .. })));
        assert!(has_tool_result, "tool result should be appended to session history");
    }

    #[tokio::test]
    async fn write_tool_actually_writes_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.txt");
        let args = serde_json::json!({"path": path.to_str().unwrap(), "content": "conductor wrote this"}).to_string();

        let model = ScriptedMockProvider::tool_then_text("w-1", "write", &args, "file written");
        let mut reg = ToolRegistry::new();
        reg.register(WriteTool);
        let h = harness_with(model, reg, AgentConfig::default()).await;
        let session_id = new_session(&h).await;
        let (sink, _rx) = attached_sink();

        h.conductor.run(&session_id, "write the file".into(), vec![], AgentMode::Agent, &sink, CancellationToken::new()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "conductor wrote this");
    }

    // ── Permission gating ────────────────────────────────────────────────────

    #[tokio::test]
    async fn denied_tool_call_is_blocked_and_stops_the_run() {
        let model = ScriptedMockProvider::tool_then_text("tc-1", "shell", r#"{"command":"rm -rf /"}"#, "unreachable");
        let mut reg = ToolRegistry::new();
        reg.register(ShellTool::default());
        let data_dir = TempDir::new().unwrap();
        let sessions = crate::session::SessionStore::new(data_dir.path().join("sessions"));
        let rules = vec![sven_tools::PermissionRule::new("shell", "*", sven_tools::ApprovalPolicy::Deny)];
        let conductor = Conductor::new(
            Arc::new(reg),
            Arc::new(model),
            Arc::new(AgentConfig::default()),
            PermissionEngine::new(rules),
            AgentRuntimeContext::default(),
            sessions,
            None,
            StatusManager::new(),
            data_dir.path().to_path_buf(),
        );
        let session_id = conductor.sessions.create("agent", "mock-model", "mock").await.unwrap().id;
        let (sink, mut rx) = attached_sink();

        let outcome = conductor.run(&session_id, "run something".into(), vec![], AgentMode::Agent, &sink, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Done);

        let events = drain(&mut rx).await;
        let blocked = events.iter().any(|e| matches!(e, AgentEvent::ToolEnd { is_error: true, .. }));
        assert!(blocked, "denied tool call should surface as an error ToolEnd");

        let session = conductor.sessions.get(&session_id).await.unwrap();
        let denied = session.messages.iter().any(|m| {
            m.parts.iter().any(|p| matches!(p, crate::session::Part::ToolResult { is_error: true, .. }))
        });
        assert!(denied, "the blocked tool result must be recorded in session history");
    }

    // ── Doom-loop detection ──────────────────────────────────────────────────

    #[tokio::test]
    async fn identical_tool_calls_trip_the_doom_loop_after_the_threshold() {
        // Three consecutive rounds calling the same tool with the same args.
        // The first two are ordinary allowed calls; only the third should be
        // evaluated under the `doom_loop` permission and blocked.
        let scripts: Vec<Vec<sven_model::ResponseEvent>> = (0..3)
            .map(|_| {
                vec![
                    sven_model::ResponseEvent::ToolCall { id: "x".into(), name: "shell".into(), arguments: r#"{"command":"echo again"}"#.into() },
                    sven_model::ResponseEvent::Done,
                ]
            })
            .collect();
        let model = ScriptedMockProvider::new(scripts);
        let config = AgentConfig { max_tool_rounds: 10, ..AgentConfig::default() };
        let mut reg = ToolRegistry::new();
        reg.register(ShellTool::default());

        let data_dir = TempDir::new().unwrap();
        let sessions = crate::session::SessionStore::new(data_dir.path().join("sessions"));
        let rules = vec![sven_tools::PermissionRule::new("doom_loop", "*", sven_tools::ApprovalPolicy::Deny)];
        let conductor = Conductor::new(
            Arc::new(reg),
            Arc::new(model),
            Arc::new(config),
            PermissionEngine::new(rules),
            AgentRuntimeContext::default(),
            sessions,
            None,
            StatusManager::new(),
            data_dir.path().to_path_buf(),
        );
        let session_id = conductor.sessions.create("agent", "mock-model", "mock").await.unwrap().id;
        let (sink, mut rx) = attached_sink();

        let outcome = conductor.run(&session_id, "repeat the same thing".into(), vec![], AgentMode::Agent, &sink, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Done);

        let events = drain(&mut rx).await;
        let tool_ends: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ToolEnd { is_error, .. } => Some(*is_error),
                _ => None,
            })
            .collect();
        assert_eq!(tool_ends, vec![false, false, true], "only the third identical call should be blocked by the doom-loop permission");
    }

    // ── Step budget enforcement ──────────────────────────────────────────────

    #[tokio::test]
    async fn exhausting_the_step_budget_fails_the_run() {
        let scripts: Vec<Vec<sven_model::ResponseEvent>> = (0..=3)
            .map(|_| {
                vec![
                    sven_model::ResponseEvent::ToolCall { id: "x".into(), name: "shell".into(), arguments: r#"{"command":"echo loop"}"#.into() },
                    sven_model::ResponseEvent::Done,
                ]
            })
            .collect();
        let model = ScriptedMockProvider::new(scripts);
        let config = AgentConfig { max_tool_rounds: 2, ..AgentConfig::default() };
        let mut reg = ToolRegistry::new();
        reg.register(ShellTool::default());
        let h = harness_with(model, reg, config).await;
        let session_id = new_session(&h).await;
        let (sink, _rx) = attached_sink();

        let outcome = h.conductor.run(&session_id, "loop forever".into(), vec![], AgentMode::Agent, &sink, CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed(msg) if msg.contains("max steps")));
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancellation_before_the_run_starts_returns_done_immediately() {
        let model = ScriptedMockProvider::always_text("never reached");
        let h = harness_with(model, ToolRegistry::default(), AgentConfig::default()).await;
        let session_id = new_session(&h).await;
        let (sink, _rx) = attached_sink();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.conductor.run(&session_id, "hi".into(), vec![], AgentMode::Agent, &sink, cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::Done);
    }

    // ── Streamed text/thinking events ────────────────────────────────────────

    #[tokio::test]
    async fn text_and_thinking_deltas_are_re_emitted_as_events() {
        let model = ScriptedMockProvider::new(vec![vec![
            sven_model::ResponseEvent::ThinkingDelta("pondering".into()),
            sven_model::ResponseEvent::TextDelta("hello".into()),
            sven_model::ResponseEvent::TextDelta(" world".into()),
            sven_model::ResponseEvent::Done,
        ]]);
        let h = harness_with(model, ToolRegistry::default(), AgentConfig::default()).await;
        let session_id = new_session(&h).await;
        let (sink, mut rx) = attached_sink();

        h.conductor.run(&session_id, "hi".into(), vec![], AgentMode::Agent, &sink, CancellationToken::new()).await.unwrap();

        let events = drain(&mut rx).await;
        assert!(events.iter().any(|e| matches!(e, AgentEvent::Thinking { content } if content == "pondering")));
        let texts: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["hello", " world"]);
    }

    // ── Token usage ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn token_usage_is_persisted_on_the_assistant_message() {
        let model = ScriptedMockProvider::new(vec![vec![
            sven_model::ResponseEvent::TextDelta("reply".into()),
            sven_model::ResponseEvent::Usage { input_tokens: 42, output_tokens: 17, cache_read_tokens: 3, cache_write_tokens: 5 },
            sven_model::ResponseEvent::Done,
        ]]);
        let h = harness_with(model, ToolRegistry::default(), AgentConfig::default()).await;
        let session_id = new_session(&h).await;
        let (sink, _rx) = attached_sink();

        h.conductor.run(&session_id, "q".into(), vec![], AgentMode::Agent, &sink, CancellationToken::new()).await.unwrap();

        let session = h.conductor.sessions.get(&session_id).await.unwrap();
        let assistant = session.messages.iter().find(|m| m.role == crate::session::Role::Assistant).unwrap();
        assert_eq!(assistant.tokens_in, 42);
        assert_eq!(assistant.tokens_out, 17);
        assert_eq!(assistant.tokens_cache, 8);
    }

    // ── Multi-turn conversation ──────────────────────────────────────────────

    #[tokio::test]
    async fn second_turn_adds_to_existing_history() {
        let model = ScriptedMockProvider::new(vec![
            vec![sven_model::ResponseEvent::TextDelta("first reply".into()), sven_model::ResponseEvent::Done],
            vec![sven_model::ResponseEvent::TextDelta("second reply".into()), sven_model::ResponseEvent::Done],
        ]);
        let h = harness_with(model, ToolRegistry::default(), AgentConfig::default()).await;
        let session_id = new_session(&h).await;
        let (sink1, _rx1) = attached_sink();
        h.conductor.run(&session_id, "turn one".into(), vec![], AgentMode::Agent, &sink1, CancellationToken::new()).await.unwrap();
        let after_first = h.conductor.sessions.get(&session_id).await.unwrap().messages.len();

        let (sink2, _rx2) = attached_sink();
        h.conductor.run(&session_id, "turn two".into(), vec![], AgentMode::Agent, &sink2, CancellationToken::new()).await.unwrap();
        let after_second = h.conductor.sessions.get(&session_id).await.unwrap().messages.len();

        assert!(after_second > after_first, "second turn should append more messages");
    }

    // ── Title generation ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn title_generation_fires_on_first_turn_even_when_a_tool_runs() {
        // The first user turn calls a tool before replying, so the run loop
        // stops at step 2, not step 1 — title generation must still fire.
        let model = ScriptedMockProvider::tool_then_text("tc-1", "shell", r#"{"command":"echo ok"}"#, "done");
        let mut reg = ToolRegistry::new();
        reg.register(ShellTool::default());
        let h = harness_with(model, reg, AgentConfig::default()).await;
        let session_id = new_session(&h).await;
        let (sink, _rx) = attached_sink();

        h.conductor.run(&session_id, "run something".into(), vec![], AgentMode::Agent, &sink, CancellationToken::new()).await.unwrap();

        let mut title_set = false;
        for _ in 0..50 {
            let session = h.conductor.sessions.get(&session_id).await.unwrap();
            if !session.has_placeholder_title() {
                title_set = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(title_set, "title should be generated after the first user turn, even when it ran a tool");
    }

    // ── Mode-scoped tool schemas ─────────────────────────────────────────────

    #[tokio::test]
    async fn research_mode_never_calls_a_write_only_tool() {
        // Research mode excludes `write` from the schemas sent to the model,
        // so a model that only knows how to call `write` degrades to a plain
        // text reply instead of looping forever on an unavailable tool.
        let model = ScriptedMockProvider::always_text("no tools available here");
        let mut reg = ToolRegistry::new();
        reg.register(WriteTool);
        let h = harness_with(model, reg, AgentConfig::default()).await;
        let session_id = new_session(&h).await;
        let (sink, _rx) = attached_sink();

        let outcome = h.conductor.run(&session_id, "write something".into(), vec![], AgentMode::Research, &sink, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Done);
    }
}
