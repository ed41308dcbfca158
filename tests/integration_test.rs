// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Workspace-level integration tests exercising the conductor, session
/// store, snapshot store, permission engine, and built-in tools together.
use std::sync::Arc;

use sven_config::{AgentConfig, AgentMode, Config, ToolsConfig};
use sven_core::{AgentRuntimeContext, Conductor, InputImage, RunOutcome, SessionStore, StatusManager};
use sven_model::ScriptedMockProvider;
use sven_tools::{
    ApprovalPolicy, PermissionEngine, PermissionRule, ReadFileTool, ShellTool, Tool, ToolCall,
    ToolContext, ToolRegistry, WriteTool,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn test_ctx(dir: &std::path::Path) -> ToolContext {
    ToolContext::new("sess", "msg", dir.to_path_buf())
}

#[test]
fn config_defaults_are_valid() {
    let cfg = Config::default();
    assert_eq!(cfg.model.provider, "openai");
    assert!(cfg.agent.max_tool_rounds > 0);
    assert!(cfg.agent.compaction_threshold > 0.0);
}

fn permission_engine_from(cfg: &ToolsConfig) -> PermissionEngine {
    let mut rules = Vec::new();
    for p in &cfg.deny_patterns {
        rules.push(PermissionRule::new("shell", p.clone(), ApprovalPolicy::Deny));
    }
    for p in &cfg.auto_approve_patterns {
        rules.push(PermissionRule::new("shell", p.clone(), ApprovalPolicy::Auto));
    }
    PermissionEngine::new(rules)
}

#[test]
fn default_tools_config_auto_approves_read_only_commands() {
    let cfg = ToolsConfig::default();
    let engine = permission_engine_from(&cfg);
    assert_eq!(engine.evaluate("shell", "cat /etc/hosts"), ApprovalPolicy::Auto);
    assert_eq!(engine.evaluate("shell", "ls /tmp"), ApprovalPolicy::Auto);
    assert_eq!(engine.evaluate("shell", "rm -rf /*"), ApprovalPolicy::Deny);
}

#[test]
fn default_tools_config_gates_the_shell_tool_via_decide_for_call() {
    // Exercises the real call path (tool name -> permission name -> rule
    // match) rather than `evaluate` with a hand-picked permission name, so a
    // mismatch between a tool's name and its permission name can't hide here.
    let cfg = ToolsConfig::default();
    let engine = permission_engine_from(&cfg);
    let project_dir = std::env::current_dir().unwrap();

    let allowed = engine.decide_for_call("shell", &serde_json::json!({ "command": "ls /tmp" }), &project_dir);
    assert_eq!(allowed, ApprovalPolicy::Auto);

    let denied = engine.decide_for_call("shell", &serde_json::json!({ "command": "rm -rf /*" }), &project_dir);
    assert_eq!(denied, ApprovalPolicy::Deny);
}

#[test]
fn deny_rule_wins_over_an_overlapping_auto_approve_rule() {
    let rules = vec![
        PermissionRule::new("shell", "rm *", ApprovalPolicy::Deny),
        PermissionRule::new("shell", "rm *", ApprovalPolicy::Auto),
    ];
    let engine = PermissionEngine::new(rules);
    assert_eq!(engine.evaluate("shell", "rm /tmp/foo"), ApprovalPolicy::Deny);
}

#[tokio::test]
async fn shell_tool_executes_echo() {
    let dir = TempDir::new().unwrap();
    let tool = ShellTool::default();
    let call = ToolCall {
        id: "1".into(),
        name: "shell".into(),
        args: serde_json::json!({ "command": "echo hello_world" }),
    };
    let output = tool.execute(&call, &test_ctx(dir.path())).await;
    assert!(!output.is_error);
    assert!(output.content.contains("hello_world"));
}

#[tokio::test]
async fn fs_tool_write_read_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("roundtrip.txt");
    let path_str = path.to_str().unwrap();

    let write_call = ToolCall {
        id: "w1".into(),
        name: "write".into(),
        args: serde_json::json!({ "path": path_str, "content": "roundtrip" }),
    };
    let wo = WriteTool.execute(&write_call, &test_ctx(dir.path())).await;
    assert!(!wo.is_error, "write failed: {}", wo.content);

    let read_call = ToolCall {
        id: "r1".into(),
        name: "read_file".into(),
        args: serde_json::json!({ "path": path_str }),
    };
    let ro = ReadFileTool.execute(&read_call, &test_ctx(dir.path())).await;
    assert!(!ro.is_error);
    assert!(ro.content.contains("roundtrip"));
}

// ── Conductor end-to-end, via the workspace's public API ───────────────────

async fn build_conductor(model: ScriptedMockProvider, tools: ToolRegistry, data_dir: &TempDir) -> Conductor {
    let sessions = SessionStore::new(data_dir.path().join("sessions"));
    Conductor::new(
        Arc::new(tools),
        Arc::new(model),
        Arc::new(AgentConfig::default()),
        PermissionEngine::new(vec![]),
        AgentRuntimeContext::default(),
        sessions,
        None,
        StatusManager::new(),
        data_dir.path().to_path_buf(),
    )
}

#[tokio::test]
async fn conductor_completes_a_plain_text_turn() {
    let data_dir = TempDir::new().unwrap();
    let conductor = build_conductor(
        ScriptedMockProvider::always_text("integration test reply"),
        ToolRegistry::default(),
        &data_dir,
    )
    .await;

    let session = conductor.sessions.create("agent", "mock-model", "mock").await.unwrap();
    let outcome = conductor
        .run(
            &session.id,
            "hello".into(),
            Vec::<InputImage>::new(),
            AgentMode::Agent,
            &sven_core::EventSink::new(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Done);

    let persisted = conductor.sessions.get(&session.id).await.unwrap();
    assert!(persisted.messages.len() >= 2, "user + assistant messages persisted");
}

#[tokio::test]
async fn conductor_runs_a_shell_tool_and_persists_the_result() {
    let data_dir = TempDir::new().unwrap();
    let mut tools = ToolRegistry::new();
    tools.register(ShellTool::default());

    let conductor = build_conductor(
        ScriptedMockProvider::tool_then_text("call-1", "shell", r#"{"command":"echo done"}"#, "finished"),
        tools,
        &data_dir,
    )
    .await;

    let session = conductor.sessions.create("agent", "mock-model", "mock").await.unwrap();
    let outcome = conductor
        .run(
            &session.id,
            "run the command".into(),
            Vec::<InputImage>::new(),
            AgentMode::Agent,
            &sven_core::EventSink::new(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Done);

    let persisted = conductor.sessions.get(&session.id).await.unwrap();
    let has_tool_result = persisted
        .messages
        .iter()
        .any(|m| m.parts.iter().any(|p| matches!(p, sven_core::Part::ToolResult { .. })));
    assert!(has_tool_result);
}

#[test]
fn project_root_discovery_finds_this_workspace() {
    let root = sven_runtime::find_project_root();
    // This crate is checked out inside a git repository in CI and locally;
    // if it is not (e.g. an extracted tarball) the function still returns
    // the current directory, so this call must never fail outright.
    assert!(root.is_ok());
}
