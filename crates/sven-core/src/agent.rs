// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The conductor: drives one `Run(sessionId, userText, images)` call through
//! the model ↔ tool loop, persisting every step to the Session Store and
//! emitting [`AgentEvent`]s to a single subscriber.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use sven_config::{AgentConfig, AgentMode};
use sven_model::{CompletionRequest, ContentPart, FunctionCall, MessageContent, ModelProvider, ResponseEvent};
use sven_tools::{
    tool_permission_name, ApprovalPolicy, DoomLoopWindow, PermissionEngine, ToolContext, ToolRegistry,
};

use crate::compact::{apply_summary, build_summary_request, emergency_compact, is_overflow, prune_tool_results, smart_truncate};
use crate::events::{AgentEvent, DiffPayload, EventSink};
use crate::prompts::{system_prompt, PromptContext};
use crate::retry::{compute_delay, is_retryable, MAX_ATTEMPTS};
use crate::runtime_context::AgentRuntimeContext;
use crate::session::{Message, Part, Role, SessionStore, ToolUseStatus};
use crate::snapshot::SnapshotStore;
use crate::status::{SessionStatus, StatusManager};

/// Maximum conductor iterations per `Run` call before giving up with
/// "max steps reached".
const DEFAULT_MAX_STEPS: u32 = 50;

/// Character budget for a tool result sent to the model: head + tail.
const OUTGOING_TOOL_RESULT_CHARS: usize = 12_000;

/// Character budget for a `reasoning` part folded into a `<thinking>` block.
const REASONING_CHARS: usize = 500;

/// Background title-generation timeout.
const TITLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one `Run` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    Failed(String),
}

/// An inline image attached to a user turn.
#[derive(Debug, Clone)]
pub struct InputImage {
    pub media_type: String,
    pub data: String,
}

/// Owns the long-lived dependencies shared across every session: the tool
/// registry, the model provider, configuration, permission rules, and the
/// stores. A `run()` call is otherwise stateless — all conversation state
/// lives in the Session Store, not on this struct.
pub struct Conductor {
    pub tools: Arc<ToolRegistry>,
    pub model: Arc<dyn ModelProvider>,
    pub config: Arc<AgentConfig>,
    pub permissions: PermissionEngine,
    pub runtime: AgentRuntimeContext,
    pub sessions: Arc<SessionStore>,
    pub snapshots: Option<Arc<SnapshotStore>>,
    pub status: Arc<StatusManager>,
    pub project_dir: PathBuf,
    /// One doom-loop window per session, kept for the life of the process.
    doom_loops: Mutex<HashMap<String, DoomLoopWindow>>,
}

impl Conductor {
    pub fn new(
        tools: Arc<ToolRegistry>,
        model: Arc<dyn ModelProvider>,
        config: Arc<AgentConfig>,
        permissions: PermissionEngine,
        runtime: AgentRuntimeContext,
        sessions: Arc<SessionStore>,
        snapshots: Option<Arc<SnapshotStore>>,
        status: Arc<StatusManager>,
        project_dir: PathBuf,
    ) -> Self {
        Self {
            tools,
            model,
            config,
            permissions,
            runtime,
            sessions,
            snapshots,
            status,
            project_dir,
            doom_loops: Mutex::new(HashMap::new()),
        }
    }

    /// Run one user turn to completion: append `user_text` (and `images`) to
    /// the session, then loop the model ↔ tool cycle until the model stops
    /// requesting tools, the step budget is exhausted, or a fatal error
    /// occurs.
    pub async fn run(
        &self,
        session_id: &str,
        user_text: String,
        images: Vec<InputImage>,
        mode: AgentMode,
        events: &EventSink,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        let mut parts = vec![Part::text(user_text)];
        for img in images {
            parts.push(Part::Image { media_type: img.media_type, data: img.data });
        }
        let mut user_msg = Message::new(Role::User, String::new());
        user_msg.parts = parts;
        self.sessions.add_message(session_id, user_msg).await.context("failed to append user message")?;
        self.status.set(session_id, SessionStatus::Busy).await;

        // Title generation fires once, on the first user turn a session ever
        // completes — not on whichever step happens to be current when the
        // run loop stops, which may be later than step 1 if tools ran first.
        let is_first_turn = self
            .sessions
            .get(session_id)
            .await
            .map(|s| s.messages.iter().filter(|m| m.role == Role::User).count() <= 1)
            .unwrap_or(false);

        let step_budget = if self.config.max_tool_rounds > 0 { self.config.max_tool_rounds } else { DEFAULT_MAX_STEPS };

        let mut attempt: u32 = 0;
        let mut step: u32 = 0;
        let result = loop {
            if cancel.is_cancelled() {
                break RunOutcome::Done;
            }
            if step >= step_budget {
                break RunOutcome::Failed("max steps reached".to_string());
            }
            step += 1;

            match self.run_one_step(session_id, mode, events, &cancel, step, &mut attempt).await {
                Ok(StepOutcome::Continue) => continue,
                Ok(StepOutcome::Stop(outcome)) => {
                    if is_first_turn {
                        self.maybe_generate_title(session_id);
                    }
                    break outcome;
                }
                Err(e) => break RunOutcome::Failed(format!("{e:#}")),
            }
        };

        self.status.set_idle(session_id).await;
        events.emit(AgentEvent::Done);
        Ok(result)
    }

    /// Run exactly one conductor iteration (steps 1–13 of the per-iteration
    /// algorithm). `attempt` is the running retry counter for transient
    /// provider errors within this call to `run()`; it resets to 0 after any
    /// successful model response.
    async fn run_one_step(
        &self,
        session_id: &str,
        mode: AgentMode,
        events: &EventSink,
        cancel: &CancellationToken,
        step: u32,
        attempt: &mut u32,
    ) -> anyhow::Result<StepOutcome> {
        let session = self.sessions.get(session_id).await.context("session disappeared mid-run")?;

        // Step 1: snapshot pre-step hash.
        let pre_hash = match &self.snapshots {
            Some(s) => s.track().await.ok(),
            None => None,
        };
        events.emit(AgentEvent::StepStart { step });
        if let Some(hash) = &pre_hash {
            let mut marker = Message::new(Role::System, String::new());
            marker.parts = vec![Part::StepStart { pre_hash: Some(hash.clone()) }];
            self.sessions.add_message(session_id, marker).await?;
        }

        // Step 2+3: build the outgoing provider message list, pruning and
        // truncating tool results, assigning missing tool_use identifiers.
        let mut history = session.messages.clone();
        prune_tool_results(&mut history);
        let assigned_ids = assign_missing_tool_use_ids(&mut history);
        if assigned_ids {
            self.sessions.replace_messages(session_id, history.clone()).await?;
        }
        let outgoing = build_outgoing_messages(&history);
        let outgoing = sven_model::sanitize::strip_images_if_unsupported(outgoing, &self.model.input_modalities());

        // Step 4: tool schemas filtered by mode, then by an unconditional deny.
        let tool_schemas: Vec<sven_model::ToolSchema> = self
            .tools
            .schemas_for_mode(mode)
            .into_iter()
            .filter(|s| {
                self.permissions.decide_for_call(&s.name, &serde_json::Value::Null, &self.project_dir) != ApprovalPolicy::Deny
            })
            .map(|s| sven_model::ToolSchema { name: s.name, description: s.description, parameters: s.parameters })
            .collect();

        let ctx = PromptContext {
            project_root: self.runtime.project_root.as_deref(),
            project_context_file: self.runtime.project_context_file.as_deref(),
            append: self.runtime.append_system_prompt.as_deref(),
            skills: self.runtime.skills.get(),
            agents: self.runtime.agents.get(),
            ..Default::default()
        };
        let system_text = system_prompt(mode, self.effective_system_prompt_override().as_deref(), ctx.stable_only());
        let dynamic_suffix = self.dynamic_block();

        let mut messages = Vec::with_capacity(outgoing.len() + 1);
        messages.push(sven_model::Message::system(system_text));
        messages.extend(outgoing);

        let req = CompletionRequest {
            messages,
            tools: tool_schemas,
            stream: true,
            system_dynamic_suffix: dynamic_suffix,
        };

        // Step 5+6: invoke the provider, retrying transient errors.
        let turn = tokio::select! {
            _ = cancel.cancelled() => return Ok(StepOutcome::Stop(RunOutcome::Done)),
            turn = self.stream_turn(req, events) => turn,
        };
        let turn = match turn {
            Ok(t) => t,
            Err(e) => {
                if let Some(n_ctx) = extract_n_ctx_from_error(&e) {
                    warn!(n_ctx, "provider reported a hard context overflow; compacting and retrying");
                    let mut messages = session.messages.clone();
                    emergency_compact(&mut messages, self.config.compaction_keep_recent);
                    self.sessions.replace_messages(session_id, messages).await?;
                    events.emit(AgentEvent::Compaction { tokens_before: 0, tokens_after: 0 });
                    return Ok(StepOutcome::Continue);
                }
                let message = format!("{e:#}");
                if let Some(label) = is_retryable(&message) {
                    *attempt += 1;
                    if *attempt <= MAX_ATTEMPTS {
                        let delay = compute_delay(*attempt, None);
                        let next_at_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
                        events.emit(AgentEvent::Retry { attempt: *attempt, message: label.to_string(), next_at_ms });
                        self.status
                            .set(session_id, SessionStatus::Retry { attempt: *attempt, message: label.to_string(), next_at_ms })
                            .await;
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(StepOutcome::Stop(RunOutcome::Done)),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        self.status.set(session_id, SessionStatus::Busy).await;
                        return Ok(StepOutcome::Continue);
                    }
                }
                return Err(e.context(format!("model completion failed ({})", self.model.name())));
            }
        };
        *attempt = 0;

        // Step 7: translate the response into a persisted assistant message.
        let mut assistant = Message::new(Role::Assistant, turn.text.clone());
        assistant.parts = turn.parts;
        assistant.tokens_in = turn.usage.input_tokens as u64;
        assistant.tokens_out = turn.usage.output_tokens as u64;
        assistant.tokens_cache = turn.usage.cache_read_tokens as u64 + turn.usage.cache_write_tokens as u64;
        assistant.cost = 0.0;
        assistant.finish_reason = turn.finish_reason.clone();

        // Step 8: overflow check.
        let context_window = self.model.catalog_context_window().unwrap_or(128_000) as u64;
        let model_max_output = self.model.catalog_max_output_tokens().map(|v| v as u64);
        let overflow = is_overflow(
            turn.usage.input_tokens as u64,
            assistant.tokens_cache,
            turn.usage.output_tokens as u64,
            context_window,
            model_max_output,
        );

        // Step 9: persist.
        let saved = self.sessions.add_message(session_id, assistant).await?;

        // Step 10: post-step snapshot. `track()` restages the tree so `patch`
        // diffs against the current working state.
        if let Some(store) = &self.snapshots {
            if let Some(pre) = &pre_hash {
                if store.track().await.is_ok() {
                    let changed = store.patch(pre).await;
                    if !changed.is_empty() {
                        let mut patch_msg = Message::new(Role::System, String::new());
                        patch_msg.parts = vec![Part::Patch { hash: pre.clone(), files: changed.clone() }];
                        self.sessions.add_message(session_id, patch_msg).await?;
                    }
                }
            }
        }
        let mut finish = Message::new(Role::System, String::new());
        finish.parts = vec![Part::StepFinish {
            tokens_in: saved.tokens_in,
            tokens_out: saved.tokens_out,
            cost: saved.cost,
        }];
        self.sessions.add_message(session_id, finish).await?;
        events.emit(AgentEvent::StepEnd {
            step,
            tokens_in: saved.tokens_in,
            tokens_out: saved.tokens_out,
            cost: saved.cost,
        });

        // Step 11: compaction, if flagged.
        if overflow {
            match self.compact_session(session_id).await {
                Ok((before, after)) => events.emit(AgentEvent::Compaction { tokens_before: before, tokens_after: after }),
                Err(e) => events.emit(AgentEvent::Error { message: format!("compaction failed: {e:#}") }),
            }
        }

        // Step 12: terminate when there are no tool_use blocks.
        let tool_uses: Vec<(String, String, serde_json::Value)> = saved
            .parts
            .iter()
            .filter_map(|p| p.as_tool_use().map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone())))
            .collect();
        if tool_uses.is_empty() || saved.finish_reason.as_deref() == Some("end_turn") {
            return Ok(StepOutcome::Stop(RunOutcome::Done));
        }

        // Step 13: execute each tool_use in document order.
        let mut result_parts = Vec::with_capacity(tool_uses.len());
        let mut blocked = false;
        for (tool_id, tool_name, input) in tool_uses {
            let outcome = self.execute_tool(session_id, &saved.id, &tool_name, &tool_id, input, events, cancel).await;
            if outcome.blocked {
                blocked = true;
            }
            result_parts.push(outcome.part);
        }
        let mut results_msg = Message::new(Role::User, String::new());
        results_msg.parts = result_parts;
        self.sessions.add_message(session_id, results_msg).await?;

        if blocked {
            return Ok(StepOutcome::Stop(RunOutcome::Done));
        }
        Ok(StepOutcome::Continue)
    }

    /// Stream one model turn to completion, accumulating text, thinking,
    /// and tool-call deltas into a [`TurnResult`], re-emitting each delta as
    /// it arrives.
    async fn stream_turn(&self, req: CompletionRequest, events: &EventSink) -> anyhow::Result<TurnResult> {
        let mut stream = self.model.complete(req).await?;
        let mut full_text = String::new();
        let mut parts: Vec<Part> = Vec::new();
        // Anthropic-style streams never interleave tool calls: a
        // `content_block_start` opens one call at a time and its argument
        // deltas (empty id/name) belong to whichever call is still open.
        let mut pending: Vec<(String, String, String)> = Vec::new();
        let mut thinking = String::new();
        let mut usage = sven_model::Usage::default();
        let mut finish_reason: Option<String> = None;

        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(text) => {
                    if !text.is_empty() {
                        events.emit(AgentEvent::Text { content: text.clone() });
                        full_text.push_str(&text);
                    }
                }
                ResponseEvent::ToolCall { id, name, arguments } => {
                    if !id.is_empty() {
                        pending.push((id, name, arguments));
                    } else if let Some(last) = pending.last_mut() {
                        last.2.push_str(&arguments);
                    }
                }
                ResponseEvent::ThinkingDelta(text) => {
                    if !text.is_empty() {
                        events.emit(AgentEvent::Thinking { content: text.clone() });
                        thinking.push_str(&text);
                    }
                }
                ResponseEvent::Usage { input_tokens, output_tokens, cache_read_tokens, cache_write_tokens } => {
                    usage = sven_model::Usage { input_tokens, output_tokens, cache_read_tokens, cache_write_tokens };
                }
                ResponseEvent::Done => {
                    finish_reason = Some(if pending.is_empty() { "end_turn".to_string() } else { "tool_use".to_string() });
                }
                ResponseEvent::Error(message) => return Err(anyhow::anyhow!(message)),
            }
        }

        if !thinking.is_empty() {
            parts.push(Part::Reasoning { text: strip_think_wrappers(thinking) });
        }
        if let Some(inline) = extract_inline_think_block(&full_text) {
            parts.push(Part::Reasoning { text: inline });
            full_text.clear();
        }
        if !full_text.is_empty() {
            parts.push(Part::Text { text: full_text.clone() });
        }
        for (id, name, args_buf) in pending {
            let call = PendingToolCall { id, name, args_buf }.finish();
            parts.push(Part::ToolUse { id: call.id, name: call.name, input: call.args, status: ToolUseStatus::Pending });
        }

        Ok(TurnResult { text: full_text, parts, usage, finish_reason })
    }

    /// Execute one `tool_use`: doom-loop check, permission evaluation,
    /// registry dispatch, event emission.
    async fn execute_tool(
        &self,
        session_id: &str,
        message_id: &str,
        tool_name: &str,
        tool_id: &str,
        input: serde_json::Value,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> ToolExecOutcome {
        let detail = tool_call_detail(tool_name, &input);
        events.emit(AgentEvent::ToolStart { tool_id: tool_id.to_string(), tool_name: tool_name.to_string(), detail });

        let doom_loop_hit = {
            let mut loops = self.doom_loops.lock().await;
            let window = loops.entry(session_id.to_string()).or_default();
            window.observe(tool_name, &input)
        };

        let mut decision = if doom_loop_hit {
            self.permissions.evaluate("doom_loop", "*")
        } else {
            self.permissions.decide_for_call(tool_name, &input, &self.project_dir)
        };
        // `Ask` has no interactive callback wired at this layer; treat it
        // the same as a denial rather than silently auto-approving.
        if decision == ApprovalPolicy::Ask {
            decision = ApprovalPolicy::Deny;
        }
        // Only the doom-loop permission itself resolving to non-deny clears
        // the window; an ordinary allowed call must not reset the count, or
        // repeats of the same call never reach the threshold.
        if doom_loop_hit && decision != ApprovalPolicy::Deny {
            let mut loops = self.doom_loops.lock().await;
            if let Some(window) = loops.get_mut(session_id) {
                window.reset();
            }
        }

        if decision == ApprovalPolicy::Deny {
            let reason = format!("blocked by permission policy: {}", tool_permission_name(tool_name));
            events.emit(AgentEvent::ToolEnd {
                tool_id: tool_id.to_string(),
                tool_name: tool_name.to_string(),
                content: reason.clone(),
                is_error: true,
                diff: None,
            });
            return ToolExecOutcome {
                part: Part::ToolResult {
                    tool_id: tool_id.to_string(),
                    output: reason,
                    is_error: true,
                    is_compacted: false,
                    title: None,
                    metadata: None,
                },
                blocked: true,
            };
        }

        let call = sven_tools::ToolCall { id: tool_id.to_string(), name: tool_name.to_string(), args: input };
        let tctx = ToolContext::new(session_id, message_id, self.project_dir.clone()).with_cancel(cancel.clone());
        let output = self.tools.execute(&call, &tctx).await;

        let capped = if self.config.tool_result_token_cap > 0 {
            let tool = self.tools.get(tool_name);
            let category = tool.as_ref().map(|t| t.output_category()).unwrap_or_default();
            smart_truncate(&output.content, category, self.config.tool_result_token_cap)
        } else {
            output.content.clone()
        };

        // No built-in tool currently emits structured diff data through
        // `ToolOutput`; the slot exists for editor tools that may grow one.
        let diff: Option<DiffPayload> = None;
        events.emit(AgentEvent::ToolEnd {
            tool_id: tool_id.to_string(),
            tool_name: tool_name.to_string(),
            content: capped.clone(),
            is_error: output.is_error,
            diff,
        });

        ToolExecOutcome {
            part: Part::ToolResult {
                tool_id: tool_id.to_string(),
                output: capped,
                is_error: output.is_error,
                is_compacted: false,
                title: None,
                metadata: None,
            },
            blocked: false,
        }
    }

    /// Replace the session's history with a compacted summary, using the
    /// structured or narrative checkpoint format from configuration.
    async fn compact_session(&self, session_id: &str) -> anyhow::Result<(u64, u64)> {
        let session = self.sessions.get(session_id).await.context("session not found")?;
        let before: u64 = session.messages.iter().map(|m| m.approx_tokens() as u64).sum();
        let (system, user) = build_summary_request(&session.messages, &self.config.compaction_strategy);
        let req = CompletionRequest {
            messages: vec![sven_model::Message::system(system), sven_model::Message::user(user)],
            tools: vec![],
            stream: false,
            system_dynamic_suffix: None,
        };
        let mut stream = self.model.complete(req).await?;
        let mut summary_text = String::new();
        while let Some(event) = stream.next().await {
            if let ResponseEvent::TextDelta(text) = event? {
                summary_text.push_str(&text);
            }
        }
        let mut messages = session.messages.clone();
        apply_summary(&mut messages, &summary_text);
        let after: u64 = messages.iter().map(|m| m.approx_tokens() as u64).sum();
        self.sessions.replace_messages(session_id, messages).await?;
        Ok((before, after))
    }

    /// Fire a best-effort background title-generation call. Only applied if
    /// the session still has a placeholder title once it completes.
    fn maybe_generate_title(&self, session_id: &str) {
        let sessions = self.sessions.clone();
        let model = self.model.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let Some(session) = sessions.get(&session_id).await else { return };
            if !session.has_placeholder_title() {
                return;
            }
            let Some(first_user) = session.messages.iter().find(|m| m.role == Role::User) else { return };
            let req = CompletionRequest {
                messages: vec![
                    sven_model::Message::system(
                        "Generate a short (≤6 words) descriptive title for this conversation. Reply with the title only.",
                    ),
                    sven_model::Message::user(first_user.content.clone()),
                ],
                tools: vec![],
                stream: false,
                system_dynamic_suffix: None,
            };
            let title = tokio::time::timeout(TITLE_TIMEOUT, async {
                let mut stream = model.complete(req).await.ok()?;
                let mut text = String::new();
                while let Some(event) = stream.next().await {
                    if let Ok(ResponseEvent::TextDelta(delta)) = event {
                        text.push_str(&delta);
                    }
                }
                Some(text.trim().trim_matches('"').to_string())
            })
            .await;
            if let Ok(Some(title)) = title {
                if !title.is_empty() {
                    if let Some(session) = sessions.get(&session_id).await {
                        if session.has_placeholder_title() {
                            let _ = sessions.update_title(&session_id, title).await;
                        }
                    }
                }
            }
        });
    }

    fn effective_system_prompt_override(&self) -> Option<String> {
        self.runtime
            .system_prompt_override
            .clone()
            .or_else(|| self.config.system_prompt.clone())
    }

    fn dynamic_block(&self) -> Option<String> {
        let ctx = PromptContext {
            git_context: self.runtime.git_context_note.as_deref(),
            ci_context: self.runtime.ci_context_note.as_deref(),
            ..Default::default()
        };
        ctx.dynamic_block()
    }
}

enum StepOutcome {
    Continue,
    Stop(RunOutcome),
}

struct TurnResult {
    text: String,
    parts: Vec<Part>,
    usage: sven_model::Usage,
    finish_reason: Option<String>,
}

struct ToolExecOutcome {
    part: Part,
    blocked: bool,
}

/// Assign a freshly generated identifier to every `tool_use` part that has
/// none, in place. Returns whether any identifier was assigned.
fn assign_missing_tool_use_ids(messages: &mut [Message]) -> bool {
    let mut changed = false;
    for message in messages.iter_mut() {
        for part in message.parts.iter_mut() {
            if let Part::ToolUse { id, .. } = part {
                if id.is_empty() {
                    *id = Uuid::new_v4().simple().to_string()[..12].to_string();
                    changed = true;
                }
            }
        }
    }
    changed
}

/// Flatten session history into the provider's flat message list: system
/// messages are dropped, and each part becomes its own provider message
/// since the wire model has no slot for mixed text+tool_use in one message.
fn build_outgoing_messages(history: &[Message]) -> Vec<sven_model::Message> {
    let mut out = Vec::new();
    for message in history {
        if message.role == Role::System {
            continue;
        }
        if message.parts.is_empty() {
            out.push(match message.role {
                Role::Assistant => sven_model::Message::assistant(message.content.clone()),
                _ => sven_model::Message::user(message.content.clone()),
            });
            continue;
        }
        for part in &message.parts {
            match part {
                Part::Text { text } => out.push(match message.role {
                    Role::Assistant => sven_model::Message::assistant(text.clone()),
                    _ => sven_model::Message::user(text.clone()),
                }),
                Part::Reasoning { text } => {
                    let truncated = truncate_chars(text, REASONING_CHARS);
                    out.push(sven_model::Message::assistant(format!("<thinking>{truncated}</thinking>")));
                }
                Part::ToolUse { id, name, input, .. } => {
                    if id.is_empty() {
                        continue;
                    }
                    out.push(sven_model::Message {
                        role: sven_model::Role::Assistant,
                        content: MessageContent::ToolCall {
                            tool_call_id: id.clone(),
                            function: FunctionCall { name: name.clone(), arguments: input.to_string() },
                        },
                    });
                }
                Part::ToolResult { tool_id, output, is_error, .. } => {
                    if tool_id.is_empty() {
                        continue;
                    }
                    let truncated = truncate_head_tail(output, OUTGOING_TOOL_RESULT_CHARS);
                    let text = if *is_error { format!("Error: {truncated}") } else { truncated };
                    out.push(sven_model::Message::tool_result(tool_id.clone(), text));
                }
                Part::Image { media_type, data } => {
                    let url = format!("data:{media_type};base64,{data}");
                    out.push(sven_model::Message::user_with_parts(vec![ContentPart::image(url)]));
                }
                Part::Patch { .. } | Part::StepStart { .. } | Part::StepFinish { .. } => {}
            }
        }
    }
    out
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max).collect();
    format!("{truncated}…")
}

/// Keep the first and last half of `max` characters, with an explicit
/// truncation marker in between.
fn truncate_head_tail(s: &str, max: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max {
        return s.to_string();
    }
    let half = max / 2;
    let head: String = chars[..half].iter().collect();
    let tail: String = chars[chars.len() - half..].iter().collect();
    let omitted = chars.len() - 2 * half;
    format!("{head}\n… [{omitted} characters truncated] …\n{tail}")
}

/// Short human-readable description of a tool call, used for the
/// `tool_start` event.
fn tool_call_detail(tool_name: &str, input: &serde_json::Value) -> String {
    let pattern = sven_tools::tool_pattern(tool_name, input);
    if pattern != "*" {
        return pattern;
    }
    input.to_string()
}

/// Extract `n_ctx` from a llama.cpp-style `exceed_context_size_error` body.
///
/// ```json
/// {"error":{"type":"exceed_context_size_error","n_ctx":54272,"n_prompt_tokens":54298,...}}
/// ```
///
/// Returns `Some(n_ctx)` when the error message contains that pattern,
/// `None` for any other error.
fn extract_n_ctx_from_error(err: &anyhow::Error) -> Option<usize> {
    let msg = err.to_string();
    if !msg.contains("exceed_context_size_error") {
        return None;
    }
    let json_start = msg.find('{')?;
    let body: serde_json::Value = serde_json::from_str(&msg[json_start..]).ok()?;
    if let Some(n) = body["error"]["n_ctx"].as_u64() {
        return Some(n as usize);
    }
    body["n_ctx"].as_u64().map(|n| n as usize)
}

/// Strip `<think>` / `</think>` wrapper tags from accumulated thinking content.
///
/// Some model servers (llama.cpp without `reasoning_format: deepseek`,
/// certain OpenAI-compat proxies) forget to strip these tags before placing
/// the text in the thinking stream. Stripping them here keeps the thinking
/// log readable.
fn strip_think_wrappers(s: String) -> String {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("<think>").unwrap_or(trimmed);
    let inner = inner.strip_suffix("</think>").unwrap_or(inner);
    inner.trim().to_string()
}

/// Detect a `<think>...</think>` block occupying the *entire* text.
///
/// Some models emit thinking as plain text deltas when the serving layer
/// isn't configured for reasoning extraction. Returns the extracted inner
/// text so the caller can reclassify it as a reasoning part instead of an
/// empty assistant turn.
fn extract_inline_think_block(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let inner = trimmed.strip_prefix("<think>")?;
    let inner = inner.strip_suffix("</think>").unwrap_or(inner);
    if inner.contains("</think>") {
        return None;
    }
    Some(inner.trim().to_string())
}

struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self) -> sven_tools::ToolCall {
        // Always resolve to a JSON object. Model providers (notably
        // Anthropic) require tool_use input to be an object; sending `null`
        // causes a 400 on the *next* completion request.
        let args = if self.args_buf.is_empty() {
            warn!(tool_name = %self.name, tool_call_id = %self.id, "model sent tool call with empty arguments; substituting {{}}");
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(parse_err) => match attempt_json_repair(&self.args_buf) {
                    Ok(v) => {
                        warn!(tool_name = %self.name, tool_call_id = %self.id, "repaired invalid JSON arguments from model");
                        v
                    }
                    Err(_) => {
                        warn!(
                            tool_name = %self.name,
                            tool_call_id = %self.id,
                            args_buf = %self.args_buf,
                            error = %parse_err,
                            "model sent tool call with invalid JSON arguments; substituting {{}}"
                        );
                        serde_json::Value::Object(Default::default())
                    }
                },
            }
        };
        sven_tools::ToolCall { id: self.id, name: self.name, args }
    }
}

/// Attempt to repair common JSON syntax errors in model-emitted tool
/// arguments: invalid escape sequences, missing commas, truncated strings.
fn attempt_json_repair(json_str: &str) -> anyhow::Result<serde_json::Value> {
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&fixed) {
        return Ok(v);
    }

    let repaired = regex::Regex::new(r#""([^"]+)"([a-zA-Z_][a-zA-Z0-9_]*)":\s*"#)
        .unwrap()
        .replace_all(&fixed, r#""$1", "$2": "#);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&repaired) {
        return Ok(v);
    }

    if !fixed.trim().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        if !completed.trim().ends_with('}') {
            completed.push('}');
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&completed) {
            return Ok(v);
        }
    }

    anyhow::bail!("JSON repair failed: all repair strategies exhausted")
}

/// Walk a JSON string and replace invalid escape sequences inside string
/// values with a properly escaped backslash, so the result round-trips
/// through `serde_json`.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next) if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truncate_head_tail_keeps_both_ends() {
        let s = "a".repeat(20_000);
        let out = truncate_head_tail(&s, 100);
        assert!(out.contains("truncated"));
        assert!(out.starts_with('a'));
        assert!(out.ends_with('a'));
    }

    #[test]
    fn truncate_head_tail_passthrough_when_short() {
        assert_eq!(truncate_head_tail("hello", 100), "hello");
    }

    #[test]
    fn assign_missing_tool_use_ids_fills_blank_ids() {
        let mut msgs = vec![Message::new(Role::Assistant, String::new())];
        msgs[0].parts = vec![Part::ToolUse {
            id: String::new(),
            name: "read_file".into(),
            input: json!({}),
            status: ToolUseStatus::Pending,
        }];
        assert!(assign_missing_tool_use_ids(&mut msgs));
        let Part::ToolUse { id, .. } = &msgs[0].parts[0] else { unreachable!() };
        assert!(!id.is_empty());
    }

    #[test]
    fn assign_missing_tool_use_ids_is_noop_when_all_present() {
        let mut msgs = vec![Message::new(Role::Assistant, String::new())];
        msgs[0].parts = vec![Part::ToolUse {
            id: "already-set".into(),
            name: "read_file".into(),
            input: json!({}),
            status: ToolUseStatus::Pending,
        }];
        assert!(!assign_missing_tool_use_ids(&mut msgs));
    }

    #[test]
    fn build_outgoing_messages_drops_system_role() {
        let msgs = vec![Message::new(Role::System, "hidden".into())];
        assert!(build_outgoing_messages(&msgs).is_empty());
    }

    #[test]
    fn build_outgoing_messages_maps_tool_result() {
        let mut msg = Message::new(Role::User, String::new());
        msg.parts = vec![Part::ToolResult {
            tool_id: "t1".into(),
            output: "ok".into(),
            is_error: false,
            is_compacted: false,
            title: None,
            metadata: None,
        }];
        let out = build_outgoing_messages(&[msg]);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].content, MessageContent::ToolResult { .. }));
    }

    #[test]
    fn build_outgoing_messages_skips_tool_use_without_id() {
        let mut msg = Message::new(Role::Assistant, String::new());
        msg.parts = vec![Part::ToolUse { id: String::new(), name: "x".into(), input: json!({}), status: ToolUseStatus::Pending }];
        assert!(build_outgoing_messages(&[msg]).is_empty());
    }

    #[test]
    fn extract_n_ctx_from_error_parses_nested_field() {
        let err = anyhow::anyhow!(
            "driver error 400: {{\"error\":{{\"type\":\"exceed_context_size_error\",\"n_ctx\":54272}}}}"
        );
        assert_eq!(extract_n_ctx_from_error(&err), Some(54272));
    }

    #[test]
    fn extract_n_ctx_from_error_ignores_unrelated_errors() {
        let err = anyhow::anyhow!("connection refused");
        assert_eq!(extract_n_ctx_from_error(&err), None);
    }

    #[test]
    fn strip_think_wrappers_removes_tags() {
        assert_eq!(strip_think_wrappers("<think>hello</think>".to_string()), "hello");
    }

    #[test]
    fn extract_inline_think_block_detects_whole_text() {
        assert_eq!(extract_inline_think_block("<think>plan</think>"), Some("plan".to_string()));
    }

    #[test]
    fn extract_inline_think_block_rejects_trailing_content() {
        assert_eq!(extract_inline_think_block("<think>plan</think>answer"), None);
    }

    #[test]
    fn pending_tool_call_substitutes_empty_object_for_blank_args() {
        let call = PendingToolCall { id: "1".into(), name: "x".into(), args_buf: String::new() }.finish();
        assert_eq!(call.args, json!({}));
    }

    #[test]
    fn pending_tool_call_parses_valid_json() {
        let call = PendingToolCall { id: "1".into(), name: "x".into(), args_buf: r#"{"a":1}"#.into() }.finish();
        assert_eq!(call.args, json!({"a": 1}));
    }

    #[test]
    fn pending_tool_call_repairs_bad_escape() {
        let call = PendingToolCall { id: "1".into(), name: "x".into(), args_buf: r#"{"cmd":"a\cb"}"#.into() }.finish();
        assert_eq!(call.args["cmd"], json!("a\\\\cb"));
    }

    #[test]
    fn fix_invalid_json_escapes_leaves_valid_escapes_alone() {
        assert_eq!(fix_invalid_json_escapes(r#""a\nb""#), r#""a\nb""#);
    }

    #[test]
    fn tool_call_detail_prefers_path_pattern() {
        assert_eq!(tool_call_detail("read_file", &json!({"path": "a.txt"})), "a.txt");
    }

    #[test]
    fn tool_call_detail_falls_back_to_raw_args() {
        assert_eq!(tool_call_detail("ask_question", &json!({"questions": []})), json!({"questions": []}).to_string());
    }
}
