// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Token-budget overflow detection, in-place tool-result pruning, and the
//! wholesale summary-replacement compaction path.
use sven_config::CompactionStrategy;
use sven_tools::OutputCategory;

use crate::session::{Message, Part, Role};

// ─── Overflow detection ────────────────────────────────────────────────────────

const DEFAULT_MAX_OUTPUT_RESERVE: u64 = 12_288;

/// `input + cache + output > contextWindow − effectiveMaxOutput`, where
/// `effectiveMaxOutput = min(modelMaxOutput, 12288)` if the model declares
/// one, else `12288`.
pub fn is_overflow(input_tokens: u64, cache_tokens: u64, output_tokens: u64, context_window: u64, model_max_output: Option<u64>) -> bool {
    let effective_max_output = model_max_output.map(|m| m.min(DEFAULT_MAX_OUTPUT_RESERVE)).unwrap_or(DEFAULT_MAX_OUTPUT_RESERVE);
    let reserved = context_window.saturating_sub(effective_max_output);
    input_tokens + cache_tokens + output_tokens > reserved
}

// ─── In-place pruning ───────────────────────────────────────────────────────────

/// Tool results from these tools are never pruned even once the token
/// budget is exceeded — their raw content still matters to every future turn.
pub const PROTECTED_TOOLS: &[&str] = &["ask_question"];

const PRUNE_TRIGGER_TOKENS: usize = 10_000;
const PRUNE_COMMIT_THRESHOLD: usize = 4_000;

fn tool_name_for(messages: &[Message], tool_id: &str) -> Option<String> {
    messages.iter().find_map(|m| {
        m.parts.iter().find_map(|p| match p {
            Part::ToolUse { id, name, .. } if id == tool_id => Some(name.clone()),
            _ => None,
        })
    })
}

/// Walk the message list backward, protecting the most recent user turn and
/// any summary-flagged prefix, and mark `tool_result` parts for replacement
/// with `[compacted]` once 10,000 accumulated approximate tokens have been
/// seen. Pruning requires at least two user-role messages to have been
/// encountered before it may begin, and is only committed (parts actually
/// mutated) when the total pruned-token estimate exceeds 4,000.
///
/// Returns the number of approximate tokens freed; `0` if nothing was pruned.
pub fn prune_tool_results(messages: &mut [Message]) -> usize {
    let last_user_idx = match messages.iter().rposition(|m| matches!(m.role, Role::User)) {
        Some(i) => i,
        None => return 0,
    };
    if last_user_idx == 0 {
        return 0;
    }

    let snapshot = messages.to_vec();
    let mut user_count = 0usize;
    let mut accumulated = 0usize;
    let mut candidates: Vec<(usize, usize)> = Vec::new();

    'outer: for midx in (0..last_user_idx).rev() {
        if snapshot[midx].is_summary {
            break 'outer;
        }
        if matches!(snapshot[midx].role, Role::User) {
            user_count += 1;
        }
        if user_count < 2 {
            continue;
        }
        for pidx in (0..snapshot[midx].parts.len()).rev() {
            if let Part::ToolResult { is_error, is_compacted, output, tool_id, .. } = &snapshot[midx].parts[pidx] {
                if *is_compacted {
                    break 'outer;
                }
                if *is_error {
                    continue;
                }
                if tool_name_for(&snapshot, tool_id).as_deref().map(|n| PROTECTED_TOOLS.contains(&n)).unwrap_or(false) {
                    continue;
                }
                if accumulated > PRUNE_TRIGGER_TOKENS {
                    candidates.push((midx, pidx));
                } else {
                    accumulated += output.len() / 4;
                }
            }
        }
    }

    if candidates.is_empty() {
        return 0;
    }

    let pruned_tokens: usize = candidates
        .iter()
        .map(|&(midx, pidx)| match &snapshot[midx].parts[pidx] {
            Part::ToolResult { output, .. } => output.len() / 4,
            _ => 0,
        })
        .sum();

    if pruned_tokens <= PRUNE_COMMIT_THRESHOLD {
        return 0;
    }

    for (midx, pidx) in candidates {
        if let Part::ToolResult { output, is_compacted, .. } = &mut messages[midx].parts[pidx] {
            *output = "[compacted]".to_string();
            *is_compacted = true;
        }
    }
    pruned_tokens
}

// ─── Summary-replacement compaction ────────────────────────────────────────────

const SUMMARIZE_SYSTEM_PROMPT: &str = "You are a helpful AI assistant tasked with summarizing conversations. \
Create a concise but complete summary that preserves all information relevant to continuing the work.";

const SUMMARIZE_USER_SUFFIX: &str = "Provide a detailed prompt for continuing our conversation above. \
Focus on information that would be helpful for continuing the conversation.";

const STRUCTURED_COMPACTION_PROMPT: &str = "\
You are a context compaction assistant for a software engineering agent. \
Produce a structured state checkpoint from the conversation history below. \
Use EXACTLY the following Markdown sections — do not add or remove sections. \
Be information-dense: preserve file paths, function names, error messages, \
code snippets, test names, and technical decisions verbatim where they matter.

## Active Task
Describe in 1-3 sentences what the agent is currently working on.

## Key Decisions & Rationale
List every significant technical decision made and why (bullet points). \
Include file or component names.

## Files & Artifacts
List every file that was read, modified, or created, with a brief note on what was done.

## Constraints & Requirements
List every requirement, constraint, or user preference that must be preserved.

## Pending Items
List every unfinished subtask or open question.

## Session Narrative
Write a dense technical summary (2-5 paragraphs) of what happened, \
capturing the essential flow of events, tool outputs, and reasoning. \
Focus on facts the agent will need to continue correctly.";

const COMPACTED_PREFIX: &str = "[Context compacted. Previous conversation summary:]";

/// Build the request text sent to the provider to produce a summary. The
/// caller is responsible for issuing the call and feeding the resulting
/// text to [`apply_summary`].
pub fn build_summary_request(messages: &[Message], strategy: &CompactionStrategy) -> (String, String) {
    let history_text = serialize_history(messages);
    match strategy {
        CompactionStrategy::Narrative => (SUMMARIZE_SYSTEM_PROMPT.to_string(), format!("{history_text}\n\n---\n\n{SUMMARIZE_USER_SUFFIX}")),
        CompactionStrategy::Structured => (SUMMARIZE_SYSTEM_PROMPT.to_string(), format!("{STRUCTURED_COMPACTION_PROMPT}\n\n---\n\n{history_text}")),
    }
}

/// Replace the entire message history with a single summary message, per
/// the compaction invariant: exactly one message, role=user, `is_summary`.
pub fn apply_summary(messages: &mut Vec<Message>, summary_text: &str) {
    let mut msg = Message::user(format!("{COMPACTED_PREFIX}\n{summary_text}"));
    msg.is_summary = true;
    messages.clear();
    messages.push(msg);
}

/// Deterministic fallback used when the session is too large to fit even a
/// compaction prompt within the context window. Drops all but the last
/// `keep_n` messages and prepends a canned notice. No model call is made.
pub fn emergency_compact(messages: &mut Vec<Message>, keep_n: usize) -> usize {
    let before = messages.len();
    let keep = keep_n.min(messages.len());
    let preserved: Vec<Message> = messages[messages.len() - keep..].to_vec();
    let notice = Message::assistant(
        "[Context emergency-compacted: earlier history was dropped to prevent a \
         context-window overflow. The agent may lack full context for earlier \
         decisions. Proceed carefully and ask the user to re-provide any missing \
         requirements if needed.]",
    );
    messages.clear();
    messages.push(notice);
    messages.extend(preserved);
    before
}

fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !matches!(m.role, Role::System))
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            let text = m
                .parts
                .iter()
                .map(|p| match p {
                    Part::Text { text } => text.clone(),
                    Part::ToolUse { name, input, .. } => format!("[tool_call: {name}({input})]"),
                    Part::ToolResult { output, .. } => format!("[tool_result: {output}]"),
                    Part::Reasoning { text } => format!("[thinking: {text}]"),
                    Part::Image { .. } => "[image]".to_string(),
                    Part::Patch { hash, files } => format!("[patch {hash}: {}]", files.join(", ")),
                    Part::StepStart { .. } | Part::StepFinish { .. } => String::new(),
                })
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Tool-result truncation (ambient, shared with the conductor's outgoing step) ──

/// Deterministic, content-aware tool-result truncation.
///
/// Returns `content` unchanged when it fits within `cap_tokens`.
/// Otherwise applies a category-specific extraction strategy that preserves
/// the most useful portion of the output.  Dispatching on [`OutputCategory`]
/// (not on tool names) keeps this function independent of the tools crate's
/// concrete tool list; each tool declares its own category.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len().saturating_sub(cap_chars);
    match category {
        OutputCategory::HeadTail => head_tail_lines(
            content,
            cap_chars,
            60,
            40,
            &format!("[... {{lines}} lines / {omitted_bytes} bytes omitted ...]"),
        ),
        OutputCategory::MatchList => head_lines(
            content,
            cap_chars,
            &format!(
                "[... {{lines}} more matches omitted ({omitted_bytes} bytes); \
                     use a more specific pattern to see them ...]"
            ),
        ),
        OutputCategory::FileContent => head_tail_lines(
            content,
            cap_chars,
            usize::MAX,
            usize::MAX,
            &format!(
                "[... {{lines}} lines omitted ({omitted_bytes} bytes); \
                     use read_file with offset/limit to see more ...]"
            ),
        ),
        OutputCategory::Generic => {
            let cut = content[..cap_chars]
                .rfind('\n')
                .map(|p| p + 1)
                .unwrap_or(cap_chars);
            format!(
                "{}\n[... {omitted_bytes} bytes omitted; \
                 content truncated to fit context budget ...]",
                &content[..cut]
            )
        }
    }
}

fn head_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = String::with_capacity(cap_chars);
    let mut kept_count = 0usize;
    for line in &lines {
        let needed = if kept.is_empty() { line.len() } else { line.len() + 1 };
        if kept.len() + needed > cap_chars {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
        kept_count += 1;
    }
    let omitted = lines.len().saturating_sub(kept_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{kept}\n{notice}")
}

fn head_tail_lines(content: &str, cap_chars: usize, max_head: usize, max_tail: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let half_cap = cap_chars / 2;

    let mut head = String::with_capacity(half_cap);
    let mut head_count = 0usize;
    for line in lines.iter().take(max_head) {
        let needed = if head.is_empty() { line.len() } else { line.len() + 1 };
        if head.len() + needed > half_cap {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev().take(max_tail) {
        let needed = if tail_lines.is_empty() { line.len() } else { line.len() + 1 };
        if tail_chars + needed > half_cap {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let tail_count = tail_lines.len();
    let tail = tail_lines.join("\n");

    let omitted = lines.len().saturating_sub(head_count + tail_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{head}\n{notice}\n{tail}")
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_history() -> Vec<Message> {
        vec![
            Message::user("What is Rust?"),
            Message::assistant("Rust is a systems programming language."),
            Message::user("Show me an example."),
            Message::assistant("fn main() { println!(\"Hello\"); }"),
        ]
    }

    // ── overflow detection ───────────────────────────────────────────────────

    #[test]
    fn overflow_triggers_past_reserved_budget() {
        assert!(is_overflow(900, 0, 150, 1000, Some(200)));
    }

    #[test]
    fn overflow_does_not_trigger_under_budget() {
        assert!(!is_overflow(100, 0, 50, 1000, Some(200)));
    }

    #[test]
    fn overflow_uses_12288_default_cap_without_declared_max_output() {
        // context window 20000, no declared max output -> reserve 12288
        assert!(is_overflow(8000, 0, 0, 20000, None));
        assert!(!is_overflow(7000, 0, 0, 20000, None));
    }

    #[test]
    fn overflow_caps_declared_max_output_at_12288() {
        // model declares max_output well above 12288; effective cap still 12288
        assert!(is_overflow(8000, 0, 0, 20000, Some(50_000)));
    }

    // ── pruning ──────────────────────────────────────────────────────────────

    fn tool_result_message(tool_id: &str, name: &str, output_len: usize) -> Vec<Message> {
        let mut use_msg = Message::assistant("");
        use_msg.parts = vec![Part::ToolUse { id: tool_id.into(), name: name.into(), input: json!({}), status: crate::session::ToolUseStatus::Completed }];
        let mut result_msg = Message::user("");
        result_msg.parts = vec![Part::ToolResult { tool_id: tool_id.into(), output: "x".repeat(output_len), is_error: false, is_compacted: false, title: None, metadata: None }];
        vec![use_msg, result_msg]
    }

    #[test]
    fn pruning_requires_two_user_messages_before_it_can_begin() {
        let mut messages = vec![Message::user("only one user turn")];
        messages.extend(tool_result_message("t1", "read_file", 50_000));
        messages.push(Message::user("final turn"));
        let pruned = prune_tool_results(&mut messages);
        assert_eq!(pruned, 0);
    }

    #[test]
    fn pruning_protects_most_recent_user_turn() {
        let mut messages = vec![Message::user("turn 1")];
        messages.extend(tool_result_message("t1", "read_file", 50_000));
        messages.push(Message::user("turn 2"));
        let mut last_result = tool_result_message("t2", "read_file", 50_000);
        messages.append(&mut last_result);
        let before_last = messages.last().cloned().unwrap();
        prune_tool_results(&mut messages);
        assert_eq!(messages.last().unwrap().parts[0].as_tool_result_id(), before_last.parts[0].as_tool_result_id());
        if let Part::ToolResult { is_compacted, .. } = &messages.last().unwrap().parts[0] {
            assert!(!is_compacted, "most recent user turn must not be pruned");
        }
    }

    #[test]
    fn pruning_skips_protected_tool_results() {
        let mut messages = vec![Message::user("turn 1")];
        messages.extend(tool_result_message("t1", "ask_question", 50_000));
        messages.push(Message::user("turn 2"));
        messages.extend(tool_result_message("t2", "read_file", 50_000));
        messages.push(Message::user("turn 3"));
        prune_tool_results(&mut messages);
        if let Part::ToolResult { is_compacted, .. } = &messages[1].parts[0] {
            assert!(!is_compacted, "ask_question result must never be pruned");
        }
    }

    #[test]
    fn pruning_marks_parts_after_threshold_exceeded() {
        let mut messages = vec![Message::user("turn 1")];
        for i in 0..5 {
            messages.extend(tool_result_message(&format!("t{i}"), "read_file", 3_000));
        }
        messages.push(Message::user("turn 2"));
        messages.extend(tool_result_message("tlast", "read_file", 100));
        messages.push(Message::user("turn 3"));
        let pruned = prune_tool_results(&mut messages);
        assert!(pruned > PRUNE_COMMIT_THRESHOLD);
    }

    #[test]
    fn pruned_part_content_becomes_literal_compacted_marker() {
        let mut messages = vec![Message::user("turn 1")];
        for i in 0..5 {
            messages.extend(tool_result_message(&format!("t{i}"), "read_file", 3_000));
        }
        messages.push(Message::user("turn 2"));
        messages.extend(tool_result_message("tlast", "read_file", 100));
        messages.push(Message::user("turn 3"));
        prune_tool_results(&mut messages);
        let any_compacted = messages.iter().any(|m| {
            m.parts.iter().any(|p| matches!(p, Part::ToolResult { is_compacted: true, output, .. } if output == "[compacted]"))
        });
        assert!(any_compacted);
    }

    // ── summary compaction ───────────────────────────────────────────────────

    #[test]
    fn apply_summary_produces_single_flagged_message() {
        let mut messages = make_history();
        apply_summary(&mut messages, "Working on X");
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0].role, Role::User));
        assert!(messages[0].is_summary);
        assert!(messages[0].content.starts_with("[Context compacted."));
        assert!(messages[0].content.contains("Working on X"));
    }

    #[test]
    fn build_summary_request_embeds_history() {
        let messages = make_history();
        let (_system, user) = build_summary_request(&messages, &CompactionStrategy::Narrative);
        assert!(user.contains("What is Rust?"));
    }

    #[test]
    fn structured_strategy_includes_required_sections() {
        let messages = make_history();
        let (_system, user) = build_summary_request(&messages, &CompactionStrategy::Structured);
        for heading in ["## Active Task", "## Key Decisions", "## Files & Artifacts", "## Constraints", "## Pending Items", "## Session Narrative"] {
            assert!(user.contains(heading), "missing {heading}");
        }
    }

    // ── emergency compaction ─────────────────────────────────────────────────

    #[test]
    fn emergency_compact_returns_original_count() {
        let mut msgs = make_history();
        let before = emergency_compact(&mut msgs, 2);
        assert_eq!(before, 4);
    }

    #[test]
    fn emergency_compact_preserves_most_recent_messages() {
        let mut msgs = make_history();
        emergency_compact(&mut msgs, 2);
        let text: Vec<String> = msgs.iter().map(|m| m.content.clone()).collect();
        assert!(text.iter().any(|t| t.contains("Show me an example")));
    }

    // ── smart_truncate (unchanged behavior, retained coverage) ───────────────

    fn make_lines(n: usize) -> String {
        (0..n).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n")
    }

    #[test]
    fn smart_truncate_returns_original_when_under_cap() {
        let short = "hello world";
        assert_eq!(smart_truncate(short, OutputCategory::HeadTail, 100), short);
    }

    #[test]
    fn headtail_preserves_first_and_last_lines() {
        let content = make_lines(200);
        let result = smart_truncate(&content, OutputCategory::HeadTail, 50);
        assert!(result.contains("line 0"));
        assert!(result.contains("line 199"));
    }

    #[test]
    fn generic_truncates_at_newline_boundary() {
        let content = format!("{}\n{}", "a".repeat(10), "b".repeat(100));
        let result = smart_truncate(&content, OutputCategory::Generic, 5);
        assert!(!result.contains("bbb"));
    }
}
