// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use regex::Regex;
use serde_json::Value;

use crate::policy::ApprovalPolicy;

/// One entry in the ordered permission rule list.
///
/// Rules are matched in declaration order against `(permission_name, pattern)`;
/// the first whose `permission_name` matches exactly and whose `pattern` glob
/// matches the call's resolved pattern wins. Unmatched calls default to allow.
#[derive(Debug, Clone)]
pub struct PermissionRule {
    pub permission_name: String,
    pub pattern: String,
    pub action: ApprovalPolicy,
}

impl PermissionRule {
    pub fn new(permission_name: impl Into<String>, pattern: impl Into<String>, action: ApprovalPolicy) -> Self {
        Self { permission_name: permission_name.into(), pattern: pattern.into(), action }
    }
}

/// Evaluates an ordered rule list against a permission name and pattern,
/// yielding allow/ask/deny per call.
#[derive(Debug, Default)]
pub struct PermissionEngine {
    rules: Vec<PermissionRule>,
}

impl PermissionEngine {
    pub fn new(rules: Vec<PermissionRule>) -> Self {
        Self { rules }
    }

    /// Evaluate the rule list for `permission_name` against `pattern`.
    /// Unmatched → allow, matching the source's effective default.
    pub fn evaluate(&self, permission_name: &str, pattern: &str) -> ApprovalPolicy {
        for rule in &self.rules {
            if rule.permission_name != permission_name {
                continue;
            }
            if glob_match(&rule.pattern, pattern) {
                return rule.action;
            }
        }
        ApprovalPolicy::Auto
    }

    /// Full decision for one tool invocation: permission-name collapsing,
    /// pattern extraction, and the external-directory short-circuit.
    ///
    /// `project_dir` is the configured project root; absolute patterns
    /// resolving outside of it are additionally checked against the
    /// `external_directory` permission before the tool's own rule path,
    /// and a deny there short-circuits regardless of the tool's own result.
    pub fn decide_for_call(&self, tool_name: &str, args: &Value, project_dir: &Path) -> ApprovalPolicy {
        let permission_name = tool_permission_name(tool_name);
        let pattern = tool_pattern(tool_name, args);

        if let Ok(abs) = std::fs::canonicalize(&pattern) {
            if !abs.starts_with(project_dir) {
                if self.evaluate("external_directory", &pattern) == ApprovalPolicy::Deny {
                    return ApprovalPolicy::Deny;
                }
            }
        } else if Path::new(&pattern).is_absolute() && !Path::new(&pattern).starts_with(project_dir) {
            if self.evaluate("external_directory", &pattern) == ApprovalPolicy::Deny {
                return ApprovalPolicy::Deny;
            }
        }

        self.evaluate(permission_name, &pattern)
    }
}

/// Collapse a tool name to its permission name. Edit-class tools share a
/// single `edit` permission so a user can approve "editing" once instead of
/// per-tool.
pub fn tool_permission_name(tool_name: &str) -> &str {
    match tool_name {
        "edit" | "edit_file" | "multiedit" | "patch" | "write" | "apply_patch" => "edit",
        other => other,
    }
}

/// Extract the pattern a rule matches against: the shell command for
/// bash/shell tools, otherwise the first present path-like argument.
pub fn tool_pattern(tool_name: &str, args: &Value) -> String {
    match tool_name {
        "bash" | "shell" => args
            .get("shell_command")
            .or_else(|| args.get("command"))
            .and_then(|v| v.as_str())
            .unwrap_or("*")
            .to_string(),
        _ => ["filePath", "file_path", "path"]
            .iter()
            .find_map(|key| args.get(*key).and_then(|v| v.as_str()))
            .unwrap_or("*")
            .to_string(),
    }
}

/// Glob match supporting `*`, `?`, and `**` with path-separator sensitivity:
/// `*`/`?` never cross a `/`, `**` matches across directory boundaries.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    re.push_str(".*");
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map(|r| r.is_match(text)).unwrap_or(false)
}

/// Tracks the last N (name, canonical-args) pairs per doom-loop detection,
/// keyed by call signature equality rather than session, so the conductor
/// owns one instance per session.
#[derive(Debug, Default)]
pub struct DoomLoopWindow {
    last_name: Option<String>,
    last_args: Option<String>,
    count: u32,
}

/// Consecutive identical calls required before the `doom_loop` permission
/// is consulted.
pub const DOOM_LOOP_THRESHOLD: u32 = 3;

impl DoomLoopWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call and report whether this call completes the threshold
    /// run of identical invocations. Canonicalizes `args` via serde_json's
    /// stable key ordering for structural (not textual) comparison.
    pub fn observe(&mut self, name: &str, args: &Value) -> bool {
        let canonical = canonical_json(args);
        let same = self.last_name.as_deref() == Some(name) && self.last_args.as_deref() == Some(canonical.as_str());
        if same {
            self.count += 1;
        } else {
            self.last_name = Some(name.to_string());
            self.last_args = Some(canonical);
            self.count = 1;
        }
        self.count >= DOOM_LOOP_THRESHOLD
    }

    /// Reset the tracking window, e.g. after a permission path that allows
    /// the call to proceed.
    pub fn reset(&mut self) {
        self.last_name = None;
        self.last_args = None;
        self.count = 0;
    }
}

/// Canonical JSON: keys sorted recursively so structurally-identical inputs
/// with different key order compare equal.
fn canonical_json(v: &Value) -> String {
    fn sort(v: &Value) -> Value {
        match v {
            Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                Value::Object(entries.into_iter().collect())
            }
            Value::Array(arr) => Value::Array(arr.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    sort(v).to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
