// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Locate a model-supplied `old` string inside on-disk file content via a
//! cascade of progressively looser strategies, and produce the replaced
//! content. Distinct from the diff-hunk matcher used by the `edit_file`
//! built-in tool: this module implements the exact old/new whole-string
//! replacement contract.
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzyError {
    NotFound,
    Ambiguous,
}

/// Classic two-row dynamic-programming edit distance over bytes.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<u8> = a.bytes().collect();
    let b: Vec<u8> = b.bytes().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Similarity of a line pair: `1 − distance/max(len)`; empty/empty is 1.0.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

/// Replace `old` with `new` in `content`. See module docs for the strategy
/// cascade. With `replace_all = false`, a unique match is required; multiple
/// matches anywhere in the cascade are remembered as `Ambiguous` but do not
/// stop the search — a later strategy may still find a unique candidate.
pub fn fuzzy_replace(content: &str, old: &str, new: &str, replace_all: bool) -> Result<String, FuzzyError> {
    let mut saw_ambiguous = false;

    for candidates in strategy_candidates(content, old) {
        for candidate in candidates {
            if candidate.is_empty() {
                continue;
            }
            let count = content.matches(&candidate).count();
            if count == 0 {
                continue;
            }
            if replace_all {
                return Ok(content.replacen(&candidate, new, count));
            }
            let first = content.find(&candidate);
            let last = content.rfind(&candidate);
            if count == 1 && first == last {
                return Ok(content.replacen(&candidate, new, 1));
            }
            saw_ambiguous = true;
        }
    }

    if saw_ambiguous {
        Err(FuzzyError::Ambiguous)
    } else {
        Err(FuzzyError::NotFound)
    }
}

/// One candidate list per strategy, in priority order.
fn strategy_candidates(content: &str, old: &str) -> Vec<Vec<String>> {
    vec![
        identity(old),
        line_trimmed(content, old),
        block_anchor(content, old),
        whitespace_normalized(content, old),
        indentation_flexible(content, old),
        escape_normalized(content, old),
        trimmed_boundary(content, old),
        context_aware(content, old),
        multi_occurrence(old),
    ]
}

fn identity(old: &str) -> Vec<String> {
    vec![old.to_string()]
}

fn line_trimmed(content: &str, old: &str) -> Vec<String> {
    let old_lines: Vec<&str> = old.split('\n').collect();
    let content_lines: Vec<&str> = content.split('\n').collect();
    let k = old_lines.len();
    if k == 0 || content_lines.len() < k {
        return vec![];
    }
    let mut out = Vec::new();
    for start in 0..=(content_lines.len() - k) {
        let window = &content_lines[start..start + k];
        if window.iter().zip(&old_lines).all(|(w, o)| w.trim() == o.trim()) {
            out.push(window.join("\n"));
        }
    }
    out
}

fn block_anchor(content: &str, old: &str) -> Vec<String> {
    let old_lines: Vec<&str> = old.split('\n').collect();
    if old_lines.len() < 3 {
        return vec![];
    }
    let content_lines: Vec<&str> = content.split('\n').collect();
    let first = old_lines[0].trim();
    let last = old_lines[old_lines.len() - 1].trim();
    let min_w = old_lines.len();
    let max_w = (old_lines.len() * 2).min(content_lines.len());

    let mut ranked: Vec<(f64, String)> = Vec::new();
    for w in min_w..=max_w {
        if w > content_lines.len() {
            break;
        }
        for start in 0..=(content_lines.len() - w) {
            let window = &content_lines[start..start + w];
            if window[0].trim() != first || window[w - 1].trim() != last {
                continue;
            }
            let middle = &window[1..w - 1];
            let old_middle = &old_lines[1..old_lines.len() - 1];
            let n = middle.len().max(old_middle.len()).max(1);
            let mut total = 0.0;
            for i in 0..middle.len().max(old_middle.len()) {
                let a = middle.get(i).copied().unwrap_or("");
                let b = old_middle.get(i).copied().unwrap_or("");
                total += similarity_ratio(a, b);
            }
            let avg = total / n as f64;
            ranked.push((avg, window.join("\n")));
        }
    }
    if ranked.is_empty() {
        return vec![];
    }
    ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
    let threshold = if ranked.len() == 1 { 0.0 } else { 0.3 };
    ranked.into_iter().filter(|(score, _)| *score >= threshold).map(|(_, s)| s).collect()
}

fn collapse_ws(s: &str) -> String {
    let re = Regex::new(r"\s+").unwrap();
    re.replace_all(s.trim(), " ").to_string()
}

fn whitespace_normalized(content: &str, old: &str) -> Vec<String> {
    let old_lines: Vec<&str> = old.split('\n').collect();
    let normalized_old = collapse_ws(old);
    if old_lines.len() == 1 {
        let words: Vec<String> = old.split_whitespace().map(regex::escape).collect();
        if words.is_empty() {
            return vec![];
        }
        let pattern = words.join(r"\s+");
        if let Ok(re) = Regex::new(&pattern) {
            if let Some(m) = re.find(content) {
                return vec![m.as_str().to_string()];
            }
        }
        return vec![];
    }
    let content_lines: Vec<&str> = content.split('\n').collect();
    let k = old_lines.len();
    if content_lines.len() < k {
        return vec![];
    }
    let mut out = Vec::new();
    for start in 0..=(content_lines.len() - k) {
        let window = &content_lines[start..start + k];
        if collapse_ws(&window.join("\n")) == normalized_old {
            out.push(window.join("\n"));
        }
    }
    out
}

fn common_leading_ws<'a>(lines: &[&'a str]) -> usize {
    lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start_matches([' ', '\t']).len())
        .min()
        .unwrap_or(0)
}

fn strip_common_indent(lines: &[&str]) -> String {
    let indent = common_leading_ws(lines);
    lines.iter().map(|l| l.get(indent.min(l.len())..).unwrap_or("")).collect::<Vec<_>>().join("\n")
}

fn indentation_flexible(content: &str, old: &str) -> Vec<String> {
    let old_lines: Vec<&str> = old.split('\n').collect();
    let stripped_old = strip_common_indent(&old_lines);
    let content_lines: Vec<&str> = content.split('\n').collect();
    let k = old_lines.len();
    if k == 0 || content_lines.len() < k {
        return vec![];
    }
    let mut out = Vec::new();
    for start in 0..=(content_lines.len() - k) {
        let window = &content_lines[start..start + k];
        if strip_common_indent(window) == stripped_old {
            out.push(window.join("\n"));
        }
    }
    out
}

fn interpret_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('n') => { out.push('\n'); chars.next(); }
                Some('t') => { out.push('\t'); chars.next(); }
                Some('r') => { out.push('\r'); chars.next(); }
                Some('\'') => { out.push('\''); chars.next(); }
                Some('"') => { out.push('"'); chars.next(); }
                Some('\\') => { out.push('\\'); chars.next(); }
                Some('$') => { out.push('$'); chars.next(); }
                Some('`') => { out.push('`'); chars.next(); }
                _ => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn escape_normalized(content: &str, old: &str) -> Vec<String> {
    let interpreted = interpret_escapes(old);
    if interpreted == old {
        return vec![];
    }
    if content.contains(&interpreted) {
        vec![interpreted]
    } else {
        vec![]
    }
}

fn trimmed_boundary(content: &str, old: &str) -> Vec<String> {
    let mut out = vec![old.trim().to_string()];
    let old_lines: Vec<&str> = old.split('\n').collect();
    let content_lines: Vec<&str> = content.split('\n').collect();
    let k = old_lines.len();
    if k > 0 && content_lines.len() >= k {
        for start in 0..=(content_lines.len() - k) {
            let window = &content_lines[start..start + k];
            if window.join("\n").trim() == old.trim() {
                out.push(window.join("\n"));
            }
        }
    }
    out
}

fn context_aware(content: &str, old: &str) -> Vec<String> {
    let old_lines: Vec<&str> = old.split('\n').collect();
    let content_lines: Vec<&str> = content.split('\n').collect();
    let k = old_lines.len();
    if k < 3 || content_lines.len() < k {
        return vec![];
    }
    for start in 0..=(content_lines.len() - k) {
        let window = &content_lines[start..start + k];
        let middle = &window[1..k - 1];
        let old_middle = &old_lines[1..k - 1];
        let non_empty: Vec<(usize, &&str)> = old_middle.iter().enumerate().filter(|(_, l)| !l.trim().is_empty()).collect();
        if non_empty.is_empty() {
            continue;
        }
        let matches = non_empty.iter().filter(|(i, l)| middle.get(*i).map(|m| m.trim() == l.trim()).unwrap_or(false)).count();
        if matches as f64 / non_empty.len() as f64 >= 0.5 {
            return vec![window.join("\n")];
        }
    }
    vec![]
}

fn multi_occurrence(old: &str) -> Vec<String> {
    vec![old.to_string()]
}
