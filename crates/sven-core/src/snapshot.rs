// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Content-addressed snapshots of the project working directory, backed by a
//! sidecar git repository whose object database lives in the application
//! data directory and whose work-tree is the project itself. The user's own
//! `.git`, if any, is never touched: every invocation pins `GIT_DIR`/
//! `GIT_WORK_TREE` explicitly, following the subprocess idiom `sven-runtime`
//! already uses for its own git-context probing.
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

const GIT_TIMEOUT: Duration = Duration::from_secs(30);
const CLEANUP_MAX_AGE_DAYS: u64 = 7;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("git subprocess failed to start: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git subprocess timed out")]
    Timeout,
    #[error("git exited with status {status}: {stderr}")]
    GitFailed { status: i32, stderr: String },
}

/// One entry in a `DiffFull` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChangeStatus {
    Added,
    Deleted,
    Modified,
}

#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: String,
    pub status: FileChangeStatus,
    pub additions: usize,
    pub deletions: usize,
    pub before: Option<String>,
    pub after: Option<String>,
}

pub struct SnapshotStore {
    git_dir: PathBuf,
    work_tree: PathBuf,
}

impl SnapshotStore {
    /// `data_dir` is the application data directory; the sidecar repository
    /// lives at `<data_dir>/snapshot`. `project_dir` is the work-tree.
    pub fn new(data_dir: &Path, project_dir: &Path) -> Self {
        Self { git_dir: data_dir.join("snapshot"), work_tree: project_dir.to_path_buf() }
    }

    /// Initialize the sidecar repository if it does not already exist.
    pub async fn ensure_initialized(&self) -> Result<(), SnapshotError> {
        if self.git_dir.join("HEAD").exists() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.git_dir).await?;
        self.run(&["init", "--quiet"]).await?;
        self.run(&["config", "core.autocrlf", "false"]).await?;
        self.run(&["config", "core.quotepath", "false"]).await?;
        Ok(())
    }

    /// Stage the entire work-tree and write it as a tree object, returning
    /// its hash. Fatal on error: the caller has no safe fallback.
    pub async fn track(&self) -> Result<String, SnapshotError> {
        self.run(&["add", "-A"]).await?;
        let out = self.run(&["write-tree"]).await?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Paths whose blob differs between `from` and the current index.
    /// Internal failures degrade to an empty list.
    pub async fn patch(&self, from: &str) -> Vec<String> {
        let out = match self.run(&["diff", "--name-only", from]).await {
            Ok(o) => o,
            Err(_) => return vec![],
        };
        String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// Unconditionally replace working-tree files with those recorded in
    /// `hash`. Fatal on error.
    pub async fn restore(&self, hash: &str) -> Result<(), SnapshotError> {
        self.run(&["read-tree", hash]).await?;
        self.run(&["checkout-index", "-a", "-f"]).await?;
        Ok(())
    }

    /// For every path in `paths`, check the file out at `hash`; if it did
    /// not exist in that snapshot, delete it from the work-tree. Fatal on
    /// error.
    pub async fn revert(&self, hash: &str, paths: &[String]) -> Result<(), SnapshotError> {
        for path in paths {
            let existed = self.run(&["cat-file", "-e", &format!("{hash}:{path}")]).await.is_ok();
            if existed {
                self.run(&["checkout", hash, "--", path]).await?;
            } else {
                let _ = tokio::fs::remove_file(self.work_tree.join(path)).await;
            }
        }
        Ok(())
    }

    /// Textual patch from `from` to the current working tree. Degrades to
    /// an empty string on internal failure.
    pub async fn diff(&self, from: &str) -> String {
        match self.run(&["diff", from]).await {
            Ok(out) => String::from_utf8_lossy(&out.stdout).to_string(),
            Err(_) => String::new(),
        }
    }

    /// Structured per-file changes between two snapshots. Degrades to an
    /// empty list on internal failure.
    pub async fn diff_full(&self, from: &str, to: &str) -> Vec<FileChange> {
        let numstat = match self.run(&["diff", "--numstat", from, to]).await {
            Ok(out) => String::from_utf8_lossy(&out.stdout).to_string(),
            Err(_) => return vec![],
        };
        let mut changes = Vec::new();
        for line in numstat.lines() {
            let mut parts = line.split_whitespace();
            let additions: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let deletions: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let path = match parts.next() {
                Some(p) => p.to_string(),
                None => continue,
            };
            let before = self.show(from, &path).await;
            let after = self.show(to, &path).await;
            let status = match (&before, &after) {
                (None, Some(_)) => FileChangeStatus::Added,
                (Some(_), None) => FileChangeStatus::Deleted,
                _ => FileChangeStatus::Modified,
            };
            changes.push(FileChange { path, status, additions, deletions, before, after });
        }
        changes
    }

    async fn show(&self, hash: &str, path: &str) -> Option<String> {
        self.run(&["show", &format!("{hash}:{path}")])
            .await
            .ok()
            .map(|out| String::from_utf8_lossy(&out.stdout).to_string())
    }

    /// Prune objects older than seven days. Degrades silently: pruning is
    /// housekeeping, not correctness.
    pub async fn cleanup(&self) {
        let expire = format!("{CLEANUP_MAX_AGE_DAYS}.days.ago");
        let _ = self.run(&["reflog", "expire", "--expire", &expire, "--all"]).await;
        let _ = self.run(&["gc", "--prune", &expire, "--quiet"]).await;
    }

    async fn run(&self, args: &[&str]) -> Result<Output, SnapshotError> {
        let fut = Command::new("git")
            .env("GIT_DIR", &self.git_dir)
            .env("GIT_WORK_TREE", &self.work_tree)
            .args(args)
            .output();
        let out = timeout(GIT_TIMEOUT, fut).await.map_err(|_| SnapshotError::Timeout)??;
        if !out.status.success() {
            return Err(SnapshotError::GitFailed {
                status: out.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(out)
    }
}
