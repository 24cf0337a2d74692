pub mod client;
pub mod protocol;

pub use client::{GitClient, GitClientConfig};

use crate::error::Result;
use crate::resource::CommitSha;

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

/// Head commit details as reported by the collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct HeadInfo {
    pub sha: CommitSha,
    pub author: String,
    pub email: String,
    pub message: String,
    pub timestamp: i64,
}

/// Git operations the core depends on. The production implementation talks
/// to the co-located collaborator process over a unix stream; tests use the
/// in-memory fake.
///
/// File paths returned by [`files`](GitOps::files) are relative to the
/// repository root, so they can be passed straight to
/// [`read`](GitOps::read).
#[async_trait]
pub trait GitOps: Send + Sync {
    /// Clone-or-fetch and hard-reset to the branch head; returns the
    /// resulting HEAD commit.
    async fn sync(&self, url: &str, branch: &str, path: &Path, depth: u32) -> Result<CommitSha>;

    async fn files(&self, path: &Path, subpath: Option<&str>) -> Result<Vec<String>>;

    async fn read(&self, path: &Path, file: &str) -> Result<Vec<u8>>;

    async fn head(&self, path: &Path) -> Result<HeadInfo>;

    async fn checkout(&self, path: &Path, sha: &CommitSha) -> Result<CommitSha>;

    async fn ls_remote(&self, url: &str, branch: &str) -> Result<CommitSha>;
}
