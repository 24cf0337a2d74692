use crate::error::{Error, ItemError, Result};
use crate::git::GitOps;
use crate::k8s::K8sOps;
use crate::repo::RepositorySpec;
use crate::resource::{CommitSha, Manifest};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

const CLONE_DEPTH: u32 = 1;

/// Result of one full sync cycle.
#[derive(Debug)]
pub struct SyncOutcome {
    pub commit: CommitSha,
    /// Server-echoed objects, including cluster-assigned defaults.
    pub applied: Vec<Manifest>,
    pub duration: Duration,
}

fn is_manifest_file(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    !base.starts_with('.')
        && (base.ends_with(".yaml") || base.ends_with(".yml"))
}

/// Parses one file as a YAML document stream. Nil and empty documents are
/// discarded, as are documents without the manifest identity fields.
fn parse_documents(bytes: &[u8]) -> std::result::Result<Vec<Manifest>, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| format!("not valid utf-8: {e}"))?;
    let mut manifests = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(doc).map_err(|e| e.to_string())?;
        if value
            .as_object()
            .map_or(true, |fields| fields.is_empty())
        {
            continue;
        }
        if let Ok(manifest) = Manifest::try_new(value) {
            manifests.push(manifest);
        }
    }
    Ok(manifests)
}

/// One sync cycle: git sync, list, read, parse, server-side apply.
/// Stateless; it never touches the [`StateStore`](crate::store::StateStore).
pub struct SyncExecutor {
    git: Arc<dyn GitOps>,
    k8s: Arc<dyn K8sOps>,
}

impl SyncExecutor {
    pub fn new(git: Arc<dyn GitOps>, k8s: Arc<dyn K8sOps>) -> Self {
        SyncExecutor { git, k8s }
    }

    /// Lists, reads and parses the manifests currently on disk under
    /// `work_dir`. Does not talk to git remotes; reconcile passes use this
    /// to obtain the desired state without re-fetching.
    pub async fn desired_manifests(
        &self,
        spec: &RepositorySpec,
        work_dir: &Path,
    ) -> Result<Vec<Manifest>> {
        let files = self
            .git
            .files(work_dir, spec.subpath.as_deref())
            .await
            .map_err(|e| Error::ListFilesFailed(e.to_string()))?;
        let mut names: Vec<String> = files.into_iter().filter(|f| is_manifest_file(f)).collect();
        names.sort();

        let mut manifests = Vec::new();
        let mut errors = Vec::new();
        for name in &names {
            match self.git.read(work_dir, name).await {
                Err(e) => errors.push(ItemError::new(name, e.to_string())),
                Ok(bytes) => match parse_documents(&bytes) {
                    Ok(docs) => manifests.extend(docs),
                    Err(reason) => errors.push(ItemError::new(name, reason)),
                },
            }
        }
        // all-or-nothing: a single broken file rejects the whole batch
        if !errors.is_empty() {
            return Err(Error::ParseFailed(errors));
        }

        for manifest in &mut manifests {
            manifest.default_namespace(&spec.target_namespace);
        }
        Ok(manifests)
    }

    pub async fn execute(&self, spec: &RepositorySpec, work_dir: &Path) -> Result<SyncOutcome> {
        let started = Instant::now();
        let commit = self
            .git
            .sync(&spec.url, &spec.branch, work_dir, CLONE_DEPTH)
            .await
            .map_err(|e| Error::GitSyncFailed(e.to_string()))?;
        let desired = self.desired_manifests(spec, work_dir).await?;
        debug!(repo = %spec.name, commit = commit.short(), manifests = desired.len(), "applying manifests");

        let mut applied = Vec::with_capacity(desired.len());
        let mut failures = Vec::new();
        for manifest in &desired {
            match self.k8s.apply(manifest).await {
                Ok(echoed) => applied.push(echoed),
                Err(e) => failures.push(ItemError::new(manifest.key().to_string(), e.to_string())),
            }
        }
        if !failures.is_empty() {
            return Err(Error::ApplyFailed(failures));
        }

        Ok(SyncOutcome {
            commit,
            applied,
            duration: started.elapsed(),
        })
    }
}
