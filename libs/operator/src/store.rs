use crate::crd::Phase;
use crate::resource::{CommitSha, Manifest, ResourceKey};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Per-repository sync summary.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub commit: Option<CommitSha>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub phase: Phase,
}

/// Process-wide in-memory state shared by all workers. Entries survive
/// worker crashes; nothing survives a process restart — truth is recovered
/// from Git and the cluster.
///
/// Each partition is keyed by repository name (plus a [`ResourceKey`] where
/// applicable). Workers only ever write under their own repository name, so
/// per-key atomicity is all the coordination needed.
#[derive(Debug, Default)]
pub struct StateStore {
    commits: DashMap<String, CommitSha>,
    last_applied: DashMap<(String, ResourceKey), Manifest>,
    drift_first_seen: DashMap<(String, ResourceKey), DateTime<Utc>>,
    sync_state: DashMap<String, SyncState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_commit(&self, repo: &str, commit: CommitSha) {
        self.commits.insert(repo.to_string(), commit);
    }

    pub fn get_commit(&self, repo: &str) -> Option<CommitSha> {
        self.commits.get(repo).map(|c| c.clone())
    }

    pub fn delete_commit(&self, repo: &str) {
        self.commits.remove(repo);
    }

    pub fn put_last_applied(&self, repo: &str, key: ResourceKey, manifest: Manifest) {
        self.last_applied.insert((repo.to_string(), key), manifest);
    }

    pub fn get_last_applied(&self, repo: &str, key: &ResourceKey) -> Option<Manifest> {
        self.last_applied
            .get(&(repo.to_string(), key.clone()))
            .map(|m| m.clone())
    }

    pub fn list_last_applied(&self, repo: &str) -> Vec<(ResourceKey, Manifest)> {
        let mut entries: Vec<_> = self
            .last_applied
            .iter()
            .filter(|e| e.key().0 == repo)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn delete_last_applied(&self, repo: &str, key: &ResourceKey) {
        self.last_applied.remove(&(repo.to_string(), key.clone()));
    }

    pub fn clear_last_applied(&self, repo: &str) {
        self.last_applied.retain(|k, _| k.0 != repo);
    }

    /// First call for a `(repo, key)` pair stores `now` and returns it;
    /// later calls return the stored timestamp unchanged.
    pub fn record_drift_first_seen(&self, repo: &str, key: &ResourceKey) -> DateTime<Utc> {
        *self
            .drift_first_seen
            .entry((repo.to_string(), key.clone()))
            .or_insert_with(Utc::now)
    }

    pub fn get_drift_first_seen(&self, repo: &str, key: &ResourceKey) -> Option<DateTime<Utc>> {
        self.drift_first_seen
            .get(&(repo.to_string(), key.clone()))
            .map(|t| *t)
    }

    pub fn clear_drift_first_seen(&self, repo: &str, key: &ResourceKey) {
        self.drift_first_seen.remove(&(repo.to_string(), key.clone()));
    }

    pub fn clear_all_drift_timestamps(&self, repo: &str) {
        self.drift_first_seen.retain(|k, _| k.0 != repo);
    }

    pub fn put_sync_state(&self, repo: &str, state: SyncState) {
        self.sync_state.insert(repo.to_string(), state);
    }

    pub fn get_sync_state(&self, repo: &str) -> Option<SyncState> {
        self.sync_state.get(repo).map(|s| s.clone())
    }

    #[cfg(test)]
    pub fn backdate_drift_first_seen(
        &self,
        repo: &str,
        key: &ResourceKey,
        timestamp: DateTime<Utc>,
    ) {
        self.drift_first_seen
            .insert((repo.to_string(), key.clone()), timestamp);
    }

    /// Drops every entry for a repository; used when the custom resource is
    /// deleted.
    pub fn remove_repo(&self, repo: &str) {
        self.delete_commit(repo);
        self.clear_last_applied(repo);
        self.clear_all_drift_timestamps(repo);
        self.sync_state.remove(repo);
    }
}
