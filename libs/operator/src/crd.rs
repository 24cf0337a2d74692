use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How out-of-band changes to managed objects are handled.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealPolicy {
    /// Re-apply the desired state automatically.
    #[default]
    Auto,
    /// Report drift in status only; an operator heals by pushing to Git.
    Manual,
    /// Like `manual`, but additionally emit a drift event per resource.
    Notify,
}

/// Declarative description of one Git repository to reconcile into the
/// cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "nopea.io",
    version = "v1alpha1",
    kind = "GitRepository",
    namespaced,
    status = "GitRepositoryStatus",
    shortname = "gitrepo",
    printcolumn = r#"{"name":"Phase", "jsonPath":".status.phase", "type":"string"}"#,
    printcolumn = r#"{"name":"Commit", "jsonPath":".status.lastSyncedCommit", "type":"string"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    /// Clone URL of the repository.
    pub url: String,
    /// Branch to track. Defaults to `main`.
    pub branch: Option<String>,
    /// Subdirectory holding the manifests. Defaults to the repository root.
    pub path: Option<String>,
    /// Namespace manifests are applied into. Defaults to the namespace of
    /// this resource.
    pub target_namespace: Option<String>,
    /// Poll interval, `^(\d+)(s|m|h)$`. Invalid or absent means five
    /// minutes.
    pub interval: Option<String>,
    /// Pauses syncing and drift healing while true.
    pub suspend: Option<bool>,
    pub heal_policy: Option<HealPolicy>,
    /// How long detected manual drift is left alone before healing,
    /// same grammar as `interval`. Absent means heal immediately.
    pub heal_grace_period: Option<String>,
}

/// Phase of the repository state machine, mirrored into status.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    #[default]
    Initializing,
    Syncing,
    Synced,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initializing => "Initializing",
            Phase::Syncing => "Syncing",
            Phase::Synced => "Synced",
            Phase::Failed => "Failed",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositoryStatus {
    pub phase: Option<Phase>,
    pub last_synced_commit: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub message: Option<String>,
    /// Set to `metadata.generation` once a spec revision has been
    /// reconciled successfully; the controller compares the two to tell
    /// spec changes from status-only updates.
    pub observed_generation: Option<i64>,
}
