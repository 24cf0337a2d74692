use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A per-file or per-manifest failure inside a batch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    /// File path or resource key the failure belongs to.
    pub item: String,
    pub reason: String,
}

impl ItemError {
    pub fn new(item: impl Into<String>, reason: impl Into<String>) -> Self {
        ItemError {
            item: item.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.item, self.reason)
    }
}

fn join_items(items: &[ItemError]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// All errors the reconciliation core can surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("git sync failed: {0}")]
    GitSyncFailed(String),

    #[error("listing manifest files failed: {0}")]
    ListFilesFailed(String),

    /// Manifest parsing is all-or-nothing: one bad file rejects the batch.
    #[error("manifest parsing failed: {}", join_items(.0))]
    ParseFailed(Vec<ItemError>),

    #[error("apply failed: {}", join_items(.0))]
    ApplyFailed(Vec<ItemError>),

    #[error("invalid repository resource: {0}")]
    InvalidResource(String),

    #[error("watch disconnected: {0}")]
    WatchDisconnected(String),

    #[error("lease held or modified by another instance")]
    LeaseConflict,

    #[error("git collaborator crashed: {0}")]
    CollaboratorCrashed(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    /// Failure of a single git collaborator request, before the sync
    /// pipeline maps it to one of the typed kinds above.
    #[error("git request {op} failed: {reason}")]
    GitRequestFailed { op: &'static str, reason: String },

    #[error("kubernetes reported error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Low-cardinality label for failure counters.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::GitSyncFailed(_) => "git_sync_failed",
            Error::ListFilesFailed(_) => "list_files_failed",
            Error::ParseFailed(_) => "parse_failed",
            Error::ApplyFailed(_) => "apply_failed",
            Error::InvalidResource(_) => "invalid_resource",
            Error::WatchDisconnected(_) => "watch_disconnected",
            Error::LeaseConflict => "lease_conflict",
            Error::CollaboratorCrashed(_) => "collaborator_crashed",
            Error::NotFound(_) => "not_found",
            Error::GitRequestFailed { .. } => "git_request_failed",
            Error::Kube(_) => "kube_error",
            Error::Serialization(_) => "serialization_error",
        }
    }
}
