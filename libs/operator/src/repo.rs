use crate::crd::{GitRepository, HealPolicy};
use crate::error::{Error, Result};

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Parses the duration grammar `^(\d+)(s|m|h)$`. Anything else is `None`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let (digits, unit) = s.as_bytes().split_at(s.len().checked_sub(1)?);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let n: u64 = std::str::from_utf8(digits).ok()?.parse().ok()?;
    let secs = match unit {
        b"s" => n,
        b"m" => n.checked_mul(60)?,
        b"h" => n.checked_mul(3600)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

fn poll_interval_or_default(repo: &str, field: Option<&str>) -> Duration {
    match field {
        None => DEFAULT_POLL_INTERVAL,
        Some(s) => match parse_duration(s) {
            Some(d) if !d.is_zero() => d,
            _ => {
                warn!(repo, interval = s, "invalid poll interval, using default");
                DEFAULT_POLL_INTERVAL
            }
        },
    }
}

/// Immutable, validated view of a `GitRepository` spec. Workers operate on
/// this value; the custom resource itself stays the source of truth.
#[derive(Debug, Clone, PartialEq)]
pub struct RepositorySpec {
    pub name: String,
    pub source_namespace: String,
    pub url: String,
    pub branch: String,
    pub subpath: Option<String>,
    pub target_namespace: String,
    pub poll_interval: Duration,
    pub suspend: bool,
    pub heal_policy: HealPolicy,
    pub heal_grace_period: Option<Duration>,
    pub generation: i64,
    pub observed_generation: Option<i64>,
}

impl RepositorySpec {
    pub fn from_resource(repo: &GitRepository) -> Result<Self> {
        let name = repo
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidResource("missing metadata.name".into()))?;
        let source_namespace = repo
            .metadata
            .namespace
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidResource("missing metadata.namespace".into()))?;
        let spec = &repo.spec;
        if spec.url.is_empty() {
            return Err(Error::InvalidResource("missing spec.url".into()));
        }

        let heal_grace_period = spec
            .heal_grace_period
            .as_deref()
            .and_then(|s| match parse_duration(s) {
                Some(d) => Some(d),
                None => {
                    warn!(repo = %name, grace = s, "invalid heal grace period, ignoring");
                    None
                }
            });

        Ok(RepositorySpec {
            poll_interval: poll_interval_or_default(&name, spec.interval.as_deref()),
            branch: spec
                .branch
                .clone()
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            subpath: spec.path.clone().filter(|p| !p.is_empty()),
            target_namespace: spec
                .target_namespace
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| source_namespace.clone()),
            suspend: spec.suspend.unwrap_or(false),
            heal_policy: spec.heal_policy.unwrap_or_default(),
            heal_grace_period,
            url: spec.url.clone(),
            generation: repo.metadata.generation.unwrap_or(0),
            observed_generation: repo.status.as_ref().and_then(|s| s.observed_generation),
            name,
            source_namespace,
        })
    }

    /// Reconcile passes fire at twice the poll interval.
    pub fn reconcile_interval(&self) -> Duration {
        self.poll_interval * 2
    }

    /// Working directory under `base`, derived from the repository name
    /// with every character outside `[A-Za-z0-9_-]` replaced by `_`.
    pub fn work_dir(&self, base: &Path) -> PathBuf {
        let sanitized: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        base.join(sanitized)
    }
}

impl GitRepository {
    /// `true` when the spec revision differs from the last reconciled one,
    /// i.e. the change is more than a status update.
    pub fn spec_changed(&self) -> bool {
        let generation = self.metadata.generation.unwrap_or(0);
        match self.status.as_ref().and_then(|s| s.observed_generation) {
            Some(observed) => generation != observed,
            None => true,
        }
    }

}
