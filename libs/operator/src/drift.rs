use crate::crd::HealPolicy;
use crate::error::{ItemError, Result};
use crate::events::{DriftAction, EventEmitter};
use crate::k8s::K8sOps;
use crate::metrics::SharedMetrics;
use crate::repo::RepositorySpec;
use crate::resource::{Manifest, ResourceKey};
use crate::store::StateStore;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Annotation that suspends healing of a single live object.
pub const SUSPEND_HEAL_ANNOTATION: &str = "nopea.io/suspend-heal";

const STRIPPED_METADATA: [&str; 6] = [
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
];
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Strips the fields the cluster manages on its own, so that a manifest
/// read back from the API server hashes the same as the one we sent.
pub fn normalize(value: &Value) -> Value {
    let mut v = value.clone();
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in STRIPPED_METADATA {
                meta.remove(field);
            }
            let empty = match meta.get_mut("annotations").and_then(Value::as_object_mut) {
                Some(annotations) => {
                    annotations.remove(LAST_APPLIED_ANNOTATION);
                    annotations.is_empty()
                }
                None => false,
            };
            if empty {
                meta.remove("annotations");
            }
        }
    }
    v
}

/// Canonical content hash of a normalized manifest. serde_json maps keep
/// their keys sorted, so equal maps serialize to equal bytes.
pub fn manifest_hash(value: &Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

fn normalized_hash(manifest: &Manifest) -> String {
    manifest_hash(&normalize(manifest.as_value()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftType {
    NoDrift,
    /// Git moved; the cluster still matches what we last applied.
    GitChange,
    /// The cluster was changed out-of-band; Git did not move.
    ManualDrift,
    /// Both sides changed.
    Conflict,
}

impl DriftType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftType::NoDrift => "no_drift",
            DriftType::GitChange => "git_change",
            DriftType::ManualDrift => "manual_drift",
            DriftType::Conflict => "conflict",
        }
    }
}

/// Three-way comparison over normalized-hash equality.
pub fn three_way(last_applied: &Manifest, desired: &Manifest, live: &Manifest) -> DriftType {
    let last = normalized_hash(last_applied);
    let git_matches = last == normalized_hash(desired);
    let live_matches = normalized_hash(live) == last;
    match (git_matches, live_matches) {
        (true, true) => DriftType::NoDrift,
        (false, true) => DriftType::GitChange,
        (true, false) => DriftType::ManualDrift,
        (false, false) => DriftType::Conflict,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Never applied, not in the cluster.
    NewResource,
    /// Never applied by us but already present: adopt it.
    NeedsApply,
    Drift(DriftType),
}

pub fn classify(
    last_applied: Option<&Manifest>,
    live: Option<&Manifest>,
    desired: &Manifest,
) -> Classification {
    match (last_applied, live) {
        (None, None) => Classification::NewResource,
        (None, Some(_)) => Classification::NeedsApply,
        (Some(last), Some(live)) => Classification::Drift(three_way(last, desired, live)),
        // Applied before but gone from the cluster: out-of-band delete.
        (Some(_), None) => Classification::Drift(DriftType::ManualDrift),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Heal,
    Skip,
    /// `notify` policy: leave the drift, emit the event.
    Report,
}

/// Decides whether a classified drift is re-applied now. Git-originated
/// changes are only ever blocked by break-glass; manual drift additionally
/// requires the `auto` policy and an elapsed grace period.
pub fn arbitrate(
    drift: DriftType,
    policy: HealPolicy,
    break_glass: bool,
    grace: Option<Duration>,
    drift_age: Option<Duration>,
) -> Verdict {
    if break_glass {
        return Verdict::Skip;
    }
    match drift {
        DriftType::NoDrift => Verdict::Skip,
        DriftType::GitChange => Verdict::Heal,
        DriftType::ManualDrift | DriftType::Conflict => match policy {
            HealPolicy::Auto => match grace {
                None => Verdict::Heal,
                Some(grace) if drift_age.unwrap_or_default() >= grace => Verdict::Heal,
                Some(_) => Verdict::Skip,
            },
            HealPolicy::Manual => Verdict::Skip,
            HealPolicy::Notify => Verdict::Report,
        },
    }
}

/// Outcome of one reconcile pass.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub checked: usize,
    pub healed: Vec<ResourceKey>,
    pub skipped: Vec<ResourceKey>,
    pub errors: Vec<ItemError>,
    pub suspended: bool,
}

/// Drift detection and healing over the desired manifests of one
/// repository. Stateless apart from the shared [`StateStore`].
pub struct DriftEngine {
    store: Arc<StateStore>,
    k8s: Arc<dyn K8sOps>,
    metrics: SharedMetrics,
}

impl DriftEngine {
    pub fn new(store: Arc<StateStore>, k8s: Arc<dyn K8sOps>, metrics: SharedMetrics) -> Self {
        DriftEngine {
            store,
            k8s,
            metrics,
        }
    }

    /// Classifies every desired manifest against the store and the live
    /// cluster, heals where policy allows, and emits one drift event per
    /// drifted resource.
    pub async fn reconcile_pass(
        &self,
        spec: &RepositorySpec,
        desired: &[Manifest],
        events: &EventEmitter,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        if spec.suspend {
            debug!(repo = %spec.name, "repository suspended, skipping reconcile");
            report.suspended = true;
            return Ok(report);
        }

        for manifest in desired {
            report.checked += 1;
            if let Err(e) = self.reconcile_one(spec, manifest, events, &mut report).await {
                warn!(repo = %spec.name, resource = %manifest.key(), error = %e, "reconcile failed for resource");
                report
                    .errors
                    .push(ItemError::new(manifest.key().to_string(), e.to_string()));
            }
        }
        Ok(report)
    }

    async fn reconcile_one(
        &self,
        spec: &RepositorySpec,
        desired: &Manifest,
        events: &EventEmitter,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let repo = spec.name.as_str();
        let key = desired.key();
        let last_applied = self.store.get_last_applied(repo, &key);
        let live = self
            .k8s
            .get(
                desired.api_version(),
                desired.kind(),
                &key.namespace,
                &key.name,
            )
            .await?;

        match classify(last_applied.as_ref(), live.as_ref(), desired) {
            Classification::NewResource | Classification::NeedsApply => {
                let applied = self.k8s.apply(desired).await?;
                self.store.put_last_applied(
                    repo,
                    key.clone(),
                    Manifest::try_new(normalize(applied.as_value()))
                        .map_err(crate::error::Error::InvalidResource)?,
                );
                report.healed.push(key);
            }
            Classification::Drift(DriftType::NoDrift) => {
                self.store.clear_drift_first_seen(repo, &key);
            }
            Classification::Drift(drift) => {
                let break_glass = live
                    .as_ref()
                    .and_then(|l| l.annotation(SUSPEND_HEAL_ANNOTATION))
                    == Some("true");
                let drift_age = match drift {
                    DriftType::ManualDrift | DriftType::Conflict => {
                        let first_seen = self.store.record_drift_first_seen(repo, &key);
                        Some((Utc::now() - first_seen).to_std().unwrap_or_default())
                    }
                    _ => None,
                };

                let verdict = arbitrate(
                    drift,
                    spec.heal_policy,
                    break_glass,
                    spec.heal_grace_period,
                    drift_age,
                );
                match verdict {
                    Verdict::Heal => {
                        let applied = self.k8s.apply(desired).await?;
                        self.store.put_last_applied(
                            repo,
                            key.clone(),
                            Manifest::try_new(normalize(applied.as_value()))
                                .map_err(crate::error::Error::InvalidResource)?,
                        );
                        self.store.clear_drift_first_seen(repo, &key);
                        info!(repo, resource = %key, drift = drift.as_str(), "healed drift");
                        events.drifted(&key, drift, DriftAction::Healed);
                        self.metrics.drift.inc(repo, drift.as_str(), "healed");
                        report.healed.push(key);
                    }
                    Verdict::Skip => {
                        events.drifted(&key, drift, DriftAction::Skipped);
                        self.metrics.drift.inc(repo, drift.as_str(), "skipped");
                        report.skipped.push(key);
                    }
                    Verdict::Report => {
                        events.drifted(&key, drift, DriftAction::Reported);
                        self.metrics.drift.inc(repo, drift.as_str(), "reported");
                        report.skipped.push(key);
                    }
                }
            }
        }
        Ok(())
    }
}
