use crate::error::Error;

use std::sync::Arc;

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::{
    counter::Counter, exemplar::HistogramWithExemplars, family::Family, gauge::Gauge,
};
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub sync: SyncMetrics,
    pub drift: DriftMetrics,
    pub controller: ControllerMetrics,
    pub webhook: WebhookMetrics,
}

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let sub = registry.sub_registry_with_prefix("nopea");
        Metrics {
            sync: SyncMetrics::default().register(sub),
            drift: DriftMetrics::default().register(sub),
            controller: ControllerMetrics::default().register(sub),
            webhook: WebhookMetrics::default().register(sub),
        }
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = ();

    fn try_from(id: &TraceId) -> Result<TraceLabel, ()> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(())
        } else {
            Ok(Self { id: id.to_string() })
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RepoLabel {
    pub repo: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncFailureLabels {
    pub repo: String,
    pub error: String,
}

#[derive(Clone)]
pub struct SyncMetrics {
    pub runs: Family<RepoLabel, Counter>,
    pub failures: Family<SyncFailureLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self {
            runs: Family::<RepoLabel, Counter>::default(),
            failures: Family::<SyncFailureLabels, Counter>::default(),
            duration: HistogramWithExemplars::new([0.1, 0.5, 1., 5., 30., 120.].into_iter()),
        }
    }
}

impl SyncMetrics {
    fn register(self, r: &mut Registry) -> Self {
        let sub = r.sub_registry_with_prefix("sync");
        sub.register_with_unit(
            "duration",
            "sync duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        sub.register("failures", "failed sync cycles", self.failures.clone());
        sub.register("runs", "sync cycles", self.runs.clone());
        self
    }

    pub fn failure_inc(&self, repo: &str, error: &Error) {
        self.failures
            .get_or_create(&SyncFailureLabels {
                repo: repo.to_string(),
                error: error.metric_label().to_string(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, repo: &str, trace_id: &TraceId) -> SyncMeasurer {
        self.runs
            .get_or_create(&RepoLabel {
                repo: repo.to_string(),
            })
            .inc();
        SyncMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }
}

/// Observes the sync duration on drop, exemplared with the trace id.
pub struct SyncMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for SyncMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DriftLabels {
    pub repo: String,
    pub drift_type: String,
    pub action: String,
}

#[derive(Clone, Default)]
pub struct DriftMetrics {
    pub resources: Family<DriftLabels, Counter>,
}

impl DriftMetrics {
    fn register(self, r: &mut Registry) -> Self {
        r.sub_registry_with_prefix("drift").register(
            "resources",
            "classified drift results by type and action",
            self.resources.clone(),
        );
        self
    }

    pub fn inc(&self, repo: &str, drift_type: &str, action: &str) {
        self.resources
            .get_or_create(&DriftLabels {
                repo: repo.to_string(),
                drift_type: drift_type.to_string(),
                action: action.to_string(),
            })
            .inc();
    }
}

#[derive(Clone, Default)]
pub struct ControllerMetrics {
    pub workers: Gauge,
    pub leader: Gauge,
    pub ready: Gauge,
    pub watch_reconnects: Counter,
    pub worker_restarts: Counter,
}

impl ControllerMetrics {
    fn register(self, r: &mut Registry) -> Self {
        let sub = r.sub_registry_with_prefix("controller");
        sub.register("workers", "live repository workers", self.workers.clone());
        sub.register(
            "leader",
            "1 while this instance holds the lease",
            self.leader.clone(),
        );
        sub.register(
            "ready",
            "1 while the watch stream is established",
            self.ready.clone(),
        );
        sub.register(
            "watch_reconnects",
            "watch stream reconnections",
            self.watch_reconnects.clone(),
        );
        sub.register(
            "worker_restarts",
            "workers restarted after a panic",
            self.worker_restarts.clone(),
        );
        self
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum WebhookOutcomeLabel {
    Accepted,
    Ignored,
    Rejected,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabels {
    pub provider: String,
    pub outcome: WebhookOutcomeLabel,
}

#[derive(Clone, Default)]
pub struct WebhookMetrics {
    pub requests: Family<WebhookLabels, Counter>,
}

impl WebhookMetrics {
    fn register(self, r: &mut Registry) -> Self {
        r.sub_registry_with_prefix("webhook").register(
            "requests",
            "webhook deliveries by provider and outcome",
            self.requests.clone(),
        );
        self
    }

    pub fn inc(&self, provider: &str, outcome: WebhookOutcomeLabel) {
        self.requests
            .get_or_create(&WebhookLabels {
                provider: provider.to_string(),
                outcome,
            })
            .inc();
    }
}

pub type SharedMetrics = Arc<Metrics>;
