use crate::drift::DriftType;
use crate::resource::{CommitSha, ResourceKey};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

/// Process-wide monotonic event id source, created once during boot.
#[derive(Debug, Default)]
pub struct EventIdGen(AtomicU64);

impl EventIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> String {
        format!("{:020}", self.0.fetch_add(1, Ordering::Relaxed))
    }
}

pub const TYPE_DEPLOYED: &str = "dev.cdevents.service.deployed.0.3.0";
pub const TYPE_UPGRADED: &str = "dev.cdevents.service.upgraded.0.3.0";
pub const TYPE_REMOVED: &str = "dev.cdevents.service.removed.0.3.0";
pub const TYPE_DRIFTED: &str = "dev.nopea.service.drifted.0.1.0";

/// What the drift pass did about one classified resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftAction {
    Healed,
    Skipped,
    /// `notify` policy: drift was surfaced but intentionally left alone.
    Reported,
}

impl DriftAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftAction::Healed => "healed",
            DriftAction::Skipped => "skipped",
            DriftAction::Reported => "reported",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Subject {
    pub id: String,
    pub content: Value,
}

/// CloudEvents 1.0 envelope for outbound service events.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CloudEvent {
    pub id: String,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub specversion: &'static str,
    pub timestamp: DateTime<Utc>,
    pub subject: Subject,
}

/// Delivery seam for outbound events. Production logs them; an HTTP
/// notifier would implement this same trait.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: CloudEvent);
}

/// Default sink: structured log line per event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn deliver(&self, event: CloudEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(event_type = %event.event_type, %payload, "service event"),
            Err(e) => info!(event_type = %event.event_type, error = %e, "unserializable event"),
        }
    }
}

/// Per-repository event factory. Clones share the id source and sink.
#[derive(Clone)]
pub struct EventEmitter {
    repo: String,
    ids: Arc<EventIdGen>,
    sink: Arc<dyn EventSink>,
}

impl EventEmitter {
    pub fn new(repo: impl Into<String>, ids: Arc<EventIdGen>, sink: Arc<dyn EventSink>) -> Self {
        EventEmitter {
            repo: repo.into(),
            ids,
            sink,
        }
    }

    fn emit(&self, event_type: &str, content: Value) {
        self.sink.deliver(CloudEvent {
            id: self.ids.next(),
            source: format!("/nopea/worker/{}", self.repo),
            event_type: event_type.to_string(),
            specversion: "1.0",
            timestamp: Utc::now(),
            subject: Subject {
                id: self.repo.clone(),
                content,
            },
        });
    }

    pub fn deployed(&self, commit: &CommitSha) {
        self.emit(TYPE_DEPLOYED, json!({ "commit": commit.as_str() }));
    }

    pub fn upgraded(&self, commit: &CommitSha, previous: &CommitSha) {
        self.emit(
            TYPE_UPGRADED,
            json!({ "commit": commit.as_str(), "previous_commit": previous.as_str() }),
        );
    }

    pub fn removed(&self, message: &str) {
        self.emit(TYPE_REMOVED, json!({ "message": message }));
    }

    pub fn drifted(&self, key: &ResourceKey, drift: DriftType, action: DriftAction) {
        self.emit(
            TYPE_DRIFTED,
            json!({
                "resource": key.to_string(),
                "drift_type": drift.as_str(),
                "action": action.as_str(),
            }),
        );
    }
}


#[cfg(test)]
mod test {
    use super::mock::MemorySink;
    use super::*;

    fn emitter(sink: Arc<MemorySink>) -> EventEmitter {
        EventEmitter::new("acme", Arc::new(EventIdGen::new()), sink)
    }

    #[test]
    fn ids_are_monotonic() {
        let sink = Arc::new(MemorySink::default());
        let e = emitter(sink.clone());
        let sha = CommitSha::new("a".repeat(40)).unwrap();
        e.deployed(&sha);
        e.deployed(&sha);
        let events = sink.events();
        assert!(events[0].id < events[1].id);
    }

    #[test]
    fn envelope_matches_cloudevents_shape() {
        let sink = Arc::new(MemorySink::default());
        let e = emitter(sink.clone());
        let current = CommitSha::new("b".repeat(40)).unwrap();
        let previous = CommitSha::new("a".repeat(40)).unwrap();
        e.upgraded(&current, &previous);

        let event = &sink.events()[0];
        assert_eq!(event.event_type, TYPE_UPGRADED);
        assert_eq!(event.source, "/nopea/worker/acme");
        assert_eq!(event.specversion, "1.0");
        assert_eq!(event.subject.id, "acme");
        assert_eq!(event.subject.content["previous_commit"], previous.as_str());

        let v = serde_json::to_value(event).unwrap();
        assert_eq!(v["type"], TYPE_UPGRADED);
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn drift_event_carries_key_type_and_action() {
        let sink = Arc::new(MemorySink::default());
        let e = emitter(sink.clone());
        let key = ResourceKey::new("ConfigMap", Some("prod"), "app");
        e.drifted(&key, DriftType::ManualDrift, DriftAction::Healed);

        let content = &sink.events()[0].subject.content;
        assert_eq!(content["resource"], "ConfigMap/prod/app");
        assert_eq!(content["drift_type"], "manual_drift");
        assert_eq!(content["action"], "healed");
    }
}
