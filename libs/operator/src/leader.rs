use crate::error::{Error, Result};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::client::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LeaderConfig {
    pub lease_name: String,
    pub lease_namespace: String,
    pub holder_identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderConfig {
    pub fn new(
        lease_name: impl Into<String>,
        lease_namespace: impl Into<String>,
        holder_identity: impl Into<String>,
    ) -> Self {
        LeaderConfig {
            lease_name: lease_name.into(),
            lease_namespace: lease_namespace.into(),
            holder_identity: holder_identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// Lease storage operations, separated so election logic is testable
/// without an API server.
#[async_trait]
pub trait LeaseOps: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Lease>>;
    /// Create fails with [`Error::LeaseConflict`] when the lease appeared
    /// concurrently.
    async fn create(&self, lease: &Lease) -> Result<Lease>;
    /// Optimistic-concurrency update; a stale resourceVersion fails with
    /// [`Error::LeaseConflict`].
    async fn update(&self, name: &str, lease: &Lease) -> Result<Lease>;
}

fn conflict_from(e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => Error::LeaseConflict,
        other => Error::Kube(other),
    }
}

pub struct KubeLeases {
    api: Api<Lease>,
}

impl KubeLeases {
    pub fn new(client: Client, namespace: &str) -> Self {
        KubeLeases {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl LeaseOps for KubeLeases {
    async fn get(&self, name: &str) -> Result<Option<Lease>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, lease: &Lease) -> Result<Lease> {
        self.api
            .create(&PostParams::default(), lease)
            .await
            .map_err(conflict_from)
    }

    async fn update(&self, name: &str, lease: &Lease) -> Result<Lease> {
        self.api
            .replace(name, &PostParams::default(), lease)
            .await
            .map_err(conflict_from)
    }
}

/// Acquires and maintains the leader lease, publishing leadership edges on
/// a channel the controller subscribes to. Duplicate edges are suppressed
/// here, at the emitter.
pub struct LeaderElection {
    ops: Arc<dyn LeaseOps>,
    config: LeaderConfig,
    tx: mpsc::Sender<bool>,
}

impl LeaderElection {
    pub fn new(ops: Arc<dyn LeaseOps>, config: LeaderConfig, tx: mpsc::Sender<bool>) -> Self {
        LeaderElection { ops, config, tx }
    }

    /// Runs until the subscriber goes away. While leader, renews every
    /// half lease duration; while not, retries every retry period.
    pub async fn run(self) {
        let mut last: Option<bool> = None;
        loop {
            let leader = self.try_acquire().await;
            if last != Some(leader) {
                info!(
                    identity = %self.config.holder_identity,
                    leader,
                    "leadership changed"
                );
                if self.tx.send(leader).await.is_err() {
                    return;
                }
                last = Some(leader);
            }
            let delay = if leader {
                self.config.lease_duration / 2
            } else {
                self.config.retry_period
            };
            tokio::time::sleep(delay).await;
        }
    }

    async fn try_acquire(&self) -> bool {
        let attempt = tokio::time::timeout(self.config.renew_deadline, self.acquire_or_renew());
        match attempt.await {
            Ok(Ok(())) => true,
            Ok(Err(Error::LeaseConflict)) => {
                debug!(lease = %self.config.lease_name, "lease held elsewhere");
                false
            }
            Ok(Err(e)) => {
                warn!(lease = %self.config.lease_name, error = %e, "lease operation failed");
                false
            }
            Err(_) => {
                warn!(lease = %self.config.lease_name, "renew deadline exceeded");
                false
            }
        }
    }

    async fn acquire_or_renew(&self) -> Result<()> {
        let now = MicroTime(Utc::now());
        match self.ops.get(&self.config.lease_name).await? {
            None => {
                let lease = self.fresh_lease(now);
                self.ops.create(&lease).await?;
                Ok(())
            }
            Some(mut lease) => {
                let spec = lease.spec.take().unwrap_or_default();
                let holder = spec.holder_identity.clone().unwrap_or_default();
                if holder == self.config.holder_identity {
                    lease.spec = Some(LeaseSpec {
                        renew_time: Some(now),
                        ..spec
                    });
                    self.ops.update(&self.config.lease_name, &lease).await?;
                    Ok(())
                } else if self.expired(&spec) {
                    info!(previous = %holder, "taking over expired lease");
                    lease.spec = Some(LeaseSpec {
                        holder_identity: Some(self.config.holder_identity.clone()),
                        lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
                        acquire_time: Some(now.clone()),
                        renew_time: Some(now),
                        lease_transitions: Some(spec.lease_transitions.unwrap_or(0) + 1),
                    });
                    self.ops.update(&self.config.lease_name, &lease).await?;
                    Ok(())
                } else {
                    Err(Error::LeaseConflict)
                }
            }
        }
    }

    fn expired(&self, spec: &LeaseSpec) -> bool {
        let duration = spec
            .lease_duration_seconds
            .map(|s| Duration::from_secs(s.max(0) as u64))
            .unwrap_or(self.config.lease_duration);
        match &spec.renew_time {
            Some(MicroTime(renewed)) => match chrono::Duration::from_std(duration) {
                Ok(d) => Utc::now() - *renewed > d,
                Err(_) => true,
            },
            None => true,
        }
    }

    fn fresh_lease(&self, now: MicroTime) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.config.lease_name.clone()),
                namespace: Some(self.config.lease_namespace.clone()),
                ..ObjectMeta::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.config.holder_identity.clone()),
                lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(0),
            }),
        }
    }
}
