use crate::crd::GitRepository;
use crate::k8s::{K8sOps, RepoEvent};
use crate::metrics::{Metrics, SharedMetrics};
use crate::repo::RepositorySpec;
use crate::store::StateStore;
use crate::supervisor::Supervisor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::ResourceExt;
use prometheus_client::registry::Registry;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Readiness flags shared with the HTTP server. Ready means the watch
/// stream is established and, when leader election is enabled, this
/// instance holds the lease.
#[derive(Debug)]
pub struct ReadyState {
    require_leader: bool,
    pub leader: AtomicBool,
    pub watching: AtomicBool,
}

impl ReadyState {
    pub fn new(require_leader: bool) -> Self {
        ReadyState {
            require_leader,
            leader: AtomicBool::new(false),
            watching: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.watching.load(Ordering::Relaxed)
            && (!self.require_leader || self.leader.load(Ordering::Relaxed))
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    registry: Arc<Registry>,
    pub metrics: SharedMetrics,
    pub ready: Arc<ReadyState>,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}

impl State {
    pub fn new(mut registry: Registry, require_leader: bool) -> Self {
        let metrics = Arc::new(Metrics::register(&mut registry));
        State {
            registry: Arc::new(registry),
            metrics,
            ready: Arc::new(ReadyState::new(require_leader)),
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
        }
    }

    /// Metrics getter
    pub fn metrics_text(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

enum ActiveExit {
    LostLeadership,
    ChannelClosed,
}

/// Watches the `GitRepository` custom resource and keeps a 1:1
/// correspondence between live resources and running workers. In standby
/// mode it idles until the leader election task reports leadership.
pub struct Controller {
    k8s: Arc<dyn K8sOps>,
    supervisor: Supervisor,
    store: Arc<StateStore>,
    metrics: SharedMetrics,
    ready: Arc<ReadyState>,
    diagnostics: Arc<RwLock<Diagnostics>>,
    reconnect_delay: Duration,
}

impl Controller {
    pub fn new(
        k8s: Arc<dyn K8sOps>,
        supervisor: Supervisor,
        store: Arc<StateStore>,
        state: &State,
    ) -> Self {
        Controller {
            k8s,
            supervisor,
            store,
            metrics: state.metrics.clone(),
            ready: state.ready.clone(),
            diagnostics: state.diagnostics.clone(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }

    #[cfg(test)]
    fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Runs until the leadership channel closes. `standby` keeps workers
    /// down until `{leader, true}` arrives.
    pub async fn run(
        self,
        namespace: String,
        standby: bool,
        mut leadership: mpsc::Receiver<bool>,
    ) {
        let mut active = !standby;
        loop {
            if !active {
                info!("standing by, waiting for leadership");
                match leadership.recv().await {
                    Some(true) => active = true,
                    Some(false) => continue,
                    None => return,
                }
            }
            self.ready.leader.store(true, Ordering::Relaxed);
            self.metrics.controller.leader.set(1);
            info!(%namespace, "entering active mode");

            let exit = self.run_active(&namespace, &mut leadership).await;
            self.ready.leader.store(false, Ordering::Relaxed);
            self.metrics.controller.leader.set(0);
            match exit {
                ActiveExit::LostLeadership => {
                    info!("leadership lost, all workers stopped, standing by");
                    active = false;
                }
                ActiveExit::ChannelClosed => return,
            }
        }
    }

    async fn run_active(
        &self,
        namespace: &str,
        leadership: &mut mpsc::Receiver<bool>,
    ) -> ActiveExit {
        let mut tracked: HashMap<String, String> = HashMap::new();
        loop {
            // list, then watch from the returned version
            let (repos, list_version) = match self.k8s.list_repos(namespace).await {
                Ok(listed) => listed,
                Err(e) => {
                    warn!(error = %e, "listing repositories failed, retrying");
                    if !self.pause(leadership).await {
                        self.deactivate(&mut tracked);
                        return ActiveExit::LostLeadership;
                    }
                    continue;
                }
            };
            for repo in &repos {
                self.start_repo(repo, &mut tracked);
            }

            let mut version = list_version;
            loop {
                let mut stream = match self.k8s.watch_repos(namespace, &version).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "watch failed, relisting");
                        self.ready.watching.store(false, Ordering::Relaxed);
                        self.metrics.controller.ready.set(0);
                        self.metrics.controller.watch_reconnects.inc();
                        if !self.pause(leadership).await {
                            self.deactivate(&mut tracked);
                            return ActiveExit::LostLeadership;
                        }
                        // stale resourceVersions are recovered by a fresh list
                        break;
                    }
                };
                self.ready.watching.store(true, Ordering::Relaxed);
                self.metrics.controller.ready.set(1);

                loop {
                    tokio::select! {
                        leader = leadership.recv() => match leader {
                            Some(true) => debug!("already active"),
                            Some(false) => {
                                self.deactivate(&mut tracked);
                                return ActiveExit::LostLeadership;
                            }
                            None => {
                                self.deactivate(&mut tracked);
                                return ActiveExit::ChannelClosed;
                            }
                        },
                        event = stream.next() => match event {
                            Some(Ok(event)) => {
                                if let Some(v) = self.handle_event(event, &mut tracked).await {
                                    version = v;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "watch stream error, reconnecting");
                                break;
                            }
                            None => {
                                debug!("watch stream ended, reconnecting");
                                break;
                            }
                        }
                    }
                }

                self.ready.watching.store(false, Ordering::Relaxed);
                self.metrics.controller.ready.set(0);
                self.metrics.controller.watch_reconnects.inc();
                if !self.pause(leadership).await {
                    self.deactivate(&mut tracked);
                    return ActiveExit::LostLeadership;
                }
            }
        }
    }

    /// Sleeps the reconnect delay; `false` means leadership was lost (or
    /// the channel closed) while waiting.
    async fn pause(&self, leadership: &mut mpsc::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.reconnect_delay) => true,
            leader = leadership.recv() => matches!(leader, Some(true)),
        }
    }

    fn deactivate(&self, tracked: &mut HashMap<String, String>) {
        self.supervisor.stop_all();
        tracked.clear();
        self.ready.watching.store(false, Ordering::Relaxed);
        self.metrics.controller.ready.set(0);
    }

    fn start_repo(&self, repo: &GitRepository, tracked: &mut HashMap<String, String>) {
        let name = repo.name_any();
        match RepositorySpec::from_resource(repo) {
            Ok(spec) => {
                self.supervisor.start_worker(spec);
                tracked.insert(name, repo.resource_version().unwrap_or_default());
            }
            Err(e) => {
                warn!(repo = %name, error = %e, "invalid repository, no worker created");
            }
        }
    }

    async fn handle_event(
        &self,
        event: RepoEvent,
        tracked: &mut HashMap<String, String>,
    ) -> Option<String> {
        self.diagnostics.write().await.last_event = Utc::now();
        match event {
            RepoEvent::Added(repo) => {
                let name = repo.name_any();
                let version = repo.resource_version();
                if tracked.contains_key(&name) {
                    debug!(repo = %name, "duplicate ADDED ignored");
                    if let Some(v) = &version {
                        tracked.insert(name, v.clone());
                    }
                } else {
                    info!(repo = %name, "repository added");
                    self.start_repo(&repo, tracked);
                }
                version
            }
            RepoEvent::Modified(repo) => {
                let name = repo.name_any();
                let version = repo.resource_version();
                if tracked.contains_key(&name) && !repo.spec_changed() {
                    // status-only update, do not churn the worker
                    debug!(repo = %name, "status update, worker unchanged");
                    if let Some(v) = &version {
                        tracked.insert(name, v.clone());
                    }
                } else {
                    info!(repo = %name, "spec changed, restarting worker");
                    self.supervisor.stop_worker(&name);
                    self.start_repo(&repo, tracked);
                }
                version
            }
            RepoEvent::Deleted(repo) => {
                let name = repo.name_any();
                info!(repo = %name, "repository deleted");
                self.supervisor.stop_worker(&name);
                tracked.remove(&name);
                self.store.remove_repo(&name);
                repo.resource_version()
            }
            RepoEvent::Bookmark(version) => {
                debug!(version = %version, "bookmark");
                Some(version)
            }
        }
    }
}
