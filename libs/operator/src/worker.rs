use crate::crd::Phase;
use crate::drift::{normalize, DriftEngine};
use crate::error::{Error, Result};
use crate::events::{EventEmitter, EventIdGen, EventSink};
use crate::git::GitOps;
use crate::k8s::K8sOps;
use crate::metrics::SharedMetrics;
use crate::repo::RepositorySpec;
use crate::resource::{CommitSha, Manifest};
use crate::store::{StateStore, SyncState};
use crate::sync::{SyncExecutor, SyncOutcome};
use crate::telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, field, info, instrument, warn, Span};

const MAILBOX_CAPACITY: usize = 32;
const CLONE_DEPTH: u32 = 1;

/// Mailbox messages. Each worker processes these strictly serially in its
/// own task; phase transitions happen nowhere else.
#[derive(Debug)]
pub enum WorkerMsg {
    StartupSync,
    Poll,
    Reconcile,
    Webhook { commit: Option<CommitSha> },
    SyncNow { reply: oneshot::Sender<std::result::Result<SyncSummary, String>> },
    GetState { reply: oneshot::Sender<WorkerSnapshot> },
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSummary {
    pub commit: CommitSha,
    pub applied: usize,
}

#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub phase: Phase,
    pub last_commit: Option<CommitSha>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Dependencies shared by every worker in the process.
pub struct WorkerDeps {
    pub git: Arc<dyn GitOps>,
    pub k8s: Arc<dyn K8sOps>,
    pub store: Arc<StateStore>,
    pub metrics: SharedMetrics,
    pub sink: Arc<dyn EventSink>,
    pub ids: Arc<EventIdGen>,
    /// Base directory repository checkouts live under.
    pub base_dir: PathBuf,
}

/// Owning handle; dropping it does not stop the worker, calling
/// [`WorkerHandle::stop`] does.
pub struct WorkerHandle {
    name: String,
    tx: mpsc::Sender<WorkerMsg>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender(&self) -> WorkerRef {
        WorkerRef {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stops the worker: a queued `Stop` covers the idle case, the abort
    /// cancels an in-flight collaborator call at its next await point.
    /// Pending timers are cancelled by the worker's drop guard.
    pub async fn stop(self) {
        let _ = self.tx.try_send(WorkerMsg::Stop);
        self.join.abort();
        let _ = self.join.await;
    }

    /// Decomposes the handle for the supervisor, which owns the join
    /// handle through its panic monitor.
    pub(crate) fn into_parts(self) -> (String, mpsc::Sender<WorkerMsg>, JoinHandle<()>) {
        (self.name, self.tx, self.join)
    }
}

/// Cloneable mailbox address of a worker.
#[derive(Clone)]
pub struct WorkerRef {
    name: String,
    tx: mpsc::Sender<WorkerMsg>,
}

impl WorkerRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn webhook(&self, commit: Option<CommitSha>) -> bool {
        self.tx.send(WorkerMsg::Webhook { commit }).await.is_ok()
    }

    pub async fn sync_now(&self) -> Option<std::result::Result<SyncSummary, String>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(WorkerMsg::SyncNow { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn state(&self) -> Option<WorkerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(WorkerMsg::GetState { reply }).await.ok()?;
        rx.await.ok()
    }
}

/// Starts the worker task for one repository. The passed spec is only a
/// seed: the worker re-reads the custom resource before doing anything,
/// and terminates normally when it is already gone.
pub fn spawn_worker(seed: RepositorySpec, deps: Arc<WorkerDeps>) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let name = seed.name.clone();
    let worker_tx = tx.clone();
    let join = tokio::spawn(async move {
        Worker::new(seed, deps, worker_tx).run(rx).await;
    });
    WorkerHandle { name, tx, join }
}

struct Worker {
    spec: RepositorySpec,
    deps: Arc<WorkerDeps>,
    executor: SyncExecutor,
    engine: DriftEngine,
    events: EventEmitter,
    work_dir: PathBuf,
    tx: mpsc::Sender<WorkerMsg>,

    phase: Phase,
    last_commit: Option<CommitSha>,
    last_sync_at: Option<DateTime<Utc>>,
    poll_timer: Option<JoinHandle<()>>,
    reconcile_timer: Option<JoinHandle<()>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        // runs on every exit path, including task abort
        if let Some(timer) = self.poll_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.reconcile_timer.take() {
            timer.abort();
        }
    }
}

impl Worker {
    fn new(seed: RepositorySpec, deps: Arc<WorkerDeps>, tx: mpsc::Sender<WorkerMsg>) -> Self {
        let executor = SyncExecutor::new(deps.git.clone(), deps.k8s.clone());
        let engine = DriftEngine::new(deps.store.clone(), deps.k8s.clone(), deps.metrics.clone());
        let events = EventEmitter::new(seed.name.clone(), deps.ids.clone(), deps.sink.clone());
        let work_dir = seed.work_dir(&deps.base_dir);
        Worker {
            spec: seed,
            executor,
            engine,
            events,
            work_dir,
            tx,
            deps,
            phase: Phase::Initializing,
            last_commit: None,
            last_sync_at: None,
            poll_timer: None,
            reconcile_timer: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WorkerMsg>) {
        // the custom resource is the source of truth, not the caller
        match self
            .deps
            .k8s
            .get_repo(&self.spec.source_namespace, &self.spec.name)
            .await
        {
            Ok(Some(repo)) => match RepositorySpec::from_resource(&repo) {
                Ok(spec) => {
                    self.work_dir = spec.work_dir(&self.deps.base_dir);
                    self.spec = spec;
                }
                Err(e) => {
                    error!(repo = %self.spec.name, error = %e, "refusing to start worker");
                    return;
                }
            },
            Ok(None) => {
                info!(repo = %self.spec.name, "resource already deleted, worker exits");
                return;
            }
            Err(e) => {
                error!(repo = %self.spec.name, error = %e, "cannot read resource, worker exits");
                return;
            }
        }

        info!(repo = %self.spec.name, url = %self.spec.url, branch = %self.spec.branch, "worker started");
        self.handle(WorkerMsg::StartupSync).await;

        while let Some(msg) = rx.recv().await {
            if matches!(msg, WorkerMsg::Stop) {
                info!(repo = %self.spec.name, "worker stopping");
                break;
            }
            self.handle(msg).await;
        }
    }

    async fn handle(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::StartupSync => {
                let synced = if self.spec.suspend {
                    debug!(repo = %self.spec.name, "repository suspended, skipping startup sync");
                    false
                } else {
                    self.full_sync().await.is_ok()
                };
                self.schedule_poll();
                if synced {
                    self.schedule_reconcile();
                }
            }
            WorkerMsg::Poll => {
                if !self.spec.suspend {
                    self.poll().await;
                }
                self.schedule_poll();
            }
            WorkerMsg::Reconcile => {
                if !self.spec.suspend {
                    self.reconcile().await;
                }
                self.schedule_reconcile();
            }
            WorkerMsg::Webhook { commit } => {
                info!(
                    repo = %self.spec.name,
                    commit = commit.as_ref().map(|c| c.short().to_string()).unwrap_or_default(),
                    "webhook received, syncing"
                );
                let _ = self.full_sync().await;
            }
            WorkerMsg::SyncNow { reply } => {
                let result = self
                    .full_sync()
                    .await
                    .map(|outcome| SyncSummary {
                        commit: outcome.commit,
                        applied: outcome.applied.len(),
                    })
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            WorkerMsg::GetState { reply } => {
                let _ = reply.send(WorkerSnapshot {
                    phase: self.phase,
                    last_commit: self.last_commit.clone(),
                    last_sync_at: self.last_sync_at,
                });
            }
            WorkerMsg::Stop => {}
        }
    }

    /// Cheap change check: one git sync, full pipeline only when the head
    /// moved.
    async fn poll(&mut self) {
        match self
            .deps
            .git
            .sync(&self.spec.url, &self.spec.branch, &self.work_dir, CLONE_DEPTH)
            .await
        {
            Ok(head) => {
                if self.last_commit.as_ref() != Some(&head) {
                    debug!(repo = %self.spec.name, head = head.short(), "new commit, running full sync");
                    let _ = self.full_sync().await;
                } else {
                    debug!(repo = %self.spec.name, "no changes");
                }
            }
            Err(e) => {
                self.record_failure(&Error::GitSyncFailed(e.to_string())).await;
            }
        }
    }

    #[instrument(skip(self), fields(repo = %self.spec.name, trace_id))]
    async fn full_sync(&mut self) -> Result<SyncOutcome> {
        let trace_id = telemetry::get_trace_id();
        Span::current().record("trace_id", field::display(&trace_id));
        let _timer = self
            .deps
            .metrics
            .sync
            .count_and_measure(&self.spec.name, &trace_id);

        self.phase = Phase::Syncing;
        match self.executor.execute(&self.spec, &self.work_dir).await {
            Ok(outcome) => {
                self.complete_sync(&outcome).await;
                Ok(outcome)
            }
            Err(e) => {
                self.record_failure(&e).await;
                Err(e)
            }
        }
    }

    async fn complete_sync(&mut self, outcome: &SyncOutcome) {
        let repo = self.spec.name.clone();
        let previous = self.deps.store.get_commit(&repo);

        for manifest in &outcome.applied {
            match Manifest::try_new(normalize(manifest.as_value())) {
                Ok(normalized) => {
                    self.deps
                        .store
                        .put_last_applied(&repo, manifest.key(), normalized)
                }
                Err(reason) => {
                    warn!(%repo, resource = %manifest.key(), reason, "echoed object lost its identity")
                }
            }
        }
        self.deps.store.put_commit(&repo, outcome.commit.clone());

        self.phase = Phase::Synced;
        self.last_commit = Some(outcome.commit.clone());
        self.last_sync_at = Some(Utc::now());
        self.deps.store.put_sync_state(
            &repo,
            SyncState {
                commit: self.last_commit.clone(),
                last_sync_at: self.last_sync_at,
                phase: self.phase,
            },
        );
        self.update_status(None).await;

        match previous {
            None => self.events.deployed(&outcome.commit),
            Some(ref prev) if *prev != outcome.commit => {
                self.events.upgraded(&outcome.commit, prev)
            }
            Some(_) => {}
        }
        info!(
            repo = %self.spec.name,
            commit = outcome.commit.short(),
            applied = outcome.applied.len(),
            duration_ms = outcome.duration.as_millis() as u64,
            "sync complete"
        );
    }

    /// Failed syncs flip the phase and report, but never clear
    /// previously-recorded state.
    async fn record_failure(&mut self, error: &Error) {
        warn!(repo = %self.spec.name, error = %error, "sync failed");
        self.phase = Phase::Failed;
        self.deps.metrics.sync.failure_inc(&self.spec.name, error);
        self.deps.store.put_sync_state(
            &self.spec.name,
            SyncState {
                commit: self.last_commit.clone(),
                last_sync_at: self.last_sync_at,
                phase: Phase::Failed,
            },
        );
        self.update_status(Some(error.to_string())).await;
        self.events.removed(&error.to_string());
    }

    async fn update_status(&self, message: Option<String>) {
        let status = crate::crd::GitRepositoryStatus {
            phase: Some(self.phase),
            last_synced_commit: self.last_commit.as_ref().map(ToString::to_string),
            last_sync_time: self.last_sync_at,
            message,
            observed_generation: if self.phase == Phase::Synced {
                Some(self.spec.generation)
            } else {
                self.spec.observed_generation
            },
        };
        if let Err(e) = self
            .deps
            .k8s
            .update_status(&self.spec.source_namespace, &self.spec.name, &status)
            .await
        {
            warn!(repo = %self.spec.name, error = %e, "status update failed");
        }
    }

    /// Drift pass over the manifests already on disk; never re-fetches Git.
    async fn reconcile(&mut self) {
        if self.last_commit.is_none() {
            debug!(repo = %self.spec.name, "never synced, skipping reconcile");
            return;
        }
        let desired = match self
            .executor
            .desired_manifests(&self.spec, &self.work_dir)
            .await
        {
            Ok(desired) => desired,
            Err(e) => {
                warn!(repo = %self.spec.name, error = %e, "cannot read desired state");
                return;
            }
        };
        match self
            .engine
            .reconcile_pass(&self.spec, &desired, &self.events)
            .await
        {
            Ok(report) => {
                if !report.healed.is_empty() || !report.skipped.is_empty() {
                    info!(
                        repo = %self.spec.name,
                        checked = report.checked,
                        healed = report.healed.len(),
                        skipped = report.skipped.len(),
                        "reconcile pass complete"
                    );
                }
                for error in &report.errors {
                    warn!(repo = %self.spec.name, %error, "reconcile error");
                }
            }
            Err(e) => warn!(repo = %self.spec.name, error = %e, "reconcile pass failed"),
        }
    }

    fn schedule_poll(&mut self) {
        if let Some(timer) = self.poll_timer.take() {
            timer.abort();
        }
        let tx = self.tx.clone();
        let delay = self.spec.poll_interval;
        self.poll_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(WorkerMsg::Poll).await;
        }));
    }

    fn schedule_reconcile(&mut self) {
        if let Some(timer) = self.reconcile_timer.take() {
            timer.abort();
        }
        let tx = self.tx.clone();
        let delay = self.spec.reconcile_interval();
        self.reconcile_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(WorkerMsg::Reconcile).await;
        }));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::{GitRepository, GitRepositorySpec, Phase};
    use crate::events::mock::MemorySink;
    use crate::events::{TYPE_DEPLOYED, TYPE_REMOVED, TYPE_UPGRADED};
    use crate::git::mock::FakeGit;
    use crate::k8s::mock::FakeK8s;
    use crate::resource::ResourceKey;

    use std::time::Duration;

    const APP_V1: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: app
data:
  k: v1
";
    const APP_V2: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: app
data:
  k: v2
";

    fn abc() -> CommitSha {
        CommitSha::new(format!("abc{}", "1".repeat(37))).unwrap()
    }

    fn def() -> CommitSha {
        CommitSha::new(format!("def{}", "2".repeat(37))).unwrap()
    }

    fn repo_resource(name: &str) -> GitRepository {
        let mut r = GitRepository::new(
            name,
            GitRepositorySpec {
                url: "https://example/acme.git".into(),
                branch: Some("main".into()),
                path: Some("deploy".into()),
                target_namespace: Some("prod".into()),
                interval: Some("5m".into()),
                suspend: None,
                heal_policy: None,
                heal_grace_period: None,
            },
        );
        r.metadata.namespace = Some("default".into());
        r.metadata.generation = Some(1);
        r
    }

    struct Rig {
        git: Arc<FakeGit>,
        k8s: Arc<FakeK8s>,
        sink: Arc<MemorySink>,
        deps: Arc<WorkerDeps>,
    }

    fn rig(k8s: FakeK8s) -> Rig {
        let git = Arc::new(FakeGit::new(abc()));
        let k8s = Arc::new(k8s);
        let sink = Arc::new(MemorySink::default());
        let mut registry = prometheus_client::registry::Registry::default();
        let deps = Arc::new(WorkerDeps {
            git: git.clone(),
            k8s: k8s.clone(),
            store: Arc::new(StateStore::new()),
            metrics: Arc::new(crate::metrics::Metrics::register(&mut registry)),
            sink: sink.clone(),
            ids: Arc::new(EventIdGen::new()),
            base_dir: PathBuf::from("/tmp/nopea-test"),
        });
        Rig {
            git,
            k8s,
            sink,
            deps,
        }
    }

    fn seed(rig: &Rig) -> RepositorySpec {
        let repo = rig.k8s.repos.lock().unwrap().get("acme").cloned().unwrap();
        RepositorySpec::from_resource(&repo).unwrap()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 3s");
    }

    #[tokio::test]
    async fn first_sync_deploys_and_records_state() {
        let rig = rig(FakeK8s::with_repo(repo_resource("acme")));
        rig.git.put_file("deploy/app.yaml", APP_V1);

        let handle = spawn_worker(seed(&rig), rig.deps.clone());
        let rig_k8s = rig.k8s.clone();
        wait_until(move || {
            rig_k8s
                .last_status()
                .and_then(|s| s.phase)
                .map(|p| p == Phase::Synced)
                .unwrap_or(false)
        })
        .await;

        let status = rig.k8s.last_status().unwrap();
        assert_eq!(status.last_synced_commit.as_deref(), Some(abc().as_str()));
        assert_eq!(status.observed_generation, Some(1));
        assert!(status.last_sync_time.is_some());

        assert_eq!(rig.k8s.apply_count(), 1);
        let key = ResourceKey::new("ConfigMap", Some("prod"), "app");
        assert!(rig.deps.store.get_last_applied("acme", &key).is_some());
        assert_eq!(rig.deps.store.get_commit("acme"), Some(abc()));

        assert_eq!(rig.sink.of_type(TYPE_DEPLOYED).len(), 1);
        assert!(rig.sink.of_type(TYPE_UPGRADED).is_empty());

        let snapshot = handle.sender().state().await.unwrap();
        assert_eq!(snapshot.phase, Phase::Synced);
        assert_eq!(snapshot.last_commit, Some(abc()));
        handle.stop().await;
    }

    #[tokio::test]
    async fn unchanged_head_poll_skips_full_sync() {
        let rig = rig(FakeK8s::with_repo(repo_resource("acme")));
        rig.git.put_file("deploy/app.yaml", APP_V1);

        let handle = spawn_worker(seed(&rig), rig.deps.clone());
        let sender = handle.sender();
        let rig_k8s = rig.k8s.clone();
        wait_until(move || rig_k8s.apply_count() == 1).await;
        let syncs_after_startup = rig.git.sync_count();

        // a poll that sees the same head runs exactly one cheap git sync
        // and no apply
        let _ = handle.tx.send(WorkerMsg::Poll).await;
        let snapshot = sender.state().await.unwrap();
        assert_eq!(rig.git.sync_count(), syncs_after_startup + 1);
        assert_eq!(rig.k8s.apply_count(), 1);
        assert_eq!(snapshot.phase, Phase::Synced);
        handle.stop().await;
    }

    #[tokio::test]
    async fn new_head_triggers_full_sync_and_upgrade_event() {
        let rig = rig(FakeK8s::with_repo(repo_resource("acme")));
        rig.git.put_file("deploy/app.yaml", APP_V1);

        let handle = spawn_worker(seed(&rig), rig.deps.clone());
        let sender = handle.sender();
        let rig_k8s = rig.k8s.clone();
        wait_until(move || rig_k8s.apply_count() == 1).await;

        rig.git.put_file("deploy/app.yaml", APP_V2);
        rig.git.set_head(def());
        let _ = handle.tx.send(WorkerMsg::Poll).await;
        let rig_k8s = rig.k8s.clone();
        wait_until(move || rig_k8s.apply_count() == 2).await;

        let key = ResourceKey::new("ConfigMap", Some("prod"), "app");
        let live = rig.k8s.cluster.get(&key).unwrap().clone();
        assert_eq!(live.as_value()["data"]["k"], "v2");
        assert_eq!(rig.deps.store.get_commit("acme"), Some(def()));

        let upgraded = rig.sink.of_type(TYPE_UPGRADED);
        assert_eq!(upgraded.len(), 1);
        assert_eq!(upgraded[0].subject.content["previous_commit"], abc().as_str());
        handle.stop().await;
    }

    #[tokio::test]
    async fn webhook_runs_immediate_sync() {
        let rig = rig(FakeK8s::with_repo(repo_resource("acme")));
        rig.git.put_file("deploy/app.yaml", APP_V1);

        let handle = spawn_worker(seed(&rig), rig.deps.clone());
        let sender = handle.sender();
        let rig_k8s = rig.k8s.clone();
        wait_until(move || rig_k8s.apply_count() == 1).await;

        rig.git.put_file("deploy/app.yaml", APP_V2);
        rig.git.set_head(def());
        assert!(sender.webhook(Some(def())).await);
        let rig_k8s = rig.k8s.clone();
        wait_until(move || rig_k8s.apply_count() == 2).await;

        assert_eq!(rig.deps.store.get_commit("acme"), Some(def()));
        handle.stop().await;
    }

    #[tokio::test]
    async fn sync_now_replies_with_summary() {
        let rig = rig(FakeK8s::with_repo(repo_resource("acme")));
        rig.git.put_file("deploy/app.yaml", APP_V1);

        let handle = spawn_worker(seed(&rig), rig.deps.clone());
        let summary = handle.sender().sync_now().await.unwrap().unwrap();
        assert_eq!(summary.commit, abc());
        assert_eq!(summary.applied, 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn failed_sync_reports_and_keeps_state() {
        let rig = rig(FakeK8s::with_repo(repo_resource("acme")));
        rig.git.put_file("deploy/app.yaml", APP_V1);

        let handle = spawn_worker(seed(&rig), rig.deps.clone());
        let sender = handle.sender();
        let rig_k8s = rig.k8s.clone();
        wait_until(move || rig_k8s.apply_count() == 1).await;

        *rig.git.fail_sync.lock().unwrap() = Some("remote unreachable".into());
        let err = sender.sync_now().await.unwrap().unwrap_err();
        assert!(err.contains("git sync failed"));

        let status = rig.k8s.last_status().unwrap();
        assert_eq!(status.phase, Some(Phase::Failed));
        assert!(status.message.unwrap().contains("remote unreachable"));
        // failure keeps the previously synced commit
        assert_eq!(status.last_synced_commit.as_deref(), Some(abc().as_str()));
        assert_eq!(rig.deps.store.get_commit("acme"), Some(abc()));
        assert_eq!(
            rig.deps.store.get_sync_state("acme").unwrap().phase,
            Phase::Failed
        );
        assert_eq!(rig.sink.of_type(TYPE_REMOVED).len(), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn worker_exits_when_resource_is_gone() {
        let rig = rig(FakeK8s::default());
        let mut repo = repo_resource("acme");
        repo.metadata.name = Some("acme".into());
        let spec = RepositorySpec::from_resource(&repo).unwrap();

        let handle = spawn_worker(spec, rig.deps.clone());
        let done = &handle;
        wait_until(move || done.is_finished()).await;
        assert!(rig.k8s.statuses.lock().unwrap().is_empty());
        assert_eq!(rig.k8s.apply_count(), 0);
    }

    #[tokio::test]
    async fn suspended_repository_does_not_sync() {
        let mut repo = repo_resource("acme");
        repo.spec.suspend = Some(true);
        let rig = rig(FakeK8s::with_repo(repo));
        rig.git.put_file("deploy/app.yaml", APP_V1);

        let handle = spawn_worker(seed(&rig), rig.deps.clone());
        // drain the startup message before asserting
        handle.sender().state().await.unwrap();
        assert_eq!(rig.k8s.apply_count(), 0);
        assert_eq!(rig.git.sync_count(), 0);
        handle.stop().await;
    }

    #[tokio::test]
    async fn reconcile_heals_manual_drift() {
        let rig = rig(FakeK8s::with_repo(repo_resource("acme")));
        rig.git.put_file("deploy/app.yaml", APP_V2);

        let handle = spawn_worker(seed(&rig), rig.deps.clone());
        let sender = handle.sender();
        let rig_k8s = rig.k8s.clone();
        wait_until(move || rig_k8s.apply_count() == 1).await;

        let key = ResourceKey::new("ConfigMap", Some("prod"), "app");
        rig.k8s.tamper(&key, |v| {
            v["data"]["k"] = serde_json::json!("v9");
        });

        let _ = handle.tx.send(WorkerMsg::Reconcile).await;
        let rig_k8s = rig.k8s.clone();
        wait_until(move || rig_k8s.apply_count() == 2).await;

        let live = rig.k8s.cluster.get(&key).unwrap().clone();
        assert_eq!(live.as_value()["data"]["k"], "v2");
        // drift pass must not re-fetch from the remote
        assert_eq!(rig.git.sync_count(), 1);
        assert_eq!(sender.state().await.unwrap().phase, Phase::Synced);
        handle.stop().await;
    }
}
