use crate::metrics::SharedMetrics;
use crate::repo::RepositorySpec;
use crate::worker::{spawn_worker, WorkerDeps, WorkerMsg, WorkerRef};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info};

struct Registered {
    spec: RepositorySpec,
    sender: WorkerRef,
    tx: mpsc::Sender<WorkerMsg>,
    abort: AbortHandle,
    /// Distinguishes this registration from any later worker under the
    /// same name; the monitor only cleans up its own epoch.
    epoch: u64,
}

struct Inner {
    deps: Arc<WorkerDeps>,
    metrics: SharedMetrics,
    workers: DashMap<String, Registered>,
    epochs: AtomicU64,
}

/// Worker lifecycle and the unique-name registry: at any time there is at
/// most one live worker per repository name. A panicking worker is
/// restarted one-for-one; a worker that exits on its own (resource already
/// deleted) is unregistered.
///
/// In cluster mode the same four operations would be backed by a
/// cluster-wide registry; this registry is the single-process one.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(deps: Arc<WorkerDeps>) -> Self {
        let metrics = deps.metrics.clone();
        Supervisor {
            inner: Arc::new(Inner {
                deps,
                metrics,
                workers: DashMap::new(),
                epochs: AtomicU64::new(0),
            }),
        }
    }

    /// Starts a worker unless one is already registered under the name.
    /// Returns whether a new worker was started.
    pub fn start_worker(&self, spec: RepositorySpec) -> bool {
        Inner::start(&self.inner, spec)
    }

    /// Stops and unregisters a worker. Absence is not an error.
    pub fn stop_worker(&self, name: &str) -> bool {
        match self.inner.workers.remove(name) {
            Some((_, registered)) => {
                let _ = registered.tx.try_send(WorkerMsg::Stop);
                registered.abort.abort();
                self.inner.metrics.controller.workers.dec();
                info!(repo = name, "worker stopped");
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<WorkerRef> {
        self.inner.workers.get(name).map(|r| r.sender.clone())
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.workers.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn stop_all(&self) {
        for name in self.list() {
            self.stop_worker(&name);
        }
    }
}

impl Inner {
    fn start(inner: &Arc<Inner>, spec: RepositorySpec) -> bool {
        let name = spec.name.clone();
        match inner.workers.entry(name.clone()) {
            MapEntry::Occupied(_) => false,
            MapEntry::Vacant(slot) => {
                let epoch = inner.epochs.fetch_add(1, Ordering::Relaxed);
                let handle = spawn_worker(spec.clone(), inner.deps.clone());
                let sender = handle.sender();
                let (_, tx, join) = handle.into_parts();
                slot.insert(Registered {
                    spec,
                    sender,
                    tx,
                    abort: join.abort_handle(),
                    epoch,
                });
                inner.metrics.controller.workers.inc();
                tokio::spawn(Inner::monitor(inner.clone(), name, epoch, join));
                true
            }
        }
    }

    /// One-for-one supervision: restarts panicked workers, unregisters
    /// workers that completed on their own.
    async fn monitor(inner: Arc<Inner>, name: String, epoch: u64, join: JoinHandle<()>) {
        let result = join.await;
        let panicked = matches!(&result, Err(e) if e.is_panic());

        let spec = match inner
            .workers
            .remove_if(&name, |_, registered| registered.epoch == epoch)
        {
            Some((_, registered)) => registered.spec,
            // stopped deliberately or already replaced
            None => return,
        };
        inner.metrics.controller.workers.dec();

        if panicked {
            error!(repo = %name, "worker panicked, restarting");
            inner.metrics.controller.worker_restarts.inc();
            Inner::start(&inner, spec);
        }
    }
}
