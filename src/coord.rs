use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::Result;
use crate::ids::TaskId;
use crate::model::{TaskClaim, Worker, WorkerStatus};
use crate::store::Store;
use crate::store::workers::ReconcileReport;

/// Default heartbeat cadence.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

#[derive(Default)]
struct BeatState {
    shutdown: bool,
}

struct BeatShared {
    state: Mutex<BeatState>,
    cv: Condvar,
}

/// A registered worker process: owns the heartbeat timer and stops it on
/// shutdown. The first beat moves the worker from `starting` to `idle`;
/// every beat also runs claim/worker reconciliation.
pub struct WorkerSession {
    store: Arc<Store>,
    worker_id: String,
    shared: Arc<BeatShared>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerSession {
    pub fn start(
        store: Arc<Store>,
        name: &str,
        capabilities: &[String],
        heartbeat_interval: Option<Duration>,
    ) -> Result<Self> {
        let interval = heartbeat_interval.unwrap_or(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let worker = store.register_worker(name, &hostname, std::process::id(), capabilities)?;
        let worker_id = worker.id.as_str().to_string();

        let shared = Arc::new(BeatShared {
            state: Mutex::new(BeatState::default()),
            cv: Condvar::new(),
        });

        let beat_store = Arc::clone(&store);
        let beat_shared = Arc::clone(&shared);
        let beat_id = worker_id.clone();
        let handle = std::thread::Builder::new()
            .name(format!("tx-heartbeat-{beat_id}"))
            .spawn(move || heartbeat_loop(beat_store, beat_shared, beat_id, interval))?;

        Ok(Self {
            store,
            worker_id,
            shared,
            handle: Some(handle),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn worker(&self) -> Result<Worker> {
        self.store.get_worker(&self.worker_id)
    }

    /// Claim a task and go busy on it.
    pub fn accept(&self, task_id: &TaskId, lease_minutes: Option<i64>) -> Result<TaskClaim> {
        let claim = self.store.claim_task(task_id, &self.worker_id, lease_minutes)?;
        self.store.worker_accept_task(&self.worker_id, task_id)?;
        Ok(claim)
    }

    pub fn renew(&self, task_id: &TaskId) -> Result<TaskClaim> {
        self.store.renew_claim(task_id, &self.worker_id)
    }

    /// Release the claim and return to idle.
    pub fn complete(&self, task_id: &TaskId) -> Result<Worker> {
        self.store.release_claim(task_id, &self.worker_id)?;
        self.store.worker_complete_task(&self.worker_id)
    }

    /// Doctor routine: heartbeat plus reconciliation, on demand.
    pub fn doctor(&self) -> Result<ReconcileReport> {
        self.store.worker_heartbeat(&self.worker_id)?;
        self.store.reconcile()
    }

    /// Graceful shutdown: stop the heartbeat, release claims, and walk
    /// `stopping -> dead`.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop_thread();

        for claim in self.store.claims_for_worker(&self.worker_id)? {
            if claim.status == crate::model::ClaimStatus::Active {
                self.store.release_claim(&claim.task_id, &self.worker_id)?;
            }
        }
        self.store
            .worker_set_status(&self.worker_id, WorkerStatus::Stopping)?;
        self.store
            .worker_set_status(&self.worker_id, WorkerStatus::Dead)?;
        Ok(())
    }

    fn stop_thread(&mut self) {
        {
            let mut state = self
                .shared
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.shutdown = true;
            self.shared.cv.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

fn heartbeat_loop(
    store: Arc<Store>,
    shared: Arc<BeatShared>,
    worker_id: String,
    interval: Duration,
) {
    loop {
        if let Err(err) = store.worker_heartbeat(&worker_id) {
            tracing::warn!(worker = %worker_id, error = %err, "heartbeat failed");
        }
        if let Err(err) = store.reconcile() {
            tracing::warn!(error = %err, "reconciliation failed");
        }

        let state = shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (state, _timeout) = shared
            .cv
            .wait_timeout_while(state, interval, |s| !s.shutdown)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.shutdown {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClaimStatus;
    use crate::store::tasks::NewTask;
    use std::time::Instant;

    fn store_with_task() -> (Arc<Store>, TaskId) {
        let store = Arc::new(Store::open_memory().unwrap());
        let task = store
            .create_task(NewTask {
                title: "session work".into(),
                ..Default::default()
            })
            .unwrap();
        (store, task.id)
    }

    fn wait_until_idle(store: &Store, worker_id: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let worker = store.get_worker(worker_id).unwrap();
            if worker.status == WorkerStatus::Idle {
                return;
            }
            assert!(Instant::now() < deadline, "worker never became idle");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn first_heartbeat_moves_starting_to_idle() {
        let (store, _task) = store_with_task();
        let session = WorkerSession::start(
            Arc::clone(&store),
            "beat-test",
            &[],
            Some(Duration::from_millis(20)),
        )
        .unwrap();

        wait_until_idle(&store, session.worker_id());
        session.shutdown().unwrap();
    }

    #[test]
    fn accept_complete_cycle() {
        let (store, task_id) = store_with_task();
        let session = WorkerSession::start(
            Arc::clone(&store),
            "worker-a",
            &["rust".into()],
            Some(Duration::from_millis(20)),
        )
        .unwrap();
        wait_until_idle(&store, session.worker_id());

        let claim = session.accept(&task_id, None).unwrap();
        assert_eq!(claim.status, ClaimStatus::Active);
        let worker = session.worker().unwrap();
        assert_eq!(worker.status, WorkerStatus::Busy);
        assert_eq!(worker.current_task_id.as_ref(), Some(&task_id));

        session.renew(&task_id).unwrap();

        let worker = session.complete(&task_id).unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert!(store.active_claim(&task_id).unwrap().is_none());

        session.shutdown().unwrap();
    }

    #[test]
    fn shutdown_walks_stopping_to_dead_and_releases() {
        let (store, task_id) = store_with_task();
        let session = WorkerSession::start(
            Arc::clone(&store),
            "worker-b",
            &[],
            Some(Duration::from_millis(20)),
        )
        .unwrap();
        wait_until_idle(&store, session.worker_id());
        session.accept(&task_id, None).unwrap();
        let worker_id = session.worker_id().to_string();

        session.shutdown().unwrap();
        let worker = store.get_worker(&worker_id).unwrap();
        assert_eq!(worker.status, WorkerStatus::Dead);
        assert!(store.active_claim(&task_id).unwrap().is_none());
    }

    #[test]
    fn doctor_runs_reconciliation() {
        let (store, _task) = store_with_task();
        let session = WorkerSession::start(
            Arc::clone(&store),
            "worker-doc",
            &[],
            Some(Duration::from_secs(600)),
        )
        .unwrap();
        let report = session.doctor().unwrap();
        assert_eq!(report, ReconcileReport::default());
        session.shutdown().unwrap();
    }
}
