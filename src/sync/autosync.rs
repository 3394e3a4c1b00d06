use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::sync::JsonlSync;

/// Coalescing window for mutations arriving close together.
pub const DEBOUNCE_MS: u64 = 100;

#[derive(Default)]
struct AutoSyncState {
    dirty: bool,
    shutdown: bool,
    exports: u64,
}

struct Shared {
    state: Mutex<AutoSyncState>,
    cv: Condvar,
}

/// Debounced background export: `mark_dirty()` after a mutation schedules a
/// single JSONL export once the coalescing window closes. At most one export
/// is in flight; mutations landing during an export simply re-dirty.
pub struct AutoSync {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl AutoSync {
    pub fn start(sync: Arc<JsonlSync>) -> crate::error::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(AutoSyncState::default()),
            cv: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);

        let handle = std::thread::Builder::new()
            .name("tx-autosync".into())
            .spawn(move || run_loop(worker_shared, sync))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Record that task/dep/learning state changed. Cheap; safe from hooks.
    pub fn mark_dirty(&self) {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.dirty = true;
        self.shared.cv.notify_one();
    }

    /// Number of exports performed so far (test observability).
    pub fn export_count(&self) -> u64 {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .exports
    }

    /// Obtain a hook suitable for `Store::set_after_mutation`.
    pub fn hook(self: &Arc<Self>) -> crate::store::MutationHook {
        let me = Arc::clone(self);
        Arc::new(move || me.mark_dirty())
    }
}

impl Drop for AutoSync {
    fn drop(&mut self) {
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

fn run_loop(shared: Arc<Shared>, sync: Arc<JsonlSync>) {
    loop {
        // Wait until there is work or we are asked to stop.
        {
            let mut state = shared
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            while !state.dirty && !state.shutdown {
                state = shared
                    .cv
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
            if state.shutdown && !state.dirty {
                return;
            }
        }

        // Coalescing window: mutations arriving now fold into this export.
        std::thread::sleep(Duration::from_millis(DEBOUNCE_MS));

        {
            let mut state = shared
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.dirty = false;
        }

        match sync.export() {
            Ok(report) => {
                tracing::debug!(tasks = report.tasks, deps = report.deps, "auto-sync export");
            }
            Err(err) => {
                tracing::warn!(error = %err, "auto-sync export failed");
            }
        }

        let mut state = shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.exports += 1;
        if state.shutdown && !state.dirty {
            return;
        }
    }
}
