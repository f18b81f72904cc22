// Background Reindexing
//
// The surrounding HTTP layer triggers full rebuilds out of band. At most one
// rebuild runs at a time; its progress lives in a small mutex-guarded state
// that the status endpoint snapshots.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use serde::Serialize;

use crate::service::RagService;
use crate::store::NoteRecord;

/// Snapshot of the reindex worker state
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexStatus {
    pub running: bool,
    pub current: usize,
    pub total: usize,
    pub error: Option<String>,
}

#[derive(Default)]
pub struct ReindexCoordinator {
    state: Arc<Mutex<ReindexStatus>>,
}

impl ReindexCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current worker state.
    pub fn status(&self) -> ReindexStatus {
        lock_state(&self.state).clone()
    }

    /// Start a rebuild on a background thread using the given service, which
    /// must be bound to its own store handle (see
    /// `RagService::clone_for_thread`). Returns `false` without doing
    /// anything when a rebuild is already running.
    pub fn start(&self, mut service: RagService) -> bool {
        {
            let mut state = lock_state(&self.state);
            if state.running {
                log::debug!("[reindex] Rebuild already running, ignoring request");
                return false;
            }
            *state = ReindexStatus {
                running: true,
                ..ReindexStatus::default()
            };
        }

        let state = Arc::clone(&self.state);
        let spawned = thread::Builder::new()
            .name("rag-reindex".to_string())
            .spawn(move || {
                let progress_state = Arc::clone(&state);
                let mut progress = |current: usize, total: usize, _note: &NoteRecord| {
                    let mut state = lock_state(&progress_state);
                    state.current = current;
                    state.total = total;
                };
                let result = service.build_index(Some(&mut progress));

                let mut state = lock_state(&state);
                match result {
                    Ok(total) => {
                        state.current = total;
                        state.total = total;
                    }
                    Err(e) => {
                        log::error!("[reindex] Rebuild failed: {}", e);
                        state.error = Some(e.to_string());
                    }
                }
                state.running = false;
            });

        if spawned.is_err() {
            log::error!("[reindex] Failed to spawn rebuild worker");
            lock_state(&self.state).running = false;
            return false;
        }
        true
    }
}

fn lock_state(state: &Mutex<ReindexStatus>) -> std::sync::MutexGuard<'_, ReindexStatus> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
