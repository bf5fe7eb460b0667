//! Progress callback throttling.
//!
//! Each registered callback gets a tracker with a minimum period. A call
//! inside the period arms one deferred call at the end of it; further calls
//! while one is armed do nothing. The deferred call reads the transfer's
//! state when it fires, so the latest progress is always what is reported.
//!
//! An error is delivered immediately and ends the tracker: no later call is
//! made. `delete` stops every tracker of a transfer and cancels any armed
//! call.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use mixdrop_core::TransferId;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::TransferError;

/// Reports the current state of one transfer to one user callback.
pub type ProgressThunk = Arc<dyn Fn(Option<&TransferError>) + Send + Sync>;

#[derive(Default)]
struct TrackerState {
    last_call: Option<Instant>,
    scheduled: Option<JoinHandle<()>>,
    complete: bool,
}

struct Tracker {
    period: Duration,
    thunk: ProgressThunk,
    state: Mutex<TrackerState>,
}

impl Tracker {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn call(self: &Arc<Self>, err: Option<&TransferError>, runtime: &Handle) {
        let mut state = self.lock();
        if state.complete {
            return;
        }

        if let Some(err) = err {
            state.complete = true;
            if let Some(pending) = state.scheduled.take() {
                pending.abort();
            }
            state.last_call = Some(Instant::now());
            drop(state);
            (self.thunk)(Some(err));
            return;
        }

        let now = Instant::now();
        let elapsed = state.last_call.map(|last| now.duration_since(last));
        match elapsed {
            Some(elapsed) if elapsed < self.period => {
                if state.scheduled.is_none() {
                    let delay = self.period - elapsed;
                    let tracker = Arc::clone(self);
                    state.scheduled = Some(runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        tracker.fire_scheduled();
                    }));
                }
            }
            _ => {
                state.last_call = Some(now);
                drop(state);
                (self.thunk)(None);
            }
        }
    }

    fn fire_scheduled(&self) {
        let mut state = self.lock();
        state.scheduled = None;
        if state.complete {
            return;
        }
        state.last_call = Some(Instant::now());
        drop(state);
        (self.thunk)(None);
    }

    fn stop(&self) {
        let mut state = self.lock();
        state.complete = true;
        if let Some(pending) = state.scheduled.take() {
            pending.abort();
        }
    }
}

/// Throttled progress callbacks for every transfer.
pub struct CallbackTracker {
    trackers: DashMap<TransferId, Vec<Arc<Tracker>>>,
    runtime: Handle,
}

impl CallbackTracker {
    /// Deferred calls are spawned on `runtime`, so `call` may be used from
    /// threads outside it.
    pub fn new(runtime: Handle) -> Self {
        Self {
            trackers: DashMap::new(),
            runtime,
        }
    }

    /// Register a callback and report the current state to it right away.
    pub fn add_callback(&self, tid: TransferId, period: Duration, thunk: ProgressThunk) {
        let tracker = Arc::new(Tracker {
            period,
            thunk,
            state: Mutex::new(TrackerState::default()),
        });
        self.trackers
            .entry(tid)
            .or_default()
            .push(Arc::clone(&tracker));
        tracker.call(None, &self.runtime);
    }

    /// Report progress (or a terminal error) to every callback of `tid`.
    pub fn call(&self, tid: TransferId, err: Option<&TransferError>) {
        let trackers = match self.trackers.get(&tid) {
            Some(entry) => entry.value().clone(),
            None => return,
        };
        for tracker in trackers {
            tracker.call(err, &self.runtime);
        }
    }

    /// Stop every callback of `tid`, cancelling armed deferred calls.
    pub fn delete(&self, tid: TransferId) {
        if let Some((_, trackers)) = self.trackers.remove(&tid) {
            for tracker in trackers {
                tracker.stop();
            }
        }
    }

    pub fn num_callbacks(&self, tid: &TransferId) -> usize {
        self.trackers.get(tid).map_or(0, |t| t.len())
    }
}
