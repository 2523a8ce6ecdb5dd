//! Bounded pool of reusable session workers.
//!
//! Workers are created lazily when a connection arrives and no idle worker
//! exists, up to a live-worker maximum. Returning a worker when the idle
//! set is already at capacity retires it instead of keeping it around.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::error::SessionError;
use crate::event_log;
use crate::server::Server;
use crate::session::{self, SessionWorker};

struct PoolState {
    idle: Vec<SessionWorker>,
    in_flight: HashSet<u64>,
    live: usize,
    draining: bool,
    next_instance: u64,
}

struct PoolInner {
    state: Mutex<PoolState>,
    cvar: Condvar,
    capacity: usize,
    max_live: usize,
}

#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// `capacity` bounds the idle set; `max_live` bounds workers overall.
    pub(crate) fn new(capacity: usize, max_live: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    in_flight: HashSet::new(),
                    live: 0,
                    draining: false,
                    next_instance: 0,
                }),
                cvar: Condvar::new(),
                capacity,
                max_live: max_live.max(1),
            }),
        }
    }

    /// Returns an idle worker, spawning one when under the live maximum.
    /// Blocks while every worker is busy; fails once the pool is draining.
    pub fn take(&self, server: &Server) -> Result<SessionWorker, SessionError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap();
        loop {
            if state.draining {
                return Err(SessionError::ShuttingDown);
            }
            if let Some(worker) = state.idle.pop() {
                state.in_flight.insert(worker.instance);
                return Ok(worker);
            }
            if state.live < inner.max_live {
                state.live += 1;
                state.next_instance += 1;
                let instance = state.next_instance;
                let worker = SessionWorker::new(instance);
                state.in_flight.insert(instance);
                drop(state);

                let thread_worker = worker.handle();
                let server = server.clone();
                let pool = self.clone();
                let spawned = thread::Builder::new()
                    .name(format!("ng-session-{instance}"))
                    .spawn(move || session::worker_loop(thread_worker, server, pool));
                match spawned {
                    Ok(_) => {
                        event_log::log("pool_worker_spawned", json!({ "worker": instance }));
                        return Ok(worker);
                    }
                    Err(err) => {
                        let mut state = inner.state.lock().unwrap();
                        state.live -= 1;
                        state.in_flight.remove(&instance);
                        inner.cvar.notify_all();
                        return Err(err.into());
                    }
                }
            }
            state = inner.cvar.wait(state).unwrap();
        }
    }

    /// Returns a worker after its session. Retires it when the idle set is
    /// at capacity or the pool is draining. Returning a worker that was not
    /// taken from this pool is a programming error.
    pub fn give(&self, worker: SessionWorker) {
        let mut state = self.inner.state.lock().unwrap();
        assert!(
            state.in_flight.remove(&worker.instance),
            "worker {} was returned to a pool it was not taken from",
            worker.instance
        );
        if state.draining || state.idle.len() >= self.inner.capacity {
            worker.shutdown();
            event_log::log("pool_worker_retired", json!({ "worker": worker.instance }));
        } else {
            state.idle.push(worker);
        }
        self.inner.cvar.notify_all();
    }

    /// Starts the drain: idle workers wake and terminate, busy workers
    /// finish their current session first. Further `take` calls fail.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.draining {
            return;
        }
        state.draining = true;
        for worker in state.idle.drain(..) {
            worker.shutdown();
        }
        self.inner.cvar.notify_all();
    }

    /// Called by a worker thread as it exits.
    pub(crate) fn note_terminated(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.live = state.live.saturating_sub(1);
        self.inner.cvar.notify_all();
    }

    pub fn live_workers(&self) -> usize {
        self.inner.state.lock().unwrap().live
    }

    pub fn idle_workers(&self) -> usize {
        self.inner.state.lock().unwrap().idle.len()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().unwrap().draining
    }

    /// Waits until every worker thread has terminated. With a timeout,
    /// returns whether the pool fully drained in time.
    pub fn await_drained(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.live == 0 {
                return true;
            }
            match deadline {
                None => state = self.inner.cvar.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (next_state, _) = self
                        .inner
                        .cvar
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = next_state;
                }
            }
        }
    }
}
