//! The server: configuration, command resolution, listener, lifecycle hooks.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use crate::builtins;
use crate::diagnostics;
use crate::event_log;
use crate::exit_sentinel;
use crate::pool::SessionPool;
use crate::protocol::{MAX_HEADER_CHUNK_BYTES, MAX_STDIN_CHUNK_BYTES};
use crate::registry::{Nail, NailRegistry};
use crate::session::Connection;

pub const DEFAULT_PORT: u16 = 2113;

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// Address the listener binds. Loopback by default; the transport is
    /// assumed local and trusted.
    pub bind: SocketAddr,
    /// Silence tolerated on an open stdin before the client is considered
    /// gone.
    pub heartbeat_timeout: Duration,
    /// Idle workers kept for reuse; returning a worker beyond this retires
    /// it.
    pub pool_capacity: usize,
    /// Hard maximum on concurrently live workers.
    pub max_live_sessions: usize,
    /// Whether an unaliased command may name a registered nail directly.
    pub allow_raw_nail_names: bool,
    /// Qualified id of the nail serving unresolved commands, if any.
    pub default_nail: Option<String>,
    pub max_header_chunk: usize,
    pub max_stdin_chunk: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            heartbeat_timeout: Duration::from_millis(10_000),
            pool_capacity: 10,
            max_live_sessions: 64,
            allow_raw_nail_names: true,
            default_nail: Some(builtins::DEFAULT_NAIL_ID.to_string()),
            max_header_chunk: MAX_HEADER_CHUNK_BYTES,
            max_stdin_chunk: MAX_STDIN_CHUNK_BYTES,
        }
    }
}

struct ServerInner {
    config: ServerConfig,
    registry: NailRegistry,
    pool: SessionPool,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    listener_thread: Mutex<Option<JoinHandle<()>>>,
    active_nails: Mutex<HashMap<String, usize>>,
}

/// Cheap-to-clone handle on the server. Workers and nails hold clones; the
/// pool itself never does, so ownership stays one-directional.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let registry = NailRegistry::new();
        builtins::register(&registry);
        let pool = SessionPool::new(config.pool_capacity, config.max_live_sessions);
        Self {
            inner: Arc::new(ServerInner {
                config,
                registry,
                pool,
                running: AtomicBool::new(false),
                local_addr: Mutex::new(None),
                listener_thread: Mutex::new(None),
                active_nails: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &NailRegistry {
        &self.inner.registry
    }

    pub fn pool(&self) -> &SessionPool {
        &self.inner.pool
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.inner.config.heartbeat_timeout
    }

    pub fn allows_raw_nail_names(&self) -> bool {
        self.inner.config.allow_raw_nail_names
    }

    pub fn default_nail(&self) -> Option<&str> {
        self.inner.config.default_nail.as_deref()
    }

    /// Resolves a command name: alias first, then (when allowed) the raw
    /// nail id, then the configured default nail.
    pub(crate) fn resolve(&self, command: &str) -> Option<(String, Nail)> {
        let registry = self.registry();
        if let Some(id) = registry.resolve_alias(command)
            && let Some(nail) = registry.nail(&id)
        {
            return Some((id, nail));
        }
        if self.allows_raw_nail_names()
            && let Some(nail) = registry.nail(command)
        {
            return Some((command.to_string(), nail));
        }
        if let Some(id) = self.default_nail()
            && let Some(nail) = registry.nail(id)
        {
            return Some((id.to_string(), nail));
        }
        None
    }

    pub(crate) fn nail_started(&self, id: &str) {
        let mut active = self.inner.active_nails.lock().unwrap();
        *active.entry(id.to_string()).or_insert(0) += 1;
        event_log::log("nail_started", json!({ "nail": id }));
    }

    pub(crate) fn nail_finished(&self, id: &str) {
        let mut active = self.inner.active_nails.lock().unwrap();
        if let Some(count) = active.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                active.remove(id);
            }
        }
        event_log::log("nail_finished", json!({ "nail": id }));
    }

    /// Invocations currently inside a given nail.
    pub fn running_count(&self, id: &str) -> usize {
        self.inner
            .active_nails
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Nails with at least one running invocation, sorted by id.
    pub fn active_nails(&self) -> Vec<(String, usize)> {
        let active = self.inner.active_nails.lock().unwrap();
        let mut entries: Vec<(String, usize)> = active
            .iter()
            .map(|(id, count)| (id.clone(), *count))
            .collect();
        entries.sort();
        entries
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    /// Binds the listener and starts accepting on a dedicated thread.
    /// Returns the bound address (useful with a port of 0).
    pub fn start(&self) -> io::Result<SocketAddr> {
        exit_sentinel::install();
        let listener = TcpListener::bind(self.inner.config.bind)?;
        let addr = listener.local_addr()?;
        *self.inner.local_addr.lock().unwrap() = Some(addr);
        self.inner.running.store(true, Ordering::SeqCst);

        let server = self.clone();
        let handle = thread::Builder::new()
            .name("ng-listener".to_string())
            .spawn(move || server.accept_loop(listener))?;
        *self.inner.listener_thread.lock().unwrap() = Some(handle);

        diagnostics::startup_log(format!("server: listening on {addr}"));
        event_log::log("server_listening", json!({ "addr": addr.to_string() }));
        Ok(addr)
    }

    fn accept_loop(&self, listener: TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if !self.is_running() {
                        break;
                    }
                    let worker = match self.inner.pool.take(self) {
                        Ok(worker) => worker,
                        Err(_) => break,
                    };
                    match Connection::from_tcp(stream) {
                        Ok(conn) => worker.assign(conn),
                        Err(err) => {
                            eprintln!("nailgund: failed to adopt connection from {peer}: {err}");
                            self.inner.pool.give(worker);
                        }
                    }
                }
                Err(err) => {
                    if !self.is_running() {
                        break;
                    }
                    // A failing listener is fatal: drain the pool and leave
                    // the accept loop.
                    eprintln!("nailgund: listener failed: {err}");
                    event_log::log("listener_failed", json!({ "error": err.to_string() }));
                    self.inner.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
        self.inner.pool.shutdown();
        diagnostics::startup_log("server: accept loop ended");
    }

    /// Signals shutdown: stops accepting and starts the pool drain. Safe to
    /// call from inside a running nail; does not wait for completion.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        event_log::log("server_shutdown", json!({}));
        self.inner.pool.shutdown();
        // Wake the listener so it observes the stopped flag.
        if let Some(addr) = self.local_addr() {
            let _ = TcpStream::connect(addr);
        }
    }

    /// Waits for the listener thread and every in-flight session to end.
    pub fn join(&self) {
        let handle = self.inner.listener_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.inner.pool.await_drained(None);
    }

    /// Runs until shutdown is requested (typically by the stop nail).
    pub fn run(&self) -> io::Result<()> {
        self.start()?;
        self.join();
        Ok(())
    }
}
