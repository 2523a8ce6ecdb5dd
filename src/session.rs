//! Session workers: each owns one accepted connection end-to-end.
//!
//! A worker is a reusable thread. Idle, it blocks waiting for the pool to
//! assign it a connection; assigned, it decodes the session header,
//! dispatches the nail with per-session stdio installed, writes the exit
//! chunk, tears the connection down, and returns itself to the pool.

use std::collections::HashMap;
use std::io::{self, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Condvar, Mutex};

use serde_json::json;

use crate::context::NailContext;
use crate::diagnostics;
use crate::error::SessionError;
use crate::event_log;
use crate::exit_sentinel::{self, NailVerdict};
use crate::pool::SessionPool;
use crate::protocol::{
    self, CHUNK_ARGUMENT, CHUNK_COMMAND, CHUNK_ENVIRONMENT, CHUNK_STDERR, CHUNK_STDOUT,
    CHUNK_WORKING_DIR, EXIT_EXCEPTION, EXIT_NO_SUCH_COMMAND, MAX_HEADER_TOTAL_BYTES,
};
use crate::registry::{Nail, NailResult};
use crate::server::Server;
use crate::session_input::SessionInput;
use crate::session_output::{ChunkSink, SessionOutput};
use crate::stdio_router::{RouterGuard, SessionStdio};

/// One accepted client connection, reduced to the pieces a session needs.
pub struct Connection {
    pub(crate) reader: Box<dyn Read + Send>,
    pub(crate) writer: Box<dyn Write + Send>,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) closer: Option<Box<dyn FnOnce() + Send>>,
}

impl Connection {
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr().ok();
        let reader = stream.try_clone()?;
        let closer = stream.try_clone()?;
        Ok(Self {
            reader: Box::new(reader),
            writer: Box::new(BufWriter::new(stream)),
            peer,
            closer: Some(Box::new(move || {
                let _ = closer.shutdown(Shutdown::Both);
            })),
        })
    }

    /// Connection over arbitrary halves, for embedding and tests.
    pub fn from_parts(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer: None,
            closer: None,
        }
    }
}

struct SlotState {
    pending: Option<Connection>,
    done: bool,
}

struct WorkerSlot {
    state: Mutex<SlotState>,
    cvar: Condvar,
}

/// Handle on a pooled worker. The pool and the worker's own thread each
/// hold one; both point at the same assignment slot.
pub struct SessionWorker {
    slot: Arc<WorkerSlot>,
    pub(crate) instance: u64,
}

impl SessionWorker {
    pub(crate) fn new(instance: u64) -> Self {
        Self {
            slot: Arc::new(WorkerSlot {
                state: Mutex::new(SlotState {
                    pending: None,
                    done: false,
                }),
                cvar: Condvar::new(),
            }),
            instance,
        }
    }

    pub(crate) fn handle(&self) -> SessionWorker {
        Self {
            slot: self.slot.clone(),
            instance: self.instance,
        }
    }

    /// Hands the worker a connection to serve. Callers must hold a worker
    /// obtained from `SessionPool::take`.
    pub fn assign(&self, conn: Connection) {
        let mut state = self.slot.state.lock().unwrap();
        state.pending = Some(conn);
        self.slot.cvar.notify_all();
    }

    /// Asks the worker to terminate once its current session (if any) ends.
    pub(crate) fn shutdown(&self) {
        let mut state = self.slot.state.lock().unwrap();
        state.done = true;
        state.pending = None;
        self.slot.cvar.notify_all();
    }

    /// Blocks until a connection is assigned or shutdown is requested.
    fn next_connection(&self) -> Option<Connection> {
        let mut state = self.slot.state.lock().unwrap();
        loop {
            if let Some(conn) = state.pending.take() {
                return Some(conn);
            }
            if state.done {
                return None;
            }
            state = self.slot.cvar.wait(state).unwrap();
        }
    }
}

/// Thread body of one pooled worker.
pub(crate) fn worker_loop(worker: SessionWorker, server: Server, pool: SessionPool) {
    diagnostics::startup_log(format!("worker {}: started", worker.instance));
    while let Some(conn) = worker.next_connection() {
        let peer = conn.peer;
        if let Err(err) = serve(conn, &server) {
            eprintln!("nailgund: session failed: {err}");
            event_log::log(
                "session_failed",
                json!({
                    "worker": worker.instance,
                    "peer": peer.map(|addr| addr.to_string()),
                    "error": err.to_string(),
                }),
            );
        }
        pool.give(worker.handle());
    }
    diagnostics::startup_log(format!("worker {}: terminated", worker.instance));
    pool.note_terminated();
}

/// The decoded session header: everything the client sent before (and
/// including) the command chunk.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SessionHeader {
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub command: String,
}

/// Reads header chunks until the command arrives. Arguments accumulate in
/// order; environment entries are last-wins per key; the working directory
/// is last-wins; unknown tags are logged and skipped.
pub(crate) fn decode_header<R: Read>(
    reader: &mut R,
    max_chunk: usize,
    max_total: usize,
) -> Result<SessionHeader, SessionError> {
    let mut args = Vec::new();
    let mut env = HashMap::new();
    let mut working_dir = None;
    let mut total = 0usize;

    loop {
        let chunk = protocol::read_chunk(reader, max_chunk)?;
        total = total.saturating_add(chunk.payload.len());
        if total > max_total {
            return Err(SessionError::Protocol(format!(
                "session header exceeds {max_total} bytes"
            )));
        }
        match chunk.tag {
            CHUNK_ARGUMENT => args.push(chunk.text()),
            CHUNK_ENVIRONMENT => {
                let line = chunk.text();
                match line.split_once('=') {
                    Some((key, value)) if !key.is_empty() => {
                        env.insert(key.to_string(), value.to_string());
                    }
                    _ => {
                        event_log::log(
                            "wire_warning",
                            json!({ "detail": "environment chunk without KEY=VALUE", "chunk": line }),
                        );
                    }
                }
            }
            CHUNK_WORKING_DIR => working_dir = Some(chunk.text()),
            CHUNK_COMMAND => {
                return Ok(SessionHeader {
                    args,
                    env,
                    working_dir,
                    command: chunk.text(),
                });
            }
            other => {
                eprintln!(
                    "nailgund: ignoring unknown chunk type {:?} in session header",
                    other as char
                );
                event_log::log(
                    "wire_warning",
                    json!({ "detail": "unknown chunk type in header", "tag": other }),
                );
            }
        }
    }
}

/// Serves one connection to completion. Always attempts to finish with an
/// exit chunk unless the send side is already broken.
pub(crate) fn serve(mut conn: Connection, server: &Server) -> Result<(), SessionError> {
    let peer = conn.peer;
    let mut closer = conn.closer.take();
    event_log::log(
        "session_start",
        json!({ "peer": peer.map(|addr| addr.to_string()) }),
    );

    let config = server.config();
    let header = match decode_header(&mut conn.reader, config.max_header_chunk, MAX_HEADER_TOTAL_BYTES)
    {
        Ok(header) => header,
        Err(err) => {
            // Send channel may still be up; report the failure to the
            // client if it is, then drop the connection.
            let sink = ChunkSink::shared(conn.writer);
            let _ = sink.lock().unwrap().write_exit(EXIT_EXCEPTION);
            if let Some(close) = closer.take() {
                close();
            }
            return Err(err);
        }
    };

    event_log::log(
        "session_dispatch",
        json!({
            "command": &header.command,
            "args": header.args.len(),
            "env": header.env.len(),
            "working_dir": &header.working_dir,
        }),
    );

    let sink = ChunkSink::shared(conn.writer);
    let stdin = SessionInput::spawn(conn.reader, server.heartbeat_timeout(), config.max_stdin_chunk);
    let mut stdout = SessionOutput::new(sink.clone(), CHUNK_STDOUT);
    let mut stderr = SessionOutput::new(sink.clone(), CHUNK_STDERR);

    let command = header.command.clone();
    let (status, invoked) = match server.resolve(&command) {
        None => {
            event_log::log("command_unresolved", json!({ "command": &command }));
            (EXIT_NO_SUCH_COMMAND, None)
        }
        Some((id, nail)) => {
            let stdio = SessionStdio {
                stdin: stdin.clone(),
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            };
            let router_binding = RouterGuard::install(stdio);
            server.nail_started(&id);

            let mut ctx = NailContext::new(
                header.args,
                header.env,
                header.working_dir,
                header.command,
                peer,
                stdin.clone(),
                stdout.clone(),
                stderr.clone(),
                server.clone(),
            );
            let verdict = exit_sentinel::run_nail(|| invoke_nail(&nail, &mut ctx));
            let status = status_for(&id, verdict);
            (status, Some((id, router_binding)))
        }
    };

    // Program-order guarantee: everything the nail wrote reaches the wire
    // before the exit chunk, and the exit chunk is strictly last.
    let _ = stdout.flush();
    let _ = stderr.flush();
    let exit_result = sink.lock().unwrap().write_exit(status);

    if let Some((id, router_binding)) = invoked {
        drop(router_binding);
        server.nail_finished(&id);
    }
    if let Some(close) = closer.take() {
        close();
    }
    event_log::log("session_exit", json!({ "command": &command, "status": status }));
    exit_result.map_err(SessionError::from)
}

fn invoke_nail(nail: &Nail, ctx: &mut NailContext) -> NailResult {
    match nail {
        Nail::Static(entry) => entry(ctx.args()),
        Nail::Contextual(entry) => entry(ctx),
    }
}

fn status_for(id: &str, verdict: NailVerdict) -> i32 {
    match verdict {
        NailVerdict::Clean => 0,
        NailVerdict::Exit(status) => status,
        NailVerdict::Failed(message) => {
            eprintln!("nailgund: nail {id} failed: {message}");
            event_log::log("nail_failed", json!({ "nail": id, "error": message }));
            EXIT_EXCEPTION
        }
        NailVerdict::Panicked(message) => {
            eprintln!("nailgund: nail {id} panicked: {message}");
            event_log::log("nail_panicked", json!({ "nail": id, "error": message }));
            EXIT_EXCEPTION
        }
    }
}
