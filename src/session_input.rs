//! Byte-stream view of a client's multiplexed stdin.
//!
//! A background thread drains stdin, stdin-eof, and heartbeat chunks from
//! the connection into a shared buffer. The foreground `read` waits on that
//! buffer with a bound equal to the heartbeat timeout, so a silent client is
//! detected even while a nail is blocked on input.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{DisconnectReason, SessionError};
use crate::event_log;
use crate::protocol::{self, CHUNK_HEARTBEAT, CHUNK_STDIN, CHUNK_STDIN_EOF};

struct InputInbox {
    buffer: VecDeque<u8>,
    eof: bool,
    disconnected: bool,
    last_activity: Instant,
}

/// Cloneable handle to one session's stdin. All clones share the buffer, so
/// bytes are consumed exactly once regardless of which handle reads them.
#[derive(Clone)]
pub struct SessionInput {
    inbox: Arc<Mutex<InputInbox>>,
    cvar: Arc<Condvar>,
    heartbeat_timeout: Duration,
}

impl SessionInput {
    /// Takes ownership of the connection's read half and starts the chunk
    /// drain thread. Must be called only after the session header has been
    /// fully consumed; everything that follows on the stream is stdin
    /// multiplexing.
    pub fn spawn(
        mut reader: Box<dyn Read + Send>,
        heartbeat_timeout: Duration,
        max_chunk: usize,
    ) -> Self {
        let inbox = Arc::new(Mutex::new(InputInbox {
            buffer: VecDeque::new(),
            eof: false,
            disconnected: false,
            last_activity: Instant::now(),
        }));
        let cvar = Arc::new(Condvar::new());

        let reader_inbox = inbox.clone();
        let reader_cvar = cvar.clone();
        let builder = thread::Builder::new().name("ng-stdin-drain".to_string());
        let spawned = builder.spawn(move || {
            loop {
                match protocol::read_chunk(&mut reader, max_chunk) {
                    Ok(chunk) => {
                        let mut guard = reader_inbox.lock().unwrap();
                        guard.last_activity = Instant::now();
                        match chunk.tag {
                            CHUNK_STDIN => guard.buffer.extend(chunk.payload.iter()),
                            CHUNK_HEARTBEAT => {}
                            CHUNK_STDIN_EOF => {
                                guard.eof = true;
                                reader_cvar.notify_all();
                                break;
                            }
                            other => {
                                drop(guard);
                                event_log::log(
                                    "wire_warning",
                                    serde_json::json!({
                                        "detail": "unexpected chunk type during stdin multiplexing",
                                        "tag": protocol::tag_name(other),
                                    }),
                                );
                                continue;
                            }
                        }
                        reader_cvar.notify_all();
                    }
                    Err(_) => {
                        let mut guard = reader_inbox.lock().unwrap();
                        guard.disconnected = true;
                        reader_cvar.notify_all();
                        break;
                    }
                }
            }
        });
        if spawned.is_err() {
            let mut guard = inbox.lock().unwrap();
            guard.disconnected = true;
        }

        Self {
            inbox,
            cvar,
            heartbeat_timeout,
        }
    }

    /// End-of-stream has been observed and every buffered byte consumed.
    pub fn is_exhausted(&self) -> bool {
        let guard = self.inbox.lock().unwrap();
        guard.eof && guard.buffer.is_empty()
    }

    fn disconnect_error(&self, reason: DisconnectReason) -> io::Error {
        let kind = match reason {
            DisconnectReason::HeartbeatExpired(_) => io::ErrorKind::TimedOut,
            DisconnectReason::PeerClosed => io::ErrorKind::ConnectionAborted,
        };
        io::Error::new(kind, SessionError::Disconnected(reason).to_string())
    }
}

impl Read for SessionInput {
    /// Blocks until bytes are buffered, end-of-stream is reached, or the
    /// heartbeat timeout elapses. Returns 1..=buf.len() bytes; 0 only at
    /// end-of-stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut guard = self.inbox.lock().unwrap();
        loop {
            if !guard.buffer.is_empty() {
                let n = buf.len().min(guard.buffer.len());
                for (dst, src) in buf.iter_mut().zip(guard.buffer.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            if guard.eof {
                return Ok(0);
            }
            if guard.disconnected {
                return Err(self.disconnect_error(DisconnectReason::PeerClosed));
            }

            let idle = guard.last_activity.elapsed();
            if idle >= self.heartbeat_timeout {
                guard.disconnected = true;
                event_log::log(
                    "heartbeat_expired",
                    serde_json::json!({ "timeout_ms": self.heartbeat_timeout.as_millis() as u64 }),
                );
                return Err(
                    self.disconnect_error(DisconnectReason::HeartbeatExpired(
                        self.heartbeat_timeout,
                    )),
                );
            }
            let remaining = self.heartbeat_timeout - idle;
            let (next_guard, _) = self.cvar.wait_timeout(guard, remaining).unwrap();
            guard = next_guard;
        }
    }
}
