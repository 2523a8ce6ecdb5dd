//! Routes the host process's standard streams to the current session.
//!
//! Static nails are written as if they owned the process: they read
//! [`stdin`] and write [`stdout`]/[`stderr`]. The router keys each binding
//! by the calling thread's identity, so concurrent sessions never see each
//! other's bytes. Contextual nails receive their streams directly and do
//! not need the router.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Mutex, OnceLock};
use std::thread::ThreadId;

use crate::session_input::SessionInput;
use crate::session_output::SessionOutput;

/// The stdio triple bound to a serving worker thread.
#[derive(Clone)]
pub struct SessionStdio {
    pub stdin: SessionInput,
    pub stdout: SessionOutput,
    pub stderr: SessionOutput,
}

/// Where unbound reads and writes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// The server's own console.
    Console,
    /// Swallow writes, report end-of-stream on reads.
    Sink,
}

static BINDINGS: OnceLock<Mutex<HashMap<ThreadId, SessionStdio>>> = OnceLock::new();
static FALLBACK: Mutex<Fallback> = Mutex::new(Fallback::Console);

fn bindings() -> &'static Mutex<HashMap<ThreadId, SessionStdio>> {
    BINDINGS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Binds the calling thread to the given session streams.
pub fn install(stdio: SessionStdio) {
    bindings()
        .lock()
        .unwrap()
        .insert(std::thread::current().id(), stdio);
}

/// Unbinds the calling thread. Subsequent reads and writes fall back.
pub fn uninstall() {
    bindings().lock().unwrap().remove(&std::thread::current().id());
}

/// Whether the calling thread is currently serving a session.
pub fn is_bound() -> bool {
    bindings()
        .lock()
        .unwrap()
        .contains_key(&std::thread::current().id())
}

pub fn set_fallback(fallback: Fallback) {
    *FALLBACK.lock().unwrap() = fallback;
}

fn fallback() -> Fallback {
    *FALLBACK.lock().unwrap()
}

fn current_binding() -> Option<SessionStdio> {
    bindings()
        .lock()
        .unwrap()
        .get(&std::thread::current().id())
        .cloned()
}

/// Handle on the routed standard input.
pub fn stdin() -> RoutedStdin {
    RoutedStdin(())
}

/// Handle on the routed standard output.
pub fn stdout() -> RoutedStdout {
    RoutedStdout(())
}

/// Handle on the routed standard error.
pub fn stderr() -> RoutedStderr {
    RoutedStderr(())
}

pub struct RoutedStdin(());
pub struct RoutedStdout(());
pub struct RoutedStderr(());

impl Read for RoutedStdin {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // The binding is cloned out so the router lock is never held across
        // a blocking socket read.
        match current_binding() {
            Some(stdio) => {
                let mut stdin = stdio.stdin;
                stdin.read(buf)
            }
            None => match fallback() {
                Fallback::Console => io::stdin().read(buf),
                Fallback::Sink => Ok(0),
            },
        }
    }
}

impl Write for RoutedStdout {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match current_binding() {
            Some(stdio) => {
                let mut stdout = stdio.stdout;
                stdout.write(data)
            }
            None => match fallback() {
                Fallback::Console => io::stdout().write(data),
                Fallback::Sink => Ok(data.len()),
            },
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match current_binding() {
            Some(stdio) => {
                let mut stdout = stdio.stdout;
                stdout.flush()
            }
            None => match fallback() {
                Fallback::Console => io::stdout().flush(),
                Fallback::Sink => Ok(()),
            },
        }
    }
}

impl Write for RoutedStderr {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match current_binding() {
            Some(stdio) => {
                let mut stderr = stdio.stderr;
                stderr.write(data)
            }
            None => match fallback() {
                Fallback::Console => io::stderr().write(data),
                Fallback::Sink => Ok(data.len()),
            },
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match current_binding() {
            Some(stdio) => {
                let mut stderr = stdio.stderr;
                stderr.flush()
            }
            None => match fallback() {
                Fallback::Console => io::stderr().flush(),
                Fallback::Sink => Ok(()),
            },
        }
    }
}

/// Unbinds on drop, so every worker exit path removes its binding.
pub(crate) struct RouterGuard(());

impl RouterGuard {
    pub(crate) fn install(stdio: SessionStdio) -> Self {
        install(stdio);
        Self(())
    }
}

impl Drop for RouterGuard {
    fn drop(&mut self) {
        uninstall();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::protocol::{CHUNK_STDERR, CHUNK_STDOUT, MAX_STDIN_CHUNK_BYTES, read_chunk};
    use crate::session_output::ChunkSink;

    fn test_stdio() -> (SessionStdio, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let wire = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let capture = wire.clone();
        struct W(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
        impl io::Write for W {
            fn write(&mut self, data: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let sink = ChunkSink::shared(Box::new(W(capture)));
        let (reader, _writer) = std::io::pipe().expect("pipe");
        let stdin = SessionInput::spawn(
            Box::new(reader),
            Duration::from_secs(5),
            MAX_STDIN_CHUNK_BYTES,
        );
        (
            SessionStdio {
                stdin,
                stdout: SessionOutput::new(sink.clone(), CHUNK_STDOUT),
                stderr: SessionOutput::new(sink, CHUNK_STDERR),
            },
            wire,
        )
    }

    #[test]
    fn bound_thread_writes_reach_the_session_stream() {
        let (stdio, wire) = test_stdio();
        install(stdio);
        write!(stdout(), "routed").expect("routed write");
        stdout().flush().expect("routed flush");
        uninstall();

        let bytes = wire.lock().unwrap().clone();
        let chunk = read_chunk(&mut bytes.as_slice(), MAX_STDIN_CHUNK_BYTES).expect("chunk");
        assert_eq!(chunk.tag, CHUNK_STDOUT);
        assert_eq!(chunk.payload, b"routed");
    }

    #[test]
    fn unbound_thread_does_not_see_another_sessions_stream() {
        let (stdio, wire) = test_stdio();
        install(stdio);

        let other = std::thread::spawn(move || {
            set_fallback(Fallback::Sink);
            assert!(!is_bound(), "new thread must start unbound");
            write!(stdout(), "elsewhere").expect("fallback write");
            stdout().flush().expect("fallback flush");
        });
        other.join().expect("thread");
        uninstall();

        assert!(
            wire.lock().unwrap().is_empty(),
            "an unbound thread leaked bytes into a session stream"
        );
    }

    #[test]
    fn guard_unbinds_on_drop() {
        let (stdio, _wire) = test_stdio();
        {
            let _guard = RouterGuard::install(stdio);
            assert!(is_bound());
        }
        assert!(!is_bound(), "guard drop must remove the binding");
    }
}
