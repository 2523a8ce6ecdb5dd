//! Per-invocation context handed to contextual nails.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::exit_sentinel;
use crate::server::Server;
use crate::session_input::SessionInput;
use crate::session_output::SessionOutput;

/// Everything one invocation may observe: the decoded header, the peer, the
/// session streams, and a handle to the hosting server.
pub struct NailContext {
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<String>,
    command: String,
    peer: Option<SocketAddr>,
    stdin: SessionInput,
    stdout: SessionOutput,
    stderr: SessionOutput,
    server: Server,
}

impl NailContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        args: Vec<String>,
        env: HashMap<String, String>,
        working_dir: Option<String>,
        command: String,
        peer: Option<SocketAddr>,
        stdin: SessionInput,
        stdout: SessionOutput,
        stderr: SessionOutput,
        server: Server,
    ) -> Self {
        Self {
            args,
            env,
            working_dir,
            command,
            peer,
            stdin,
            stdout,
            stderr,
            server,
        }
    }

    /// Client argument vector, in transmission order.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Client environment; duplicate keys resolved last-wins on receipt.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// The client's working directory, when it sent one.
    pub fn working_dir(&self) -> Option<&str> {
        self.working_dir.as_deref()
    }

    /// The command name the client invoked (alias or qualified id).
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Remote peer identity, where the transport exposes one.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The session's stdin. Handles are cheap clones over shared state.
    pub fn stdin(&self) -> SessionInput {
        self.stdin.clone()
    }

    pub fn stdout(&self) -> SessionOutput {
        self.stdout.clone()
    }

    pub fn stderr(&self) -> SessionOutput {
        self.stderr.clone()
    }

    /// The hosting server, for introspection and shutdown.
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Ends this invocation with the given exit status. The session worker
    /// converts it into the exit chunk; the host process keeps running.
    pub fn exit(&self, status: i32) -> ! {
        exit_sentinel::trigger(status)
    }
}
