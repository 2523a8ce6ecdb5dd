//! A long-running command server speaking the nailgun chunk protocol.
//!
//! Thin clients connect, send their argument vector, environment, working
//! directory and stdin, and receive stdout, stderr and an exit status as if
//! they had run the tool locally — without paying its startup cost. The
//! server keeps a pool of reusable session workers, one preemptive thread
//! per concurrent connection, and routes the host's standard streams to
//! whichever session the calling thread is serving.

pub mod builtins;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod event_log;
pub mod exit_sentinel;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod session_input;
pub mod session_output;
pub mod stdio_router;

pub use context::NailContext;
pub use error::{DisconnectReason, SessionError};
pub use registry::{Nail, NailRegistry, NailResult};
pub use server::{Server, ServerConfig};
pub use session::Connection;
