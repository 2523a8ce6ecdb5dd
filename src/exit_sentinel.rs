//! Converts nail-initiated process exits into per-session signals.
//!
//! Nails are ports of standalone tools and routinely "exit the process" on
//! completion. On a thread that is serving a session, [`trigger`] raises a
//! recoverable signal that the session worker catches and turns into the
//! session's exit chunk; on any other thread it terminates the host for
//! real. [`install`] hooks the panic reporter once per process so an exit
//! signal unwinds silently instead of printing a crash report.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use crate::registry::NailResult;
use crate::stdio_router;

/// Payload carried through the unwind when a nail requests an exit.
#[derive(Debug, Clone, Copy)]
pub struct ExitSignal {
    pub status: i32,
}

static INSTALL: Once = Once::new();

/// Installs the process-wide exit policy hook. Idempotent.
pub fn install() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ExitSignal>().is_some() {
                return;
            }
            previous(info);
        }));
    });
}

/// Requests process termination with the given status. On a session-serving
/// thread this raises an [`ExitSignal`] instead; the worker association is
/// the stdio router's thread binding.
pub fn trigger(status: i32) -> ! {
    if stdio_router::is_bound() {
        panic::panic_any(ExitSignal { status });
    }
    std::process::exit(status);
}

/// How a guarded nail invocation ended.
#[derive(Debug)]
pub enum NailVerdict {
    /// Returned `Ok(())`.
    Clean,
    /// Raised an exit signal with this status.
    Exit(i32),
    /// Returned an error.
    Failed(String),
    /// Panicked with something other than an exit signal.
    Panicked(String),
}

/// Runs a nail inside the sentinel scope, catching exit signals, errors,
/// and panics. Nothing a nail does propagates past this boundary.
pub fn run_nail<F>(nail: F) -> NailVerdict
where
    F: FnOnce() -> NailResult,
{
    match panic::catch_unwind(AssertUnwindSafe(nail)) {
        Ok(Ok(())) => NailVerdict::Clean,
        Ok(Err(err)) => NailVerdict::Failed(err.to_string()),
        Err(payload) => match payload.downcast::<ExitSignal>() {
            Ok(signal) => NailVerdict::Exit(signal.status),
            Err(other) => NailVerdict::Panicked(panic_message(other.as_ref())),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
