//! Nails every server ships with.

use std::io::Write;

use crate::context::NailContext;
use crate::protocol::EXIT_NO_SUCH_COMMAND;
use crate::registry::{Nail, NailRegistry, NailResult};
use crate::stdio_router;

pub const VERSION_NAIL_ID: &str = "nailgund.builtins.Version";
pub const ALIAS_NAIL_ID: &str = "nailgund.builtins.Alias";
pub const STOP_NAIL_ID: &str = "nailgund.builtins.Stop";
pub const DEFAULT_NAIL_ID: &str = "nailgund.builtins.Default";

/// Static shape: reads nothing, writes through the routed process streams.
fn version_nail(_args: &[String]) -> NailResult {
    let mut out = stdio_router::stdout();
    writeln!(out, "nailgund version {}", env!("CARGO_PKG_VERSION"))?;
    out.flush()?;
    Ok(())
}

fn alias_nail(ctx: &mut NailContext) -> NailResult {
    let mut out = ctx.stdout();
    let aliases = ctx.server().registry().aliases();
    if aliases.is_empty() {
        writeln!(out, "no aliases registered")?;
    }
    for (alias, id) in aliases {
        writeln!(out, "{alias}\t{id}")?;
    }
    out.flush()?;
    Ok(())
}

fn stop_nail(ctx: &mut NailContext) -> NailResult {
    let mut err = ctx.stderr();
    writeln!(err, "shutting down")?;
    err.flush()?;
    ctx.server().shutdown();
    Ok(())
}

/// Serves commands nothing else resolved.
fn default_nail(ctx: &mut NailContext) -> NailResult {
    let mut err = ctx.stderr();
    writeln!(err, "unknown command: {}", ctx.command())?;
    err.flush()?;
    ctx.exit(EXIT_NO_SUCH_COMMAND)
}

pub(crate) fn register(registry: &NailRegistry) {
    registry.register(VERSION_NAIL_ID, Nail::Static(version_nail));
    registry.add_alias("ng-version", VERSION_NAIL_ID);
    registry.register(ALIAS_NAIL_ID, Nail::contextual(alias_nail));
    registry.add_alias("ng-alias", ALIAS_NAIL_ID);
    registry.register(STOP_NAIL_ID, Nail::contextual(stop_nail));
    registry.add_alias("ng-stop", STOP_NAIL_ID);
    registry.register(DEFAULT_NAIL_ID, Nail::contextual(default_nail));
}
