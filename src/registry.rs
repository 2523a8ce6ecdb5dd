//! Command registry: nails and the aliases that name them.
//!
//! A nail is registered once under a qualified id and exposed to clients
//! through short aliases. The handler shape is fixed at registration time
//! as a tagged variant, so dispatch is a plain match.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::context::NailContext;

/// What a nail invocation returns. Exit-with-status is expressed through
/// [`crate::exit_sentinel::trigger`] / [`NailContext::exit`], not the error.
pub type NailResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A registered command implementation.
///
/// Static nails mirror a plain `main(args)` entry point and use the routed
/// process streams; contextual nails receive the full session context.
#[derive(Clone)]
pub enum Nail {
    Static(fn(&[String]) -> NailResult),
    Contextual(Arc<dyn Fn(&mut NailContext) -> NailResult + Send + Sync>),
}

impl Nail {
    pub fn contextual<F>(nail: F) -> Self
    where
        F: Fn(&mut NailContext) -> NailResult + Send + Sync + 'static,
    {
        Nail::Contextual(Arc::new(nail))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Nail::Static(_) => "static",
            Nail::Contextual(_) => "contextual",
        }
    }
}

#[derive(Default)]
struct RegistryState {
    nails: HashMap<String, Nail>,
    aliases: HashMap<String, String>,
}

/// Read-mostly and internally synchronised; shared by every worker.
#[derive(Default)]
pub struct NailRegistry {
    state: RwLock<RegistryState>,
}

impl NailRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a nail under its qualified id.
    pub fn register(&self, id: impl Into<String>, nail: Nail) {
        let mut state = self.state.write().unwrap();
        state.nails.insert(id.into(), nail);
    }

    /// Points an alias at a qualified nail id. Last registration wins.
    pub fn add_alias(&self, alias: impl Into<String>, id: impl Into<String>) {
        let mut state = self.state.write().unwrap();
        state.aliases.insert(alias.into(), id.into());
    }

    pub fn remove_alias(&self, alias: &str) {
        let mut state = self.state.write().unwrap();
        state.aliases.remove(alias);
    }

    /// Registers a nail and an alias of the same name in one step.
    pub fn register_aliased(&self, name: impl Into<String>, nail: Nail) {
        let name = name.into();
        self.register(name.clone(), nail);
        self.add_alias(name.clone(), name);
    }

    pub fn resolve_alias(&self, alias: &str) -> Option<String> {
        let state = self.state.read().unwrap();
        state.aliases.get(alias).cloned()
    }

    /// Looks a nail up by qualified id.
    pub fn nail(&self, id: &str) -> Option<Nail> {
        let state = self.state.read().unwrap();
        state.nails.get(id).cloned()
    }

    /// Alias table sorted by alias, for introspection nails.
    pub fn aliases(&self) -> Vec<(String, String)> {
        let state = self.state.read().unwrap();
        let mut entries: Vec<(String, String)> = state
            .aliases
            .iter()
            .map(|(alias, id)| (alias.clone(), id.clone()))
            .collect();
        entries.sort();
        entries
    }
}
