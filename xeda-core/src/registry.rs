//! Process-wide, read-only-after-init map from snake_case flow name to its
//! constructor. Populated once by [`register_builtin_flows`]; real tool
//! wrappers live outside this crate and register themselves the same way.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::{Map, Value};

use crate::error::{Result, XedaError};
use crate::flow::Flow;

/// A flow's display name, one-line description, and constructor. Held
/// behind `Box<dyn Fn>` rather than `fn` so closures can capture static
/// configuration (e.g. a default strategy table) at registration time.
pub struct FlowDescriptor {
    pub display_name: &'static str,
    pub summary: &'static str,
    pub constructor: Box<dyn Fn(Map<String, Value>) -> Result<Box<dyn Flow>> + Send + Sync>,
}

impl std::fmt::Debug for FlowDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowDescriptor")
            .field("display_name", &self.display_name)
            .field("summary", &self.summary)
            .finish()
    }
}

type Registry = HashMap<&'static str, FlowDescriptor>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// A single flow registration, collected by `inventory`-free static
/// dispatch: each builtin flow module exposes a `register(&mut Registry)`
/// function invoked from [`register_builtin_flows`].
pub fn register_builtin_flows() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let mut registry = Registry::new();
        crate::flows::echo::register(&mut registry);
        crate::flows::sleepy::register(&mut registry);
        crate::flows::synthetic_synth::register(&mut registry);
        crate::flows::yosys_synth::register(&mut registry);
        crate::flows::openroad::register(&mut registry);
        registry
    })
}

/// Inserts `name -> descriptor`, panicking on a duplicate registration
/// (a programmer error: two flows claiming the same snake_case name).
pub fn register(registry: &mut Registry, name: &'static str, descriptor: FlowDescriptor) {
    if registry.insert(name, descriptor).is_some() {
        panic!("flow `{name}` registered twice");
    }
}

/// Looks up a flow constructor by snake_case name.
pub fn get_flow_class(name: &str) -> Result<&'static FlowDescriptor> {
    register_builtin_flows()
        .get(name)
        .ok_or_else(|| XedaError::FlowNotFound(name.to_string()))
}

/// All registered `(name, display_name, summary)` triples, for `list-flows`.
pub fn list_flows() -> Vec<(&'static str, &'static str, &'static str)> {
    let mut flows: Vec<_> = register_builtin_flows()
        .iter()
        .map(|(name, d)| (*name, d.display_name, d.summary))
        .collect();
    flows.sort_by_key(|(name, ..)| *name);
    flows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_flows_are_registered() {
        let names: Vec<_> = list_flows().into_iter().map(|(n, ..)| n).collect();
        assert!(names.contains(&"echo"));
    }

    #[test]
    fn unknown_flow_name_fails() {
        let err = get_flow_class("not_a_real_flow").unwrap_err();
        assert!(matches!(err, XedaError::FlowNotFound(_)));
    }
}
