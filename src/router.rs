//! Per-instance control routing
//!
//! A typed routing table keyed by `(instance id, operation)` replaces the
//! old string-concatenated channel names. Routes are registered when an
//! instance is created and deregistered in lockstep with its destruction,
//! so a control message can never reach a ghost handler or the wrong
//! instance.

use std::collections::HashSet;

use crate::error::{Error, Result};

/// Control operations addressable per instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOp {
    SwitchTab,
    Refresh,
}

impl ControlOp {
    pub fn name(self) -> &'static str {
        match self {
            ControlOp::SwitchTab => "switch-tab",
            ControlOp::Refresh => "refresh",
        }
    }
}

/// Registered control routes for all live instances
#[derive(Debug, Default)]
pub struct Router {
    routes: HashSet<(String, ControlOp)>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register both control routes for an instance
    pub fn register_instance(&mut self, instance_id: &str) {
        for op in [ControlOp::SwitchTab, ControlOp::Refresh] {
            self.routes.insert((instance_id.to_string(), op));
        }
        tracing::debug!(instance_id, "control routes registered");
    }

    /// Drop every route belonging to an instance
    pub fn deregister_instance(&mut self, instance_id: &str) {
        self.routes.retain(|(id, _)| id != instance_id);
        tracing::debug!(instance_id, "control routes deregistered");
    }

    /// Resolve a route, failing for unknown (instance, operation) pairs
    pub fn resolve(&self, instance_id: &str, op: ControlOp) -> Result<()> {
        if self.routes.contains(&(instance_id.to_string(), op)) {
            Ok(())
        } else {
            Err(Error::RouteNotFound {
                instance_id: instance_id.to_string(),
                operation: op.name(),
            })
        }
    }

    /// Number of registered routes (all instances)
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_resolve_deregister() {
        let mut router = Router::new();
        router.register_instance("a");

        assert!(router.resolve("a", ControlOp::SwitchTab).is_ok());
        assert!(router.resolve("a", ControlOp::Refresh).is_ok());
        assert!(router.resolve("b", ControlOp::SwitchTab).is_err());

        router.deregister_instance("a");
        assert!(router.resolve("a", ControlOp::SwitchTab).is_err());
        assert!(router.is_empty());
    }

    #[test]
    fn deregister_leaves_other_instances_untouched() {
        let mut router = Router::new();
        router.register_instance("a");
        router.register_instance("b");

        router.deregister_instance("a");
        assert!(router.resolve("b", ControlOp::Refresh).is_ok());
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn reregistering_same_id_leaves_no_ghosts() {
        let mut router = Router::new();
        for _ in 0..3 {
            router.register_instance("cycled");
            router.deregister_instance("cycled");
        }
        assert!(router.is_empty());

        router.register_instance("cycled");
        assert_eq!(router.len(), 2);
        assert!(router.resolve("cycled", ControlOp::SwitchTab).is_ok());
    }
}
