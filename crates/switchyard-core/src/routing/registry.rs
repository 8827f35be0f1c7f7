//! Registry of backend nodes the router may target.
//!
//! Nodes are registered and deregistered externally (config file, provider
//! settings) while runs are in flight. Registration order is kept and used
//! as the router's final tie-break.

use std::sync::RwLock;

use switchyard_types::node::ModelNode;

/// Ordered, thread-safe set of registered `ModelNode`s.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<Vec<ModelNode>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Re-registering an existing ID replaces it in place.
    ///
    /// Returns `true` if an existing node was replaced.
    pub fn register(&self, node: ModelNode) -> bool {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = nodes.iter_mut().find(|n| n.node_id == node.node_id) {
            *existing = node;
            true
        } else {
            nodes.push(node);
            false
        }
    }

    /// Remove a node, returning it if it was registered.
    pub fn deregister(&self, node_id: &str) -> Option<ModelNode> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let index = nodes.iter().position(|n| n.node_id == node_id)?;
        Some(nodes.remove(index))
    }

    pub fn get(&self, node_id: &str) -> Option<ModelNode> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|n| n.node_id == node_id)
            .cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.get(node_id).is_some()
    }

    /// All nodes in registration order.
    pub fn list(&self) -> Vec<ModelNode> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> ModelNode {
        ModelNode::new(id, format!("bridge://{id}"), vec!["chat".to_string()])
    }

    #[test]
    fn register_keeps_order() {
        let registry = NodeRegistry::new();
        registry.register(node("b"));
        registry.register(node("a"));
        let ids: Vec<_> = registry.list().into_iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn reregister_replaces_in_place() {
        let registry = NodeRegistry::new();
        registry.register(node("a"));
        registry.register(node("b"));

        let mut updated = node("a");
        updated.endpoint_ref = "bridge://new".to_string();
        assert!(registry.register(updated));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list()[0].endpoint_ref, "bridge://new");
    }

    #[test]
    fn deregister_removes_node() {
        let registry = NodeRegistry::new();
        registry.register(node("a"));
        assert!(registry.deregister("a").is_some());
        assert!(registry.deregister("a").is_none());
        assert!(!registry.contains("a"));
        assert!(registry.is_empty());
    }
}
