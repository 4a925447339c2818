//! Ownership tree for signalbox.
//!
//! Provides the lifecycle model shared by timers and connections:
//! - Stable node identifiers via arena-based storage
//! - Parent-child ownership with cascading destruction
//! - Two-phase deferred deletion (mark with [`ObjectTree::delete_later`],
//!   sweep with [`ObjectTree::process_deferred_deletions`])
//! - Cleanup hooks that release a node's resources before it is removed
//!
//! A node never owns memory belonging to its children; ownership here only
//! decides who triggers destruction. Timers and connections attach cleanup
//! hooks to the node that roots their lifecycle.

use std::collections::HashSet;
use std::fmt;

use slotmap::{SlotMap, new_key_type};

use crate::error::{Error, Result};

new_key_type! {
    /// A unique identifier for a node in an [`ObjectTree`].
    ///
    /// `NodeId`s are stable handles that remain valid while the tree changes
    /// shape. They become invalid when the node is destroyed.
    pub struct NodeId;
}

/// A hook run when its node is destroyed.
pub type CleanupHook = Box<dyn FnOnce(NodeId) + Send>;

/// Internal data stored for each node.
struct NodeData {
    /// Human-readable name for debugging and lookup.
    name: String,
    parent: Option<NodeId>,
    /// Children in insertion order.
    children: Vec<NodeId>,
    /// Marked by `delete_later`, destroyed by the next sweep.
    pending_deletion: bool,
    cleanup: Vec<CleanupHook>,
}

impl NodeData {
    fn new(name: String) -> Self {
        Self {
            name,
            parent: None,
            children: Vec::new(),
            pending_deletion: false,
            cleanup: Vec::new(),
        }
    }
}

/// Nodes taken out of the tree by one sweep step, with their hooks.
pub(crate) struct SweepBatch {
    /// Nodes in destruction order (children before parents).
    pub order: Vec<NodeId>,
    pub hooks: Vec<(NodeId, Vec<CleanupHook>)>,
}

/// Arena of ownership nodes.
pub struct ObjectTree {
    nodes: SlotMap<NodeId, NodeData>,
    /// Nodes passed to (or marked by) `delete_later`, in marking order.
    pending: Vec<NodeId>,
}

impl ObjectTree {
    /// Create a new empty tree.
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            pending: Vec::new(),
        }
    }

    /// Create a root node.
    pub fn create_node(&mut self, name: impl Into<String>) -> NodeId {
        let id = self.nodes.insert(NodeData::new(name.into()));
        tracing::trace!(target: "signalbox_core::object", ?id, "created node");
        id
    }

    /// Create a node as the last child of `parent`.
    pub fn create_child(&mut self, parent: NodeId, name: impl Into<String>) -> Result<NodeId> {
        if !self.nodes.contains_key(parent) {
            return Err(Error::InvalidNode);
        }
        let id = self.create_node(name);
        self.set_parent(id, Some(parent))?;
        Ok(id)
    }

    /// Check if a node exists.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Set the parent of a node.
    ///
    /// Removes the node from its old parent and appends it to the new one.
    /// Passing `None` makes it a root. Fails with [`Error::CycleDetected`]
    /// if `new_parent` is the node itself or one of its descendants; the tree
    /// is left unchanged on error.
    pub fn set_parent(&mut self, id: NodeId, new_parent: Option<NodeId>) -> Result<()> {
        if !self.nodes.contains_key(id) {
            return Err(Error::InvalidNode);
        }

        if let Some(parent_id) = new_parent {
            if !self.nodes.contains_key(parent_id) {
                return Err(Error::InvalidNode);
            }
            if self.is_ancestor_of(id, parent_id) {
                return Err(Error::CycleDetected);
            }
        }

        let old_parent = self.nodes.get(id).and_then(|d| d.parent);
        if let Some(old_parent_id) = old_parent {
            if let Some(parent_data) = self.nodes.get_mut(old_parent_id) {
                parent_data.children.retain(|&child| child != id);
            }
        }

        if let Some(data) = self.nodes.get_mut(id) {
            data.parent = new_parent;
        }

        if let Some(parent_id) = new_parent {
            if let Some(parent_data) = self.nodes.get_mut(parent_id) {
                parent_data.children.push(id);
            }
        }

        Ok(())
    }

    /// Check if `potential_ancestor` is `id` or one of its ancestors.
    fn is_ancestor_of(&self, potential_ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(current_id) = current {
            if current_id == potential_ancestor {
                return true;
            }
            current = self.nodes.get(current_id).and_then(|d| d.parent);
        }
        false
    }

    /// Get the parent of a node.
    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>> {
        self.nodes
            .get(id)
            .map(|d| d.parent)
            .ok_or(Error::InvalidNode)
    }

    /// Get the children of a node.
    pub fn children(&self, id: NodeId) -> Result<&[NodeId]> {
        self.nodes
            .get(id)
            .map(|d| d.children.as_slice())
            .ok_or(Error::InvalidNode)
    }

    /// Get the node's name.
    pub fn node_name(&self, id: NodeId) -> Result<&str> {
        self.nodes
            .get(id)
            .map(|d| d.name.as_str())
            .ok_or(Error::InvalidNode)
    }

    /// Find a direct child by name.
    pub fn find_child_by_name(&self, id: NodeId, name: &str) -> Result<Option<NodeId>> {
        let children = self.children(id)?;
        Ok(children
            .iter()
            .copied()
            .find(|&child| self.nodes.get(child).is_some_and(|d| d.name == name)))
    }

    /// Register a hook to run when the node is destroyed.
    ///
    /// Hooks run in registration order, after the hooks of the node's
    /// descendants.
    pub fn add_cleanup(&mut self, id: NodeId, hook: CleanupHook) -> Result<()> {
        let data = self.nodes.get_mut(id).ok_or(Error::InvalidNode)?;
        data.cleanup.push(hook);
        Ok(())
    }

    /// Get the number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Iterate over all root nodes (nodes with no parent).
    pub fn root_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .filter(|(_, data)| data.parent.is_none())
            .map(|(id, _)| id)
    }

    // =========================================================================
    // Deferred deletion
    // =========================================================================

    /// Mark a node and all of its current descendants for destruction.
    ///
    /// Nothing is destroyed until the next sweep. Marking an already marked
    /// node is a no-op.
    #[tracing::instrument(skip(self), target = "signalbox_core::object", level = "trace")]
    pub fn delete_later(&mut self, id: NodeId) -> Result<()> {
        let subtree = self.depth_first_preorder(id)?;
        for node in subtree {
            if let Some(data) = self.nodes.get_mut(node) {
                if !data.pending_deletion {
                    data.pending_deletion = true;
                    self.pending.push(node);
                }
            }
        }
        Ok(())
    }

    /// Whether the node is marked for destruction.
    pub fn is_pending_deletion(&self, id: NodeId) -> bool {
        self.nodes.get(id).is_some_and(|d| d.pending_deletion)
    }

    /// Number of nodes currently marked for destruction.
    pub fn pending_deletion_count(&self) -> usize {
        self.nodes.values().filter(|d| d.pending_deletion).count()
    }

    /// Destroy every marked node now, running cleanup hooks inline.
    ///
    /// Returns the destroyed nodes in destruction order. Use this on a
    /// standalone tree; an event loop sweeps its own tree with hooks run
    /// outside its lock.
    pub fn process_deferred_deletions(&mut self) -> Vec<NodeId> {
        let mut destroyed = Vec::new();
        loop {
            let batch = self.begin_sweep();
            if batch.order.is_empty() {
                break;
            }
            for (id, hooks) in batch.hooks {
                for hook in hooks {
                    hook(id);
                }
            }
            self.finish_sweep(&batch.order);
            destroyed.extend(batch.order);
        }
        destroyed
    }

    /// First sweep phase: pick the marked subtrees and take their hooks.
    ///
    /// Nodes stay in the tree until [`finish_sweep`](Self::finish_sweep), so
    /// hooks may still inspect them.
    pub(crate) fn begin_sweep(&mut self) -> SweepBatch {
        let pending = std::mem::take(&mut self.pending);
        let mut order = Vec::new();
        let mut seen = HashSet::new();

        for id in pending {
            if !self.is_pending_deletion(id) || self.has_marked_ancestor(id) {
                continue;
            }
            if let Ok(subtree) = self.depth_first_postorder(id) {
                for node in subtree {
                    if seen.insert(node) {
                        order.push(node);
                    }
                }
            }
        }

        let hooks = order
            .iter()
            .filter_map(|&id| {
                let data = self.nodes.get_mut(id)?;
                data.pending_deletion = true;
                Some((id, std::mem::take(&mut data.cleanup)))
            })
            .collect();

        SweepBatch { order, hooks }
    }

    /// Second sweep phase: remove the nodes of a batch.
    ///
    /// Children attached to a dying node after the batch was taken are
    /// marked so that the next sweep step destroys them too.
    pub(crate) fn finish_sweep(&mut self, order: &[NodeId]) {
        for &id in order {
            let Some(data) = self.nodes.remove(id) else {
                continue;
            };
            if let Some(parent_id) = data.parent {
                if let Some(parent_data) = self.nodes.get_mut(parent_id) {
                    parent_data.children.retain(|&child| child != id);
                }
            }
            for child in data.children {
                if let Some(child_data) = self.nodes.get_mut(child) {
                    child_data.parent = None;
                    child_data.pending_deletion = true;
                    self.pending.push(child);
                }
            }
            tracing::trace!(target: "signalbox_core::object", ?id, "destroyed node");
        }
    }

    fn has_marked_ancestor(&self, id: NodeId) -> bool {
        let mut current = self.nodes.get(id).and_then(|d| d.parent);
        while let Some(ancestor) = current {
            match self.nodes.get(ancestor) {
                Some(data) if data.pending_deletion => return true,
                Some(data) => current = data.parent,
                None => break,
            }
        }
        false
    }

    // =========================================================================
    // Tree Traversal
    // =========================================================================

    /// Get all ancestors of a node from immediate parent to root.
    pub fn ancestors(&self, id: NodeId) -> Result<Vec<NodeId>> {
        if !self.nodes.contains_key(id) {
            return Err(Error::InvalidNode);
        }

        let mut result = Vec::new();
        let mut current = self.nodes.get(id).and_then(|d| d.parent);
        while let Some(current_id) = current {
            result.push(current_id);
            current = self.nodes.get(current_id).and_then(|d| d.parent);
        }
        Ok(result)
    }

    /// Depth-first pre-order traversal: the node, then its children recursively.
    pub fn depth_first_preorder(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut result = Vec::new();
        self.depth_first_preorder_recursive(id, &mut result)?;
        Ok(result)
    }

    fn depth_first_preorder_recursive(&self, id: NodeId, result: &mut Vec<NodeId>) -> Result<()> {
        let data = self.nodes.get(id).ok_or(Error::InvalidNode)?;
        result.push(id);
        for &child_id in &data.children {
            self.depth_first_preorder_recursive(child_id, result)?;
        }
        Ok(())
    }

    /// Depth-first post-order traversal: children recursively, then the node.
    pub fn depth_first_postorder(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut result = Vec::new();
        self.depth_first_postorder_recursive(id, &mut result)?;
        Ok(result)
    }

    fn depth_first_postorder_recursive(&self, id: NodeId, result: &mut Vec<NodeId>) -> Result<()> {
        let data = self.nodes.get(id).ok_or(Error::InvalidNode)?;
        for &child_id in &data.children {
            self.depth_first_postorder_recursive(child_id, result)?;
        }
        result.push(id);
        Ok(())
    }

    // =========================================================================
    // Debug / Diagnostics
    // =========================================================================

    /// Debug dump of the subtree rooted at `id`.
    pub fn dump_tree(&self, id: NodeId) -> Result<String> {
        let mut output = String::new();
        self.dump_tree_recursive(id, 0, &mut output)?;
        Ok(output)
    }

    fn dump_tree_recursive(&self, id: NodeId, depth: usize, output: &mut String) -> Result<()> {
        use fmt::Write;

        let data = self.nodes.get(id).ok_or(Error::InvalidNode)?;
        let name = if data.name.is_empty() {
            "(unnamed)"
        } else {
            &data.name
        };
        let marker = if data.pending_deletion {
            " [deleteLater]"
        } else {
            ""
        };
        let _ = writeln!(output, "{}[{:?}] {}{}", "  ".repeat(depth), id, name, marker);
        for &child_id in &data.children {
            self.dump_tree_recursive(child_id, depth + 1, output)?;
        }
        Ok(())
    }
}

impl Default for ObjectTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectTree")
            .field("nodes", &self.nodes.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_parent_child() {
        let mut tree = ObjectTree::new();
        let parent = tree.create_node("parent");
        let child = tree.create_child(parent, "child").unwrap();

        assert_eq!(tree.parent(child).unwrap(), Some(parent));
        assert_eq!(tree.children(parent).unwrap(), &[child]);
        assert_eq!(tree.find_child_by_name(parent, "child").unwrap(), Some(child));
        assert_eq!(tree.find_child_by_name(parent, "missing").unwrap(), None);
    }

    #[test]
    fn test_reparenting() {
        let mut tree = ObjectTree::new();
        let parent1 = tree.create_node("p1");
        let parent2 = tree.create_node("p2");
        let child = tree.create_child(parent1, "mobile").unwrap();

        tree.set_parent(child, Some(parent2)).unwrap();

        assert!(tree.children(parent1).unwrap().is_empty());
        assert_eq!(tree.children(parent2).unwrap(), &[child]);
        assert_eq!(tree.parent(child).unwrap(), Some(parent2));

        tree.set_parent(child, None).unwrap();
        assert_eq!(tree.parent(child).unwrap(), None);
        assert_eq!(tree.root_nodes().count(), 3);
    }

    #[test]
    fn test_cycle_rejected_and_tree_unchanged() {
        let mut tree = ObjectTree::new();
        let a = tree.create_node("a");
        let b = tree.create_child(a, "b").unwrap();
        let c = tree.create_child(b, "c").unwrap();

        assert!(matches!(tree.set_parent(a, Some(c)), Err(Error::CycleDetected)));
        assert!(matches!(tree.set_parent(a, Some(a)), Err(Error::CycleDetected)));

        assert_eq!(tree.parent(a).unwrap(), None);
        assert_eq!(tree.children(a).unwrap(), &[b]);
        assert_eq!(tree.children(b).unwrap(), &[c]);
    }

    #[test]
    fn test_invalid_node() {
        let mut tree = ObjectTree::new();
        let a = tree.create_node("a");
        tree.delete_later(a).unwrap();
        tree.process_deferred_deletions();

        assert!(matches!(tree.parent(a), Err(Error::InvalidNode)));
        assert!(matches!(tree.delete_later(a), Err(Error::InvalidNode)));
        assert!(matches!(tree.create_child(a, "x"), Err(Error::InvalidNode)));
    }

    #[test]
    fn test_delete_later_is_deferred() {
        let mut tree = ObjectTree::new();
        let parent = tree.create_node("parent");
        let child = tree.create_child(parent, "child").unwrap();

        tree.delete_later(parent).unwrap();

        assert!(tree.contains(parent));
        assert!(tree.contains(child));
        assert!(tree.is_pending_deletion(parent));
        assert!(tree.is_pending_deletion(child));
        assert_eq!(tree.pending_deletion_count(), 2);
    }

    #[test]
    fn test_cascade_destroys_children_first() {
        let mut tree = ObjectTree::new();
        let parent = tree.create_node("parent");
        let child1 = tree.create_child(parent, "child1").unwrap();
        let child2 = tree.create_child(parent, "child2").unwrap();
        let grandchild = tree.create_child(child1, "grandchild").unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for id in [parent, child1, child2, grandchild] {
            let order = order.clone();
            tree.add_cleanup(id, Box::new(move |node| order.lock().push(node)))
                .unwrap();
        }

        tree.delete_later(parent).unwrap();
        let destroyed = tree.process_deferred_deletions();

        assert_eq!(destroyed, vec![grandchild, child1, child2, parent]);
        assert_eq!(*order.lock(), destroyed);
        for id in [parent, child1, child2, grandchild] {
            assert!(!tree.contains(id));
        }
        assert_eq!(tree.node_count(), 0);
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let mut tree = ObjectTree::new();
        let keep = tree.create_node("keep");
        let doomed = tree.create_child(keep, "doomed").unwrap();

        tree.delete_later(doomed).unwrap();
        assert_eq!(tree.process_deferred_deletions(), vec![doomed]);
        assert!(tree.process_deferred_deletions().is_empty());

        assert!(tree.contains(keep));
        assert!(tree.children(keep).unwrap().is_empty());
    }

    #[test]
    fn test_child_added_after_mark_is_destroyed() {
        let mut tree = ObjectTree::new();
        let parent = tree.create_node("parent");
        tree.delete_later(parent).unwrap();

        let late = tree.create_child(parent, "late").unwrap();
        tree.process_deferred_deletions();

        assert!(!tree.contains(parent));
        assert!(!tree.contains(late));
    }

    #[test]
    fn test_child_created_by_hook_is_destroyed() {
        let tree = Arc::new(Mutex::new(ObjectTree::new()));
        let parent = tree.lock().create_node("parent");

        // Run the two sweep phases by hand, attaching a child in between.
        let batch = tree.lock().begin_sweep();
        assert!(batch.order.is_empty());

        tree.lock().delete_later(parent).unwrap();
        let batch = tree.lock().begin_sweep();
        let stray = tree.lock().create_child(parent, "stray").unwrap();
        tree.lock().finish_sweep(&batch.order);

        assert!(!tree.lock().contains(parent));
        assert!(tree.lock().is_pending_deletion(stray));

        let destroyed = tree.lock().process_deferred_deletions();
        assert_eq!(destroyed, vec![stray]);
    }

    #[test]
    fn test_traversal_orders() {
        let mut tree = ObjectTree::new();
        let root = tree.create_node("root");
        let a = tree.create_child(root, "a").unwrap();
        let a1 = tree.create_child(a, "a1").unwrap();
        let b = tree.create_child(root, "b").unwrap();

        assert_eq!(tree.depth_first_preorder(root).unwrap(), vec![root, a, a1, b]);
        assert_eq!(tree.depth_first_postorder(root).unwrap(), vec![a1, a, b, root]);
        assert_eq!(tree.ancestors(a1).unwrap(), vec![a, root]);
    }

    #[test]
    fn test_dump_tree() {
        let mut tree = ObjectTree::new();
        let root = tree.create_node("root");
        let child = tree.create_child(root, "").unwrap();
        tree.delete_later(child).unwrap();

        let dump = tree.dump_tree(root).unwrap();
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("root"));
        assert!(lines[1].starts_with("  ["));
        assert!(lines[1].ends_with("(unnamed) [deleteLater]"));
    }
}
