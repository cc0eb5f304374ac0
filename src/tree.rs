//! Tiling tree for laying out client windows inside a frame.
//!
//! The tree is binary: a Full node displays exactly one window, a Split node
//! divides its rectangle between exactly two children along one axis. Space
//! is shared evenly - each split halves the parent rectangle, with the second
//! child absorbing the odd pixel.

use slotmap::{new_key_type, SlotMap};
use thiserror::Error;
use x11rb::protocol::xproto::Window;

new_key_type! {
    /// Unique, generation-checked identifier for a container in the tree
    pub struct NodeId;
}

/// How a container uses its rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    /// Split across the X axis: children stacked top/bottom, height halved
    Horizontal,
    /// Split across the Y axis: children side by side, width halved
    Vertical,
    /// The container spans its whole rectangle with a single window
    Full,
}

/// A rectangle in frame-interior coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

/// A container: either one displayed window (Full) or a two-way split
#[derive(Debug, Clone)]
pub struct Container {
    pub mode: SplitMode,
    pub rect: Rect,
    /// Directly displayed window; meaningful only when `mode` is Full
    pub window: Option<Window>,
    /// Both children, or none. A single child is unrepresentable.
    pub children: Option<(NodeId, NodeId)>,
    /// Non-owning back-reference; `None` only at the root
    pub parent: Option<NodeId>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("cannot insert into split container {0:?}")]
    InsertIntoSplit(NodeId),
    #[error("container {0:?} is not in this tree")]
    UnknownContainer(NodeId),
}

/// Binary container tree owning all nodes in a slotmap arena.
///
/// Every structural mutation recomputes geometry for the affected subtree,
/// so leaf rectangles can be applied to the server immediately afterwards.
#[derive(Debug)]
pub struct TilingTree {
    nodes: SlotMap<NodeId, Container>,
    root: NodeId,
}

impl TilingTree {
    /// Create a tree with a single Full root holding `window`, sized `rect`.
    pub fn new(window: Window, rect: Rect) -> Self {
        let mut nodes = SlotMap::with_key();
        let root = nodes.insert(Container {
            mode: SplitMode::Full,
            rect,
            window: Some(window),
            children: None,
            parent: None,
        });
        Self { nodes, root }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&Container> {
        self.nodes.get(id)
    }

    /// A tree is empty once its last window has been removed: a lone Full
    /// root with no window assigned. The owning frame must then be destroyed.
    pub fn is_empty(&self) -> bool {
        match self.nodes.get(self.root) {
            Some(c) => c.children.is_none() && c.window.is_none(),
            None => true,
        }
    }

    /// Number of windows held by Full leaves
    pub fn len(&self) -> usize {
        self.nodes.values().filter(|c| c.window.is_some()).count()
    }

    /// All windows, in-order
    pub fn windows(&self) -> Vec<Window> {
        let mut out = Vec::new();
        self.collect_windows(self.root, &mut out);
        out
    }

    fn collect_windows(&self, id: NodeId, out: &mut Vec<Window>) {
        let Some(node) = self.nodes.get(id) else { return };
        if let Some(w) = node.window {
            out.push(w);
        }
        if let Some((first, second)) = node.children {
            self.collect_windows(first, out);
            self.collect_windows(second, out);
        }
    }

    /// (window, rectangle) for every Full leaf, in-order. This is what gets
    /// applied back to the server after a recompute.
    pub fn leaf_geometries(&self) -> Vec<(Window, Rect)> {
        let mut out = Vec::new();
        self.collect_leaves(self.root, &mut out);
        out
    }

    fn collect_leaves(&self, id: NodeId, out: &mut Vec<(Window, Rect)>) {
        let Some(node) = self.nodes.get(id) else { return };
        if let Some(w) = node.window {
            out.push((w, node.rect));
        }
        if let Some((first, second)) = node.children {
            self.collect_leaves(first, out);
            self.collect_leaves(second, out);
        }
    }

    /// Depth-first search for the Full leaf displaying `window`
    pub fn find_leaf(&self, window: Window) -> Option<NodeId> {
        self.find_in(self.root, window)
    }

    fn find_in(&self, id: NodeId, window: Window) -> Option<NodeId> {
        let node = self.nodes.get(id)?;
        if node.window == Some(window) {
            return Some(id);
        }
        let (first, second) = node.children?;
        self.find_in(first, window).or_else(|| self.find_in(second, window))
    }

    /// Split the Full leaf `target` to make room for `window`.
    ///
    /// The target becomes a Horizontal split whose first child is a new Full
    /// leaf holding the target's old window and whose second child is a new
    /// Full leaf holding `window`. Returns the new window's leaf.
    pub fn insert(&mut self, target: NodeId, window: Window) -> Result<NodeId, TreeError> {
        let node = self
            .nodes
            .get_mut(target)
            .ok_or(TreeError::UnknownContainer(target))?;
        if node.children.is_some() {
            return Err(TreeError::InsertIntoSplit(target));
        }

        // Re-occupy the transient window-less root left by a final removal.
        let Some(old_window) = node.window.take() else {
            node.window = Some(window);
            return Ok(target);
        };

        let rect = node.rect;
        let first = self.nodes.insert(Container {
            mode: SplitMode::Full,
            rect: Rect::default(),
            window: Some(old_window),
            children: None,
            parent: Some(target),
        });
        let second = self.nodes.insert(Container {
            mode: SplitMode::Full,
            rect: Rect::default(),
            window: Some(window),
            children: None,
            parent: Some(target),
        });

        let node = &mut self.nodes[target];
        node.mode = SplitMode::Horizontal;
        node.children = Some((first, second));
        self.recompute_geometry(target, rect);

        Ok(second)
    }

    /// Remove the leaf displaying `window`, promoting its sibling into the
    /// grandparent slot. Returns whether a leaf was found; a failed search is
    /// not an error.
    pub fn remove_window(&mut self, window: Window) -> bool {
        let Some(leaf) = self.find_leaf(window) else {
            return false;
        };
        if leaf == self.root {
            // No sibling to promote in a 1-node tree; leave the empty Full
            // root for the caller to act on.
            self.nodes[leaf].window = None;
            return true;
        }
        self.remove_container(leaf)
    }

    /// Remove the whole subtree under `node` and promote its sibling.
    pub fn remove_container(&mut self, node: NodeId) -> bool {
        if !self.nodes.contains_key(node) {
            return false;
        }
        if node == self.root {
            // Tearing down the entire tree: collapse to an empty Full root.
            if let Some((first, second)) = self.nodes[node].children.take() {
                self.delete_subtree(first);
                self.delete_subtree(second);
            }
            let root = &mut self.nodes[node];
            root.mode = SplitMode::Full;
            root.window = None;
            return true;
        }

        // Non-root nodes always have a Split parent with two children.
        let Some(parent) = self.nodes[node].parent else {
            return false;
        };
        let Some((first, second)) = self.nodes[parent].children else {
            return false;
        };
        let sibling = if first == node { second } else { first };
        let grandparent = self.nodes[parent].parent;
        let parent_rect = self.nodes[parent].rect;

        match grandparent {
            Some(gp) => {
                // A grandparent of a live node is always a split; bail out
                // untouched if the arena says otherwise.
                let Some((gfirst, gsecond)) = self.nodes[gp].children else {
                    return false;
                };
                self.nodes[gp].children = Some(if gfirst == parent {
                    (sibling, gsecond)
                } else {
                    (gfirst, sibling)
                });
                self.nodes[sibling].parent = Some(gp);
            }
            None => {
                self.root = sibling;
                self.nodes[sibling].parent = None;
            }
        }

        self.delete_subtree(node);
        self.nodes.remove(parent);
        self.recompute_geometry(sibling, parent_rect);
        true
    }

    fn delete_subtree(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(id) {
            if let Some((first, second)) = node.children {
                self.delete_subtree(first);
                self.delete_subtree(second);
            }
        }
    }

    /// Assign `rect` to `node` and re-partition its subtree. The second child
    /// absorbs the odd pixel so children always cover the parent exactly.
    pub fn recompute_geometry(&mut self, node: NodeId, rect: Rect) {
        let Some(container) = self.nodes.get_mut(node) else {
            return;
        };
        container.rect = rect;
        let Some((first, second)) = container.children else {
            return;
        };
        let (first_rect, second_rect) = match container.mode {
            SplitMode::Horizontal => {
                let half = rect.height / 2;
                (
                    Rect::new(rect.x, rect.y, rect.width, half),
                    Rect::new(rect.x, rect.y + half as i32, rect.width, rect.height - half),
                )
            }
            SplitMode::Vertical => {
                let half = rect.width / 2;
                (
                    Rect::new(rect.x, rect.y, half, rect.height),
                    Rect::new(rect.x + half as i32, rect.y, rect.width - half, rect.height),
                )
            }
            // A Full node never has children; nothing to partition.
            SplitMode::Full => return,
        };
        self.recompute_geometry(first, first_rect);
        self.recompute_geometry(second, second_rect);
    }

    /// Change a container's split mode, re-partitioning its subtree.
    ///
    /// Returns whether the tree changed. Switching a node with two children
    /// to Full is rejected: Full and "has children" are mutually exclusive.
    pub fn set_split_mode(&mut self, node: NodeId, mode: SplitMode) -> bool {
        let Some(container) = self.nodes.get(node) else {
            return false;
        };
        if container.mode == mode {
            return false;
        }
        if mode == SplitMode::Full && container.children.is_some() {
            return false;
        }
        let rect = container.rect;
        self.nodes[node].mode = mode;
        self.recompute_geometry(node, rect);
        true
    }

    /// Sweep the tree for shape and geometry violations. Used by tests and
    /// by the invariant-breach diagnostics; an intact tree yields no entries.
    pub fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();
        if !self.nodes.contains_key(self.root) {
            violations.push("root handle is dangling".into());
            return violations;
        }
        if self.nodes[self.root].parent.is_some() {
            violations.push("root has a parent back-reference".into());
        }
        for (id, node) in &self.nodes {
            match (node.window, node.children) {
                (Some(_), Some(_)) => {
                    violations.push(format!("{id:?} holds a window and children"));
                }
                (None, None) if id != self.root => {
                    violations.push(format!("{id:?} is neither Full nor Split"));
                }
                (None, Some((first, second))) => {
                    if node.mode == SplitMode::Full {
                        violations.push(format!("{id:?} is Full with two children"));
                    }
                    for child in [first, second] {
                        match self.nodes.get(child) {
                            None => violations.push(format!("{id:?} has dangling child")),
                            Some(c) if c.parent != Some(id) => {
                                violations.push(format!("{child:?} back-reference is stale"))
                            }
                            Some(_) => {}
                        }
                    }
                    if let (Some(a), Some(b)) = (self.nodes.get(first), self.nodes.get(second)) {
                        if !partition_exact(node.rect, node.mode, a.rect, b.rect) {
                            violations.push(format!("{id:?} children do not partition its rect"));
                        }
                    }
                }
                (Some(_), None) => {
                    if node.mode != SplitMode::Full {
                        violations.push(format!("{id:?} holds a window but is a split"));
                    }
                }
                (None, None) => {} // transient empty root
            }
        }
        violations
    }
}

/// Two child rectangles exactly partition the parent along the split axis.
fn partition_exact(parent: Rect, mode: SplitMode, first: Rect, second: Rect) -> bool {
    match mode {
        SplitMode::Horizontal => {
            first.x == parent.x
                && second.x == parent.x
                && first.width == parent.width
                && second.width == parent.width
                && first.y == parent.y
                && second.y == parent.y + first.height as i32
                && first.height + second.height == parent.height
        }
        SplitMode::Vertical => {
            first.y == parent.y
                && second.y == parent.y
                && first.height == parent.height
                && second.height == parent.height
                && first.x == parent.x
                && second.x == parent.x + first.width as i32
                && first.width + second.width == parent.width
        }
        SplitMode::Full => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W1: Window = 0x40_0001;
    const W2: Window = 0x40_0002;
    const W3: Window = 0x40_0003;
    const W4: Window = 0x40_0004;

    fn assert_valid(tree: &TilingTree) {
        let violations = tree.validate();
        assert!(violations.is_empty(), "tree invariants violated: {violations:?}");
    }

    #[test]
    fn new_tree_is_single_full_leaf() {
        let tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        assert_valid(&tree);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.windows(), vec![W1]);
        let root = tree.get(tree.root()).unwrap();
        assert_eq!(root.mode, SplitMode::Full);
        assert_eq!(root.rect, Rect::new(0, 0, 800, 600));
        assert!(!tree.is_empty());
    }

    #[test]
    fn insert_splits_leaf_horizontally() {
        // The root becomes a Horizontal split with each child occupying
        // exactly half the original height.
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        let root = tree.root();
        tree.insert(root, W2).unwrap();
        assert_valid(&tree);

        let root_node = tree.get(root).unwrap();
        assert_eq!(root_node.mode, SplitMode::Horizontal);
        assert!(root_node.window.is_none());

        let geoms = tree.leaf_geometries();
        assert_eq!(geoms.len(), 2);
        assert_eq!(geoms[0], (W1, Rect::new(0, 0, 800, 300)));
        assert_eq!(geoms[1], (W2, Rect::new(0, 300, 800, 300)));
    }

    #[test]
    fn insert_into_split_is_rejected() {
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        let root = tree.root();
        tree.insert(root, W2).unwrap();
        assert_eq!(tree.insert(root, W3), Err(TreeError::InsertIntoSplit(root)));
        // The failed insert must not have mutated anything.
        assert_valid(&tree);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn odd_sizes_leave_remainder_to_second_child() {
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 801, 601));
        let root = tree.root();
        tree.insert(root, W2).unwrap();
        let geoms = tree.leaf_geometries();
        assert_eq!(geoms[0].1.height, 300);
        assert_eq!(geoms[1].1.height, 301);
        assert_eq!(geoms[0].1.height + geoms[1].1.height, 601);
        assert_valid(&tree);
    }

    #[test]
    fn remove_collapses_split_to_sibling() {
        // Split(W1, W2), remove W1: the tree collapses back to a single Full
        // leaf holding W2 at the full original rectangle.
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        tree.insert(tree.root(), W2).unwrap();
        assert!(tree.remove_window(W1));
        assert_valid(&tree);
        assert_eq!(tree.windows(), vec![W2]);
        let root = tree.get(tree.root()).unwrap();
        assert_eq!(root.mode, SplitMode::Full);
        assert_eq!(root.rect, Rect::new(0, 0, 800, 600));
        assert!(root.parent.is_none());
    }

    #[test]
    fn insert_then_remove_is_round_trip() {
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        let before = tree.leaf_geometries();
        tree.insert(tree.root(), W2).unwrap();
        assert!(tree.remove_window(W2));
        assert_valid(&tree);
        assert_eq!(tree.leaf_geometries(), before);
    }

    #[test]
    fn remove_last_window_leaves_empty_root() {
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        assert!(tree.remove_window(W1));
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        // No sibling promotion was attempted at the root.
        assert_eq!(tree.get(tree.root()).unwrap().mode, SplitMode::Full);
    }

    #[test]
    fn reinsert_into_empty_root_reoccupies_it() {
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        tree.remove_window(W1);
        let leaf = tree.insert(tree.root(), W2).unwrap();
        assert_eq!(leaf, tree.root());
        assert_eq!(tree.windows(), vec![W2]);
        assert_valid(&tree);
    }

    #[test]
    fn remove_unknown_window_is_noop() {
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        assert!(!tree.remove_window(W2));
        assert_eq!(tree.windows(), vec![W1]);
        assert_valid(&tree);
    }

    #[test]
    fn sibling_promotes_into_grandparent_slot() {
        // Build Split(Split(W1, W3), W2) by inserting W2 at the root leaf and
        // W3 at W1's leaf, then remove W3: W1 must rejoin the outer split.
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        tree.insert(tree.root(), W2).unwrap();
        let w1_leaf = tree.find_leaf(W1).unwrap();
        tree.insert(w1_leaf, W3).unwrap();
        assert_valid(&tree);
        assert_eq!(tree.len(), 3);

        assert!(tree.remove_window(W3));
        assert_valid(&tree);
        assert_eq!(tree.windows(), vec![W1, W2]);
        // Geometry is back to the two-way split of the full rectangle.
        let geoms = tree.leaf_geometries();
        assert_eq!(geoms[0], (W1, Rect::new(0, 0, 800, 300)));
        assert_eq!(geoms[1], (W2, Rect::new(0, 300, 800, 300)));
    }

    #[test]
    fn remove_container_drops_whole_subtree() {
        // Remove the inner split (W1, W3) in one operation; W2 takes over the
        // entire rectangle.
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        tree.insert(tree.root(), W2).unwrap();
        let w1_leaf = tree.find_leaf(W1).unwrap();
        tree.insert(w1_leaf, W3).unwrap();

        let inner = tree.get(tree.find_leaf(W1).unwrap()).unwrap().parent.unwrap();
        assert!(tree.remove_container(inner));
        assert_valid(&tree);
        assert_eq!(tree.windows(), vec![W2]);
        assert_eq!(
            tree.get(tree.root()).unwrap().rect,
            Rect::new(0, 0, 800, 600)
        );
    }

    #[test]
    fn remove_container_at_root_empties_tree() {
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        tree.insert(tree.root(), W2).unwrap();
        assert!(tree.remove_container(tree.root()));
        assert!(tree.is_empty());
    }

    #[test]
    fn vertical_mode_halves_width() {
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        let root = tree.root();
        tree.insert(root, W2).unwrap();
        assert!(tree.set_split_mode(root, SplitMode::Vertical));
        let geoms = tree.leaf_geometries();
        assert_eq!(geoms[0], (W1, Rect::new(0, 0, 400, 600)));
        assert_eq!(geoms[1], (W2, Rect::new(400, 0, 400, 600)));
        assert_valid(&tree);
    }

    #[test]
    fn set_split_mode_same_mode_is_noop() {
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        let root = tree.root();
        tree.insert(root, W2).unwrap();
        assert!(!tree.set_split_mode(root, SplitMode::Horizontal));
    }

    #[test]
    fn set_split_mode_rejects_full_with_children() {
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        let root = tree.root();
        tree.insert(root, W2).unwrap();
        assert!(!tree.set_split_mode(root, SplitMode::Full));
        // Unchanged: still a two-child Horizontal split.
        assert_eq!(tree.get(root).unwrap().mode, SplitMode::Horizontal);
        assert_valid(&tree);
    }

    #[test]
    fn geometry_recompute_propagates_through_subtrees() {
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 800, 600));
        tree.insert(tree.root(), W2).unwrap();
        let w2_leaf = tree.find_leaf(W2).unwrap();
        tree.insert(w2_leaf, W3).unwrap();

        // Grow the frame; every leaf rectangle follows.
        let root = tree.root();
        tree.recompute_geometry(root, Rect::new(0, 0, 1000, 800));
        assert_valid(&tree);
        let geoms = tree.leaf_geometries();
        assert_eq!(geoms[0], (W1, Rect::new(0, 0, 1000, 400)));
        assert_eq!(geoms[1], (W2, Rect::new(0, 400, 1000, 200)));
        assert_eq!(geoms[2], (W3, Rect::new(0, 600, 1000, 200)));
    }

    #[test]
    fn invariants_hold_across_churn() {
        // A longer mixed sequence; after every operation the shape and
        // partition invariants must hold.
        let mut tree = TilingTree::new(W1, Rect::new(0, 0, 1920, 1080));
        let windows = [W2, W3, W4];
        for (i, &w) in windows.iter().enumerate() {
            let target = tree.find_leaf([W1, W2, W3][i]).unwrap();
            tree.insert(target, w).unwrap();
            assert_valid(&tree);
        }
        assert_eq!(tree.len(), 4);

        for &w in &[W2, W1, W4] {
            assert!(tree.remove_window(w));
            assert_valid(&tree);
        }
        assert_eq!(tree.windows(), vec![W3]);
        assert_eq!(
            tree.get(tree.root()).unwrap().rect,
            Rect::new(0, 0, 1920, 1080)
        );

        assert!(tree.remove_window(W3));
        assert!(tree.is_empty());
    }
}
