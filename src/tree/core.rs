//! The arena-backed intrusive red-black tree underneath [`TxRbTree`].
//!
//! Nodes live in a slot arena; the parent/child cycle becomes index pairs.
//! All structural access is serialized by the tree lock in the owning
//! [`TxRbTree`](super::TxRbTree), so nothing here synchronizes. Each node
//! carries an [`Arc`]ed handle holding its version words; transaction items
//! pin the handle, never the slot, so an item entry stays valid after the
//! node is spliced out and its slot reused.

use std::sync::Arc;

use crate::version::{TVersion, INCREMENT, USER_BIT1};

pub(super) type Slot = usize;

/// The stable identity of a node: a never-reused id, the arena slot, and
/// the node's two version words.
pub(super) struct NodeHandle<K> {
    pub id: u64,
    pub slot: Slot,
    pub key: K,
    /// Guards the node's value.
    pub version: TVersion,
    /// Witnesses structural change around the node; bumped whenever a node
    /// is inserted into or removed from its neighborhood.
    pub nodeversion: TVersion,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Color {
    Red,
    Black,
}

pub(super) struct Node<K, V> {
    pub handle: Arc<NodeHandle<K>>,
    pub value: V,
    color: Color,
    parent: Option<Slot>,
    left: Option<Slot>,
    right: Option<Slot>,
}

/// The outcome of a descent for `key`: the matching node, or the reached
/// leaf position plus the two boundary nodes of the gap the key falls in.
pub(super) struct Descent {
    pub found: Option<Slot>,
    pub parent: Option<Slot>,
    pub go_right: bool,
    pub predecessor: Option<Slot>,
    pub successor: Option<Slot>,
}

pub(super) struct TreeCore<K, V> {
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<Slot>,
    root: Option<Slot>,
    next_id: u64,
}

impl<K, V> TreeCore<K, V>
where
    K: Ord + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: None,
            next_id: 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn node(&self, slot: Slot) -> &Node<K, V> {
        self.slots[slot].as_ref().expect("slot occupied")
    }

    pub fn node_mut(&mut self, slot: Slot) -> &mut Node<K, V> {
        self.slots[slot].as_mut().expect("slot occupied")
    }

    /// Returns the node at `slot` if it is still the node `id` names.
    pub fn node_checked(&self, slot: Slot, id: u64) -> Option<&Node<K, V>> {
        self.slots
            .get(slot)?
            .as_ref()
            .filter(|node| node.handle.id == id)
    }

    /// Descends for `key`, tracking the gap boundaries on the way down.
    pub fn descend(&self, key: &K) -> Descent {
        let mut parent = None;
        let mut go_right = false;
        let mut predecessor = None;
        let mut successor = None;
        let mut current = self.root;
        while let Some(slot) = current {
            let node = self.node(slot);
            match key.cmp(&node.handle.key) {
                std::cmp::Ordering::Equal => {
                    return Descent {
                        found: Some(slot),
                        parent: node.parent,
                        go_right: false,
                        predecessor,
                        successor,
                    }
                }
                std::cmp::Ordering::Less => {
                    successor = Some(slot);
                    parent = Some(slot);
                    go_right = false;
                    current = node.left;
                }
                std::cmp::Ordering::Greater => {
                    predecessor = Some(slot);
                    parent = Some(slot);
                    go_right = true;
                    current = node.right;
                }
            }
        }
        Descent {
            found: None,
            parent,
            go_right,
            predecessor,
            successor,
        }
    }

    /// Splices a fresh node under `parent` on the side `descend` reported.
    /// The node starts insert-marked: its value version carries the
    /// insert bit until the creating transaction installs or unwinds it.
    pub fn insert_at(
        &mut self,
        parent: Option<Slot>,
        go_right: bool,
        key: K,
        value: V,
    ) -> Arc<NodeHandle<K>> {
        let slot = self.free.pop().unwrap_or_else(|| {
            self.slots.push(None);
            self.slots.len() - 1
        });
        let handle = Arc::new(NodeHandle {
            id: self.next_id,
            slot,
            key,
            version: TVersion::new(INCREMENT | USER_BIT1),
            nodeversion: TVersion::new(0),
        });
        self.next_id += 1;
        self.slots[slot] = Some(Node {
            handle: handle.clone(),
            value,
            color: Color::Red,
            parent,
            left: None,
            right: None,
        });
        match parent {
            None => self.root = Some(slot),
            Some(parent) => {
                if go_right {
                    self.node_mut(parent).right = Some(slot);
                } else {
                    self.node_mut(parent).left = Some(slot);
                }
            }
        }
        self.insert_fixup(slot);
        handle
    }

    /// Splices the node out, rebalances, and returns it. The slot becomes
    /// reusable immediately; items referencing the node keep its handle
    /// alive through their anchors.
    pub fn remove(&mut self, slot: Slot) -> Node<K, V> {
        let z = slot;
        let mut y_color = self.node(z).color;
        let x;
        let x_parent;

        if self.node(z).left.is_none() {
            x = self.node(z).right;
            x_parent = self.node(z).parent;
            self.transplant(z, self.node(z).right);
        } else if self.node(z).right.is_none() {
            x = self.node(z).left;
            x_parent = self.node(z).parent;
            self.transplant(z, self.node(z).left);
        } else {
            let y = self.minimum(self.node(z).right.expect("right child exists"));
            y_color = self.node(y).color;
            x = self.node(y).right;
            if self.node(y).parent == Some(z) {
                x_parent = Some(y);
            } else {
                x_parent = self.node(y).parent;
                self.transplant(y, self.node(y).right);
                let z_right = self.node(z).right;
                self.node_mut(y).right = z_right;
                if let Some(right) = z_right {
                    self.node_mut(right).parent = Some(y);
                }
            }
            self.transplant(z, Some(y));
            let z_left = self.node(z).left;
            self.node_mut(y).left = z_left;
            if let Some(left) = z_left {
                self.node_mut(left).parent = Some(y);
            }
            self.node_mut(y).color = self.node(z).color;
        }

        if y_color == Color::Black {
            self.remove_fixup(x, x_parent);
        }

        self.free.push(z);
        self.slots[z].take().expect("slot occupied")
    }

    pub fn first(&self) -> Option<Slot> {
        self.root.map(|root| self.minimum(root))
    }

    pub fn last(&self) -> Option<Slot> {
        self.root.map(|root| self.maximum(root))
    }

    /// In-order successor.
    pub fn next(&self, slot: Slot) -> Option<Slot> {
        if let Some(right) = self.node(slot).right {
            return Some(self.minimum(right));
        }
        let mut child = slot;
        let mut parent = self.node(slot).parent;
        while let Some(p) = parent {
            if self.node(p).left == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    /// In-order predecessor.
    pub fn prev(&self, slot: Slot) -> Option<Slot> {
        if let Some(left) = self.node(slot).left {
            return Some(self.maximum(left));
        }
        let mut child = slot;
        let mut parent = self.node(slot).parent;
        while let Some(p) = parent {
            if self.node(p).right == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    fn minimum(&self, mut slot: Slot) -> Slot {
        while let Some(left) = self.node(slot).left {
            slot = left;
        }
        slot
    }

    fn maximum(&self, mut slot: Slot) -> Slot {
        while let Some(right) = self.node(slot).right {
            slot = right;
        }
        slot
    }

    fn color_of(&self, slot: Option<Slot>) -> Color {
        slot.map_or(Color::Black, |slot| self.node(slot).color)
    }

    fn set_color(&mut self, slot: Slot, color: Color) {
        self.node_mut(slot).color = color;
    }

    /// Replaces the subtree rooted at `u` with the one rooted at `v`.
    fn transplant(&mut self, u: Slot, v: Option<Slot>) {
        let u_parent = self.node(u).parent;
        match u_parent {
            None => self.root = v,
            Some(parent) => {
                if self.node(parent).left == Some(u) {
                    self.node_mut(parent).left = v;
                } else {
                    self.node_mut(parent).right = v;
                }
            }
        }
        if let Some(v) = v {
            self.node_mut(v).parent = u_parent;
        }
    }

    fn rotate_left(&mut self, x: Slot) {
        let y = self.node(x).right.expect("rotation pivot exists");
        let y_left = self.node(y).left;
        self.node_mut(x).right = y_left;
        if let Some(y_left) = y_left {
            self.node_mut(y_left).parent = Some(x);
        }
        let x_parent = self.node(x).parent;
        self.node_mut(y).parent = x_parent;
        match x_parent {
            None => self.root = Some(y),
            Some(parent) => {
                if self.node(parent).left == Some(x) {
                    self.node_mut(parent).left = Some(y);
                } else {
                    self.node_mut(parent).right = Some(y);
                }
            }
        }
        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn rotate_right(&mut self, x: Slot) {
        let y = self.node(x).left.expect("rotation pivot exists");
        let y_right = self.node(y).right;
        self.node_mut(x).left = y_right;
        if let Some(y_right) = y_right {
            self.node_mut(y_right).parent = Some(x);
        }
        let x_parent = self.node(x).parent;
        self.node_mut(y).parent = x_parent;
        match x_parent {
            None => self.root = Some(y),
            Some(parent) => {
                if self.node(parent).left == Some(x) {
                    self.node_mut(parent).left = Some(y);
                } else {
                    self.node_mut(parent).right = Some(y);
                }
            }
        }
        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn insert_fixup(&mut self, mut z: Slot) {
        while let Some(parent) = self.node(z).parent {
            if self.node(parent).color == Color::Black {
                break;
            }
            let grandparent = self
                .node(parent)
                .parent
                .expect("red parent is never the root");
            if Some(parent) == self.node(grandparent).left {
                let uncle = self.node(grandparent).right;
                if self.color_of(uncle) == Color::Red {
                    self.set_color(parent, Color::Black);
                    self.set_color(uncle.expect("red uncle exists"), Color::Black);
                    self.set_color(grandparent, Color::Red);
                    z = grandparent;
                } else {
                    if Some(z) == self.node(parent).right {
                        z = parent;
                        self.rotate_left(z);
                    }
                    let parent = self.node(z).parent.expect("rotated under parent");
                    let grandparent = self.node(parent).parent.expect("grandparent exists");
                    self.set_color(parent, Color::Black);
                    self.set_color(grandparent, Color::Red);
                    self.rotate_right(grandparent);
                }
            } else {
                let uncle = self.node(grandparent).left;
                if self.color_of(uncle) == Color::Red {
                    self.set_color(parent, Color::Black);
                    self.set_color(uncle.expect("red uncle exists"), Color::Black);
                    self.set_color(grandparent, Color::Red);
                    z = grandparent;
                } else {
                    if Some(z) == self.node(parent).left {
                        z = parent;
                        self.rotate_right(z);
                    }
                    let parent = self.node(z).parent.expect("rotated under parent");
                    let grandparent = self.node(parent).parent.expect("grandparent exists");
                    self.set_color(parent, Color::Black);
                    self.set_color(grandparent, Color::Red);
                    self.rotate_left(grandparent);
                }
            }
        }
        if let Some(root) = self.root {
            self.set_color(root, Color::Black);
        }
    }

    fn remove_fixup(&mut self, mut x: Option<Slot>, mut parent: Option<Slot>) {
        while x != self.root && self.color_of(x) == Color::Black {
            let Some(p) = parent else { break };
            if x == self.node(p).left {
                let mut w = self.node(p).right.expect("sibling exists");
                if self.node(w).color == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_left(p);
                    w = self.node(p).right.expect("sibling exists");
                }
                if self.color_of(self.node(w).left) == Color::Black
                    && self.color_of(self.node(w).right) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = Some(p);
                    parent = self.node(p).parent;
                } else {
                    if self.color_of(self.node(w).right) == Color::Black {
                        if let Some(w_left) = self.node(w).left {
                            self.set_color(w_left, Color::Black);
                        }
                        self.set_color(w, Color::Red);
                        self.rotate_right(w);
                        w = self.node(p).right.expect("sibling exists");
                    }
                    self.set_color(w, self.node(p).color);
                    self.set_color(p, Color::Black);
                    if let Some(w_right) = self.node(w).right {
                        self.set_color(w_right, Color::Black);
                    }
                    self.rotate_left(p);
                    x = self.root;
                    parent = None;
                }
            } else {
                let mut w = self.node(p).left.expect("sibling exists");
                if self.node(w).color == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.rotate_right(p);
                    w = self.node(p).left.expect("sibling exists");
                }
                if self.color_of(self.node(w).right) == Color::Black
                    && self.color_of(self.node(w).left) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = Some(p);
                    parent = self.node(p).parent;
                } else {
                    if self.color_of(self.node(w).left) == Color::Black {
                        if let Some(w_right) = self.node(w).right {
                            self.set_color(w_right, Color::Black);
                        }
                        self.set_color(w, Color::Red);
                        self.rotate_left(w);
                        w = self.node(p).left.expect("sibling exists");
                    }
                    self.set_color(w, self.node(p).color);
                    self.set_color(p, Color::Black);
                    if let Some(w_left) = self.node(w).left {
                        self.set_color(w_left, Color::Black);
                    }
                    self.rotate_right(p);
                    x = self.root;
                    parent = None;
                }
            }
        }
        if let Some(x) = x {
            self.set_color(x, Color::Black);
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        fn black_height<K: Ord + Clone, V>(
            core: &TreeCore<K, V>,
            slot: Option<Slot>,
        ) -> usize {
            let Some(slot) = slot else { return 1 };
            let node = core.node(slot);
            if node.color == Color::Red {
                assert_eq!(core.color_of(node.left), Color::Black, "red-red violation");
                assert_eq!(core.color_of(node.right), Color::Black, "red-red violation");
            }
            if let Some(left) = node.left {
                assert!(core.node(left).handle.key < node.handle.key);
                assert_eq!(core.node(left).parent, Some(slot));
            }
            if let Some(right) = node.right {
                assert!(core.node(right).handle.key > node.handle.key);
                assert_eq!(core.node(right).parent, Some(slot));
            }
            let lh = black_height(core, node.left);
            let rh = black_height(core, node.right);
            assert_eq!(lh, rh, "black-height violation");
            lh + usize::from(node.color == Color::Black)
        }

        assert_eq!(self.color_of(self.root), Color::Black);
        black_height(self, self.root);
    }
}

#[cfg(test)]
mod tests {
    use nanorand::{Pcg64, Rng};

    use super::*;

    fn collect_inorder(core: &TreeCore<u64, u64>) -> Vec<u64> {
        let mut keys = Vec::new();
        let mut cursor = core.first();
        while let Some(slot) = cursor {
            keys.push(core.node(slot).handle.key);
            cursor = core.next(slot);
        }
        keys
    }

    fn insert(core: &mut TreeCore<u64, u64>, key: u64) {
        let descent = core.descend(&key);
        assert!(descent.found.is_none());
        core.insert_at(descent.parent, descent.go_right, key, key);
    }

    #[test]
    fn ordered_inserts_stay_balanced() {
        let mut core = TreeCore::new();
        for key in 0..256 {
            insert(&mut core, key);
            core.check_invariants();
        }
        assert_eq!(collect_inorder(&core), (0..256).collect::<Vec<_>>());
    }

    #[test]
    fn descent_reports_gap_boundaries() {
        let mut core = TreeCore::new();
        for key in [10, 20, 30] {
            insert(&mut core, key);
        }
        let descent = core.descend(&25);
        assert!(descent.found.is_none());
        assert_eq!(
            descent.predecessor.map(|slot| core.node(slot).handle.key),
            Some(20)
        );
        assert_eq!(
            descent.successor.map(|slot| core.node(slot).handle.key),
            Some(30)
        );

        let below = core.descend(&5);
        assert_eq!(below.predecessor, None);
        assert_eq!(
            below.successor.map(|slot| core.node(slot).handle.key),
            Some(10)
        );

        let above = core.descend(&35);
        assert_eq!(
            above.predecessor.map(|slot| core.node(slot).handle.key),
            Some(30)
        );
        assert_eq!(above.successor, None);
    }

    #[test]
    fn random_insert_remove_stress() {
        let mut rng = Pcg64::new_seed(7);
        let mut core = TreeCore::new();
        let mut shadow = std::collections::BTreeSet::new();
        for _ in 0..4000 {
            let key = u64::from(rng.generate::<u16>() % 512);
            if shadow.contains(&key) {
                let descent = core.descend(&key);
                let node = core.remove(descent.found.expect("shadow says present"));
                assert_eq!(node.handle.key, key);
                shadow.remove(&key);
            } else {
                insert(&mut core, key);
                shadow.insert(key);
            }
            core.check_invariants();
        }
        assert_eq!(
            collect_inorder(&core),
            shadow.iter().copied().collect::<Vec<_>>()
        );
    }

    #[test]
    fn slots_are_reused_with_fresh_identities() {
        let mut core: TreeCore<u64, u64> = TreeCore::new();
        insert(&mut core, 1);
        let descent = core.descend(&1);
        let old = core.remove(descent.found.unwrap());
        insert(&mut core, 2);
        let descent = core.descend(&2);
        let slot = descent.found.unwrap();
        assert_eq!(slot, old.handle.slot);
        assert_ne!(core.node(slot).handle.id, old.handle.id);
        assert!(core.node_checked(slot, old.handle.id).is_none());
        assert!(core.node_checked(slot, core.node(slot).handle.id).is_some());
    }
}
