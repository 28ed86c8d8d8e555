//! The size-indexed red-black tree of free blocks (spec §4.4.4).
//!
//! `FreeTree` keys nodes by `size`, ties going right on insert. It shares
//! every node with the physical, address-ordered doubly-linked chain
//! recorded in the same [`PackedHeader`]s — `insert`/`remove`/`coalesce`
//! keep both views consistent from the caller's perspective, the way the
//! original `RBTree` does across `rb_tree.cpp`.

use std::ptr::NonNull;

use crate::header::{Color, PackedHeader, HEADER_SIZE};

/// Owns no memory itself — `region_base` points into a region owned by the
/// [`crate::free_list::FreeListAllocator`] that embeds this tree.
pub struct FreeTree {
    region_base: *mut u8,
    root: Option<NonNull<PackedHeader>>,
}

unsafe fn header_ref<'a>(node: NonNull<PackedHeader>) -> &'a PackedHeader {
    unsafe { &*node.as_ptr() }
}

unsafe fn header_mut<'a>(node: NonNull<PackedHeader>) -> &'a mut PackedHeader {
    unsafe { &mut *node.as_ptr() }
}

impl FreeTree {
    pub fn new(region_base: *mut u8) -> Self {
        Self { region_base, root: None }
    }

    pub fn root(&self) -> Option<NonNull<PackedHeader>> {
        self.root
    }

    fn size_of(node: NonNull<PackedHeader>) -> u64 {
        unsafe { header_ref(node).get_size() }
    }

    fn color_of(node: Option<NonNull<PackedHeader>>) -> Color {
        // A null child/sibling is conventionally black, matching the
        // original's null-sentinel handling without an actual sentinel node.
        match node {
            None => Color::Black,
            Some(n) => unsafe { header_ref(n).get_color() },
        }
    }

    fn set_color(node: NonNull<PackedHeader>, color: Color) {
        unsafe { header_mut(node).set_color(color) };
    }

    fn parent(&self, node: NonNull<PackedHeader>) -> Option<NonNull<PackedHeader>> {
        unsafe { header_ref(node).get_parent(self.region_base) }
    }

    fn set_parent(&self, node: NonNull<PackedHeader>, parent: Option<NonNull<PackedHeader>>) {
        unsafe { header_mut(node).set_parent(parent, self.region_base) };
    }

    fn left(&self, node: NonNull<PackedHeader>) -> Option<NonNull<PackedHeader>> {
        unsafe { header_ref(node).get_left(self.region_base) }
    }

    fn set_left(&self, node: NonNull<PackedHeader>, left: Option<NonNull<PackedHeader>>) {
        unsafe { header_mut(node).set_left(left, self.region_base) };
        if let Some(l) = left {
            self.set_parent(l, Some(node));
        }
    }

    fn right(&self, node: NonNull<PackedHeader>) -> Option<NonNull<PackedHeader>> {
        unsafe { header_ref(node).get_right(self.region_base) }
    }

    fn set_right(&self, node: NonNull<PackedHeader>, right: Option<NonNull<PackedHeader>>) {
        unsafe { header_mut(node).set_right(right, self.region_base) };
        if let Some(r) = right {
            self.set_parent(r, Some(node));
        }
    }

    fn physical_previous(node: NonNull<PackedHeader>, region_base: *mut u8) -> Option<NonNull<PackedHeader>> {
        unsafe { header_ref(node).get_previous(region_base) }
    }

    fn physical_next(node: NonNull<PackedHeader>) -> Option<NonNull<PackedHeader>> {
        unsafe { header_ref(node).get_next() }
    }

    /// BST-insert `node` by size (ties go right), rebalance, and optionally
    /// coalesce with its physical neighbors. Matches `RBTree::insert`.
    pub fn insert(&mut self, node: NonNull<PackedHeader>, should_coalesce: bool) {
        unsafe { header_mut(node).reset_for_insert(self.region_base) };
        let node_size = Self::size_of(node);

        let mut parent = None;
        let mut current = self.root;
        while let Some(cur) = current {
            parent = Some(cur);
            current = if node_size < Self::size_of(cur) { self.left(cur) } else { self.right(cur) };
        }

        self.set_parent(node, parent);
        match parent {
            None => self.root = Some(node),
            Some(p) if node_size < Self::size_of(p) => self.set_left(p, Some(node)),
            Some(p) => self.set_right(p, Some(node)),
        }

        self.fix_insert(node);
        if should_coalesce {
            self.coalesce(node);
        }
    }

    /// Removes `node` from the tree (not from the physical chain) and marks
    /// it reserved. Standard CLRS deletion: splice via the in-order
    /// successor when both children exist, then rebalance if a black node
    /// was physically removed.
    pub fn remove(&mut self, node: NonNull<PackedHeader>) {
        unsafe { header_mut(node).set_free(false) };
        debug_assert!(self.contains(node), "removing a node the tree does not contain");

        let mut y = node;
        let mut y_original_color = Self::color_of(Some(y));
        let x: Option<NonNull<PackedHeader>>;
        let mut x_parent: Option<NonNull<PackedHeader>>;

        if self.left(node).is_none() {
            x = self.right(node);
            x_parent = self.parent(node);
            self.transplant(node, x);
        } else if self.right(node).is_none() {
            x = self.left(node);
            x_parent = self.parent(node);
            self.transplant(node, x);
        } else {
            y = self.get_min(self.right(node).unwrap());
            y_original_color = Self::color_of(Some(y));
            x = self.right(y);
            if self.parent(y) == Some(node) {
                x_parent = Some(y);
            } else {
                x_parent = self.parent(y);
                self.transplant(y, x);
                let right = self.right(node).unwrap();
                self.set_right(y, Some(right));
            }
            self.transplant(node, Some(y));
            let left = self.left(node).unwrap();
            self.set_left(y, Some(left));
            Self::set_color(y, unsafe { header_ref(node).get_color() });
        }

        if y_original_color == Color::Black {
            self.fix_remove(x, x_parent);
        }
    }

    /// Best-fit search: descend keeping the smallest node seen whose size is
    /// still `>= size`. A `None` result means the region has no block large
    /// enough — callers treat that as the fatal out-of-memory condition from
    /// spec §4.4.4 / §7.
    pub fn find(&self, size: u64) -> Option<NonNull<PackedHeader>> {
        let mut current = self.root;
        let mut best_fit = None;
        while let Some(cur) = current {
            if Self::size_of(cur) >= size {
                best_fit = Some(cur);
                current = self.left(cur);
            } else {
                current = self.right(cur);
            }
        }
        best_fit
    }

    /// Shifts `node` in place to satisfy `alignment`, then splits off a free
    /// remainder if one is big enough to host its own header. Returns the
    /// (possibly shifted) header of the kept, still-unreserved block, plus
    /// `true` if the region's head block (the one with no `previous`) was
    /// the one that moved — the allocator needs to know this to keep its
    /// own notion of "first block" pointed at a live header.
    pub fn split_node(&mut self, node: NonNull<PackedHeader>, requested_bytes: u64, alignment: usize) -> (NonNull<PackedHeader>, bool) {
        let (node, region_head_moved) = self.align_node(node, alignment);

        if Self::size_of(node) - requested_bytes <= HEADER_SIZE as u64 {
            return (node, region_head_moved);
        }

        let split_at = unsafe { header_ref(node).get_memory().add(requested_bytes as usize) };
        let split_node = unsafe { PackedHeader::place_at(split_at) };
        let next = Self::physical_next(node);

        unsafe {
            header_mut(split_node).set_size(Self::size_of(node) - (requested_bytes + HEADER_SIZE as u64));
            header_mut(split_node).set_free(true);
        }
        self.link_previous(split_node, Some(node));
        self.link_next_flag(split_node, next);
        if let Some(n) = next {
            self.link_previous(n, Some(split_node));
        }
        unsafe { header_mut(node).set_size(requested_bytes) };
        self.link_next_flag(node, Some(split_node));

        self.insert(split_node, false);
        (node, region_head_moved)
    }

    fn link_previous(&self, node: NonNull<PackedHeader>, previous: Option<NonNull<PackedHeader>>) {
        unsafe { header_mut(node).set_previous(previous, self.region_base) };
    }

    fn link_next_flag(&self, node: NonNull<PackedHeader>, next: Option<NonNull<PackedHeader>>) {
        unsafe { header_mut(node).set_next(next.is_some()) };
    }

    /// Merges `node` with any free physical neighbor, eagerly and without
    /// recursing back into `coalesce` for the merged result. Matches
    /// `RBTree::coalesce`.
    pub fn coalesce(&mut self, node: NonNull<PackedHeader>) {
        let mut current = node;
        let previous = Self::physical_previous(current, self.region_base);
        let next = Self::physical_next(current);

        let is_previous_free = previous.map(|p| unsafe { header_ref(p).is_free() }).unwrap_or(false);
        let is_next_free = next.map(|n| unsafe { header_ref(n).is_free() }).unwrap_or(false);

        if !is_previous_free && !is_next_free {
            return;
        }

        self.remove(current);

        let mut next = next;
        if is_previous_free {
            let previous = previous.unwrap();
            self.remove(previous);
            let exact_node_size = Self::size_of(current) + HEADER_SIZE as u64;
            unsafe { header_mut(previous).set_size(Self::size_of(previous) + exact_node_size) };
            self.link_next_flag(previous, next);
            current = previous;
            if let Some(n) = next {
                self.link_previous(n, Some(current));
            }
        }

        if is_next_free {
            let next_node = next.unwrap();
            self.remove(next_node);
            let exact_node_size = Self::size_of(next_node) + HEADER_SIZE as u64;
            unsafe { header_mut(current).set_size(Self::size_of(current) + exact_node_size) };
            next = Self::physical_next(next_node);
            self.link_next_flag(current, next);
            if let Some(n) = next {
                self.link_previous(n, Some(current));
            }
        }

        self.insert(current, false);
    }

    /// Shifts `node`'s header forward by the padding needed to align its
    /// payload, crediting the padding to the previous physical neighbor (or,
    /// if there is none, leaving it inside `node` itself — the caller's
    /// search already padded `bytes` by `alignment - 1` for that case).
    /// Returns whether `node` was the region's head block (no previous) and
    /// therefore moved without a neighbor absorbing the padding.
    fn align_node(&mut self, node: NonNull<PackedHeader>, alignment: usize) -> (NonNull<PackedHeader>, bool) {
        let payload = unsafe { header_ref(node).get_memory() } as usize;
        let misalignment = payload & (alignment - 1);
        if misalignment == 0 {
            return (node, false);
        }
        let padding = alignment - misalignment;

        let previous = Self::physical_previous(node, self.region_base);
        if let Some(previous) = previous {
            unsafe { header_mut(previous).set_size(Self::size_of(previous) + padding as u64) };
        }
        unsafe { header_mut(node).set_size(Self::size_of(node) - padding as u64) };

        let new_address = unsafe { (node.as_ptr() as *mut u8).add(padding) };
        unsafe { std::ptr::copy(node.as_ptr() as *const u8, new_address, HEADER_SIZE) };
        let shifted = unsafe { NonNull::new_unchecked(new_address as *mut PackedHeader) };

        // The previous neighbor's `next` is derived from its own size, which
        // just grew by exactly `padding`, so it already resolves to
        // `shifted` with no extra bookkeeping. The physically-next block's
        // `previous` is a stored offset, though, and must be repointed.
        if let Some(next) = Self::physical_next(shifted) {
            self.link_previous(next, Some(shifted));
        }
        (shifted, previous.is_none())
    }

    fn rotate_left(&mut self, node: NonNull<PackedHeader>) {
        let child = self.right(node).expect("rotate_left requires a right child");
        let right = self.left(child);
        self.set_right(node, right);

        let parent = self.parent(node);
        self.set_parent(child, parent);
        match parent {
            None => self.root = Some(child),
            Some(p) if self.left(p) == Some(node) => self.set_left(p, Some(child)),
            Some(p) => self.set_right(p, Some(child)),
        }
        self.set_left(child, Some(node));
    }

    fn rotate_right(&mut self, node: NonNull<PackedHeader>) {
        let child = self.left(node).expect("rotate_right requires a left child");
        let left = self.right(child);
        self.set_left(node, left);

        let parent = self.parent(node);
        self.set_parent(child, parent);
        match parent {
            None => self.root = Some(child),
            Some(p) if self.left(p) == Some(node) => self.set_left(p, Some(child)),
            Some(p) => self.set_right(p, Some(child)),
        }
        self.set_right(child, Some(node));
    }

    fn transplant(&mut self, u: NonNull<PackedHeader>, v: Option<NonNull<PackedHeader>>) {
        let parent = self.parent(u);
        match parent {
            None => self.root = v,
            Some(p) if self.left(p) == Some(u) => self.set_left(p, v),
            Some(p) => self.set_right(p, v),
        }
        if let Some(v) = v {
            self.set_parent(v, parent);
        }
    }

    fn get_min(&self, node: NonNull<PackedHeader>) -> NonNull<PackedHeader> {
        let mut current = node;
        while let Some(left) = self.left(current) {
            current = left;
        }
        current
    }

    /// Uncle-recolor + rotation repair for a freshly BST-inserted red node,
    /// the standard CLRS formulation (spec §9 explicitly prefers this over
    /// the source's grandparent-reassignment variant).
    fn fix_insert(&mut self, mut node: NonNull<PackedHeader>) {
        while Some(node) != self.root && Self::color_of(Some(node)) == Color::Red {
            let Some(mut parent) = self.parent(node) else { break };
            if Self::color_of(Some(parent)) != Color::Red {
                break;
            }
            let grandparent = self.parent(parent).expect("red parent must have a black grandparent");
            if Some(parent) == self.left(grandparent) {
                let uncle = self.right(grandparent);
                if Self::color_of(uncle) == Color::Red {
                    let uncle = uncle.unwrap();
                    Self::set_color(grandparent, Color::Red);
                    Self::set_color(parent, Color::Black);
                    Self::set_color(uncle, Color::Black);
                    node = grandparent;
                } else {
                    if Some(node) == self.right(parent) {
                        node = parent;
                        self.rotate_left(node);
                        parent = self.parent(node).unwrap();
                    }
                    self.rotate_right(grandparent);
                    let parent_color = Self::color_of(Some(parent));
                    Self::set_color(parent, Self::color_of(Some(grandparent)));
                    Self::set_color(grandparent, parent_color);
                    node = parent;
                }
            } else {
                let uncle = self.left(grandparent);
                if Self::color_of(uncle) == Color::Red {
                    let uncle = uncle.unwrap();
                    Self::set_color(grandparent, Color::Red);
                    Self::set_color(parent, Color::Black);
                    Self::set_color(uncle, Color::Black);
                    node = grandparent;
                } else {
                    if Some(node) == self.left(parent) {
                        node = parent;
                        self.rotate_right(node);
                        parent = self.parent(node).unwrap();
                    }
                    self.rotate_left(grandparent);
                    let parent_color = Self::color_of(Some(parent));
                    Self::set_color(parent, Self::color_of(Some(grandparent)));
                    Self::set_color(grandparent, parent_color);
                    node = parent;
                }
            }
        }
        if let Some(root) = self.root {
            Self::set_color(root, Color::Black);
        }
    }

    /// The four classical double-black repair cases, mirrored on both
    /// sides, with explicit null-sibling/null-child handling since the
    /// packed tree has no sentinel node to lean on.
    fn fix_remove(&mut self, mut node: Option<NonNull<PackedHeader>>, mut parent: Option<NonNull<PackedHeader>>) {
        while node != self.root && Self::color_of(node) == Color::Black {
            let Some(p) = parent else { break };

            if node == self.left(p) {
                let mut sibling = self.right(p);
                let mut left = None;
                let mut right = None;

                if let Some(s) = sibling {
                    if Self::color_of(Some(s)) == Color::Red {
                        Self::set_color(s, Color::Black);
                        Self::set_color(p, Color::Red);
                        self.rotate_left(p);
                        sibling = self.right(p);
                    }
                    if let Some(s) = sibling {
                        left = self.left(s);
                        right = self.right(s);
                    }
                }

                let sibling_both_black = Self::color_of(left) == Color::Black && Self::color_of(right) == Color::Black;
                if sibling.is_none() || sibling_both_black {
                    if let Some(s) = sibling {
                        Self::set_color(s, Color::Red);
                    }
                    node = Some(p);
                    parent = self.parent(p);
                } else if let Some(mut s) = sibling {
                    if Self::color_of(right) == Color::Black {
                        if let Some(l) = left {
                            Self::set_color(l, Color::Black);
                        }
                        Self::set_color(s, Color::Red);
                        self.rotate_right(s);
                        s = self.right(p).unwrap();
                        right = self.right(s);
                    }
                    Self::set_color(s, Self::color_of(Some(p)));
                    Self::set_color(p, Color::Black);
                    if let Some(r) = right {
                        Self::set_color(r, Color::Black);
                    }
                    self.rotate_left(p);
                    node = self.root;
                    parent = None;
                }
            } else {
                let mut sibling = self.left(p);
                let mut left = None;
                let mut right = None;

                if let Some(s) = sibling {
                    if Self::color_of(Some(s)) == Color::Red {
                        Self::set_color(s, Color::Black);
                        Self::set_color(p, Color::Red);
                        self.rotate_right(p);
                        sibling = self.left(p);
                    }
                    if let Some(s) = sibling {
                        left = self.left(s);
                        right = self.right(s);
                    }
                }

                let sibling_both_black = Self::color_of(left) == Color::Black && Self::color_of(right) == Color::Black;
                if sibling.is_none() || sibling_both_black {
                    if let Some(s) = sibling {
                        Self::set_color(s, Color::Red);
                    }
                    node = Some(p);
                    parent = self.parent(p);
                } else if let Some(mut s) = sibling {
                    if Self::color_of(left) == Color::Black {
                        if let Some(r) = right {
                            Self::set_color(r, Color::Black);
                        }
                        Self::set_color(s, Color::Red);
                        self.rotate_left(s);
                        s = self.left(p).unwrap();
                        left = self.left(s);
                    }
                    Self::set_color(s, Self::color_of(Some(p)));
                    Self::set_color(p, Color::Black);
                    if let Some(l) = left {
                        Self::set_color(l, Color::Black);
                    }
                    self.rotate_right(p);
                    node = self.root;
                    parent = None;
                }
            }
        }

        if let Some(n) = node {
            Self::set_color(n, Color::Black);
        }
    }

    /// Tree membership by address, not just by size: duplicate sizes mean a
    /// size-guided descent can miss the exact node, so a DFS fallback covers
    /// the case the descent didn't confirm. Used only by assertions.
    pub fn contains(&self, node: NonNull<PackedHeader>) -> bool {
        let size = Self::size_of(node);
        let mut current = self.root;
        while let Some(cur) = current {
            if Self::size_of(cur) >= size {
                if cur == node {
                    return true;
                }
                current = self.left(cur);
            } else {
                current = self.right(cur);
            }
        }

        self.dfs_contains(self.root, node)
    }

    fn dfs_contains(&self, subtree_root: Option<NonNull<PackedHeader>>, node: NonNull<PackedHeader>) -> bool {
        match subtree_root {
            None => false,
            Some(r) if r == node => true,
            Some(r) => self.dfs_contains(self.left(r), node) || self.dfs_contains(self.right(r), node),
        }
    }

    /// Dumps the tree in right-last indented form:
    /// `R|L----size(Color)` per node, one line each.
    pub fn print_tree(&self) {
        match self.root {
            None => log::trace!("tree is empty"),
            Some(root) => {
                log::trace!("red-black tree:");
                self.print_node(root, String::new(), true);
            }
        }
    }

    fn print_node(&self, node: NonNull<PackedHeader>, indent: String, is_last_child: bool) {
        let marker = if is_last_child { "R----" } else { "L----" };
        let color = if Self::color_of(Some(node)) == Color::Red { "Red" } else { "Black" };
        log::trace!("{}{}{}({})", indent, marker, Self::size_of(node), color);
        let child_indent = if is_last_child { format!("{indent}   ") } else { format!("{indent}|  ") };
        if let Some(left) = self.left(node) {
            self.print_node(left, child_indent.clone(), false);
        }
        if let Some(right) = self.right(node) {
            self.print_node(right, child_indent, true);
        }
    }

    /// Debug-only structural validator: root-is-black, no red-red, BST size
    /// ordering against ancestor bounds, parent-pointer consistency, and
    /// matching black-heights on every path. Mirrors the original's
    /// `validate_tree`/`validate_node`, which only ever ran in debug builds.
    pub fn validate_tree(&self) -> bool {
        let Some(root) = self.root else {
            return true;
        };
        if Self::color_of(Some(root)) != Color::Black {
            log::error!("root is not black");
            return false;
        }
        if self.parent(root).is_some() {
            log::error!("root has a non-null parent");
            return false;
        }
        let mut black_height = -1i32;
        self.validate_node(Some(root), None, &mut black_height, None, None)
    }

    fn validate_node(
        &self,
        node: Option<NonNull<PackedHeader>>,
        parent: Option<NonNull<PackedHeader>>,
        black_height: &mut i32,
        min_node: Option<NonNull<PackedHeader>>,
        max_node: Option<NonNull<PackedHeader>>,
    ) -> bool {
        let Some(node) = node else {
            *black_height = 0;
            return true;
        };

        if self.parent(node) != parent {
            log::error!("node has an inconsistent parent pointer");
            return false;
        }

        let size = Self::size_of(node);
        if let Some(min_node) = min_node {
            if size < Self::size_of(min_node) {
                log::error!("BST violation: node size {size} below lower bound");
                return false;
            }
        }
        if let Some(max_node) = max_node {
            if size > Self::size_of(max_node) {
                log::error!("BST violation: node size {size} above upper bound");
                return false;
            }
        }

        if Self::color_of(Some(node)) == Color::Red
            && (Self::color_of(self.left(node)) == Color::Red || Self::color_of(self.right(node)) == Color::Red)
        {
            log::error!("red node has a red child");
            return false;
        }

        let mut left_height = -1;
        let mut right_height = -1;
        if !self.validate_node(self.left(node), Some(node), &mut left_height, min_node, Some(node)) {
            return false;
        }
        if !self.validate_node(self.right(node), Some(node), &mut right_height, Some(node), max_node) {
            return false;
        }
        if left_height != right_height {
            log::error!("black-height mismatch: left {left_height}, right {right_height}");
            return false;
        }

        *black_height = left_height + if Self::color_of(Some(node)) == Color::Black { 1 } else { 0 };
        true
    }

    /// Black height along the tree's left spine, ignoring any imbalance —
    /// a cheap companion to `validate_tree` for ad hoc inspection.
    pub fn calculate_black_height(&self) -> i32 {
        fn recurse(tree: &FreeTree, node: Option<NonNull<PackedHeader>>) -> i32 {
            match node {
                None => 0,
                Some(n) => recurse(tree, tree.left(n)) + if FreeTree::color_of(Some(n)) == Color::Black { 1 } else { 0 },
            }
        }
        recurse(self, self.root)
    }
}
