//! Ordered iteration.
//!
//! A [`CursorToken`] is a reader token specialised with a descent stack and
//! a running key buffer. Keys come back in lexicographic order; a node's own
//! key (when terminal) precedes the keys of its children, and children are
//! visited in ascending label order, so the walk is a plain preorder.
//!
//! While the underlying token stays acquired, concurrent edits may land in
//! parts of the tree the cursor has not visited; the cursor keeps serving
//! its snapshot. Detecting a superseded node (`REBUILT` header bit) on the
//! current position makes the cursor stale: `is_valid` turns false and
//! movement fails until the next seek.

use std::sync::Arc;

use crate::node::{scaled_to_pos, Header, NodeRef};
use crate::ordering::WRITE_ORD;
use crate::thread_cache::TAIL;
use crate::token::{TokenState, NO_VALUE};
use crate::trie::{Patricia, ReaderToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    /// No position: fresh cursor, or a seek found nothing.
    Unseeked,

    /// Positioned on a terminal node; `word()` and `value()` are live.
    At,

    /// The node under the cursor was superseded; re-seek to recover.
    Stale,
}

struct PathEnt {
    /// Scaled offset of the node.
    node: u32,

    /// Ordinal of the child the walk descended into, when it did.
    child_idx: usize,

    /// `word` length with this node's prefix appended (the full key up to
    /// and including this node).
    word_end: usize,
}

/// An ordered cursor over a [`Patricia`] trie.
///
/// Not `Send`: like every token it belongs to the thread that created it.
pub struct CursorToken {
    reader: ReaderToken,
    path: Vec<PathEnt>,
    word: Vec<u8>,
    state: CursorState,
}

impl Patricia {
    /// A fresh cursor, unacquired and unpositioned.
    pub fn cursor(self: &Arc<Self>) -> CursorToken {
        CursorToken {
            reader: self.reader_token(),
            path: Vec::new(),
            word: Vec::new(),
            state: CursorState::Unseeked,
        }
    }
}

impl CursorToken {
    /// Enter the acquired state. Movement is only legal while acquired.
    pub fn acquire(&mut self) {
        self.reader.acquire();
        self.state = CursorState::Unseeked;
    }

    /// Release; the cursor loses its position.
    pub fn release(&mut self) {
        self.reset();
        self.reader.release();
    }

    /// True while the cursor holds a live position.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state == CursorState::At && self.reader.is_valid()
    }

    /// The key under the cursor.
    #[must_use]
    pub fn word(&self) -> &[u8] {
        debug_assert_eq!(self.state, CursorState::At);
        &self.word
    }

    /// The value under the cursor.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        if self.state != CursorState::At {
            return None;
        }
        self.reader.value()
    }

    /// Position on the smallest key. Returns false when the trie is empty.
    pub fn seek_begin(&mut self) -> bool {
        self.reset();
        let root = self.trie().root_scaled();
        if root == TAIL {
            return false;
        }
        self.descend_min(root);
        true
    }

    /// Position on the largest key. Returns false when the trie is empty.
    pub fn seek_end(&mut self) -> bool {
        self.reset();
        let root = self.trie().root_scaled();
        if root == TAIL {
            return false;
        }
        self.descend_max(root);
        true
    }

    /// Position on the smallest key `>= key`. Returns false (and loses the
    /// position) when every key is smaller.
    pub fn seek_lower_bound(&mut self, key: &[u8]) -> bool {
        self.reset();
        let mut cur = self.trie().root_scaled();
        if cur == TAIL {
            return false;
        }
        let mut rest = key;
        loop {
            let node = self.node(cur);
            let hdr = node.header();
            self.enter(cur, &node, &hdr);
            let prefix = node.prefix(&hdr);
            let common = common_prefix(rest, prefix);
            if common < hdr.prefix_len {
                if common == rest.len() || rest[common] < prefix[common] {
                    // Every key in this subtree sorts at or after the
                    // target.
                    return self.finish_min();
                }
                // Every key in this subtree sorts before the target.
                return self.advance_to_next_subtree();
            }
            rest = &rest[common..];
            if rest.is_empty() {
                return self.finish_min();
            }
            let label = rest[0];
            match node.child_lower_bound(&hdr, label) {
                None => return self.advance_to_next_subtree(),
                Some(idx) => {
                    let (l, _, child) = node.child_at(&hdr, idx);
                    self.last_mut().child_idx = idx;
                    self.word.push(l);
                    if l == label {
                        rest = &rest[1..];
                        cur = child;
                        continue;
                    }
                    self.descend_min(child);
                    return true;
                }
            }
        }
    }

    /// Step to the successor key. Clamps at the last key (returns false,
    /// position kept).
    pub fn incr(&mut self) -> bool {
        if self.state != CursorState::At {
            return false;
        }
        let ent = self.path.last().expect("positioned cursor has a path");
        let node = self.node(ent.node);
        if node.is_rebuilt() {
            self.state = CursorState::Stale;
            return false;
        }
        let hdr = node.header();
        if node.child_count(&hdr) > 0 {
            let (label, _, child) = node.child_at(&hdr, 0);
            self.last_mut().child_idx = 0;
            self.word.push(label);
            self.descend_min(child);
            return true;
        }
        self.advance_to_next_subtree()
    }

    /// Step to the predecessor key. Clamps at the first key (returns false,
    /// position kept).
    pub fn decr(&mut self) -> bool {
        if self.state != CursorState::At {
            return false;
        }
        if self
            .path
            .last()
            .map(|e| self.node(e.node).is_rebuilt())
            .unwrap_or(true)
        {
            self.state = CursorState::Stale;
            return false;
        }
        let mut i = self.path.len() - 1;
        loop {
            if i == 0 {
                // Already on the first key of the tree.
                return false;
            }
            let parent_idx = i - 1;
            let child_idx = self.path[parent_idx].child_idx;
            let pnode = self.node(self.path[parent_idx].node);
            let phdr = pnode.header();
            if child_idx > 0 {
                self.path.truncate(parent_idx + 1);
                self.word.truncate(self.path[parent_idx].word_end);
                self.path[parent_idx].child_idx = child_idx - 1;
                let (label, _, child) = pnode.child_at(&phdr, child_idx - 1);
                self.word.push(label);
                self.descend_max(child);
                return true;
            }
            if phdr.terminal {
                self.path.truncate(parent_idx + 1);
                self.word.truncate(self.path[parent_idx].word_end);
                self.set_at(&pnode, &phdr);
                return true;
            }
            i -= 1;
        }
    }

    // ------------------------------------------------------------------
    //  Internals
    // ------------------------------------------------------------------

    fn trie(&self) -> &Arc<Patricia> {
        self.reader.trie()
    }

    fn node(&self, scaled: u32) -> NodeRef {
        // SAFETY: scaled offsets on the path came from published slots.
        unsafe { NodeRef::at(self.trie().pool().base(), scaled_to_pos(scaled)) }
    }

    fn reset(&mut self) {
        debug_assert!(matches!(
            self.reader.core().state(),
            TokenState::AcquireDone | TokenState::AcquireIdle | TokenState::AcquireLock
        ));
        self.path.clear();
        self.word.clear();
        self.state = CursorState::Unseeked;
        self.reader.core().value_pos.store(NO_VALUE, WRITE_ORD);
    }

    fn last_mut(&mut self) -> &mut PathEnt {
        self.path.last_mut().expect("path is non-empty")
    }

    fn enter(&mut self, cur: u32, node: &NodeRef, hdr: &Header) {
        self.word.extend_from_slice(node.prefix(hdr));
        self.path.push(PathEnt {
            node: cur,
            child_idx: usize::MAX,
            word_end: self.word.len(),
        });
    }

    fn set_at(&mut self, node: &NodeRef, hdr: &Header) {
        debug_assert!(hdr.terminal);
        self.reader
            .core()
            .value_pos
            .store(scaled_to_pos(node.value_off(hdr)), WRITE_ORD);
        self.state = CursorState::At;
    }

    /// Walk to the smallest terminal under `cur`, entering every node.
    fn descend_min(&mut self, mut cur: u32) {
        loop {
            let node = self.node(cur);
            let hdr = node.header();
            self.enter(cur, &node, &hdr);
            if hdr.terminal {
                self.set_at(&node, &hdr);
                return;
            }
            let (label, _, child) = node.child_at(&hdr, 0);
            self.last_mut().child_idx = 0;
            self.word.push(label);
            cur = child;
        }
    }

    /// Walk to the largest terminal under `cur` (the deepest rightmost
    /// leaf).
    fn descend_max(&mut self, mut cur: u32) {
        loop {
            let node = self.node(cur);
            let hdr = node.header();
            self.enter(cur, &node, &hdr);
            let count = node.child_count(&hdr);
            if count == 0 {
                self.set_at(&node, &hdr);
                return;
            }
            let (label, _, child) = node.child_at(&hdr, count - 1);
            self.last_mut().child_idx = count - 1;
            self.word.push(label);
            cur = child;
        }
    }

    /// From the entered (but not yet positioned) last node: position on its
    /// own key when terminal, otherwise on its subtree minimum.
    fn finish_min(&mut self) -> bool {
        let ent = self.path.last().expect("entered node");
        let node = self.node(ent.node);
        let hdr = node.header();
        if hdr.terminal {
            self.set_at(&node, &hdr);
            return true;
        }
        let (label, _, child) = node.child_at(&hdr, 0);
        self.last_mut().child_idx = 0;
        self.word.push(label);
        self.descend_min(child);
        true
    }

    /// Abandon the current node's subtree and move to the next subtree in
    /// preorder. Keeps the position (and returns false) when none exists.
    fn advance_to_next_subtree(&mut self) -> bool {
        let mut i = self.path.len();
        let mut target = None;
        while i > 1 {
            let parent = &self.path[i - 2];
            let pnode = self.node(parent.node);
            let phdr = pnode.header();
            if parent.child_idx + 1 < pnode.child_count(&phdr) {
                target = Some(i - 2);
                break;
            }
            i -= 1;
        }
        let Some(pi) = target else {
            // No successor subtree anywhere up the path.
            if self.state != CursorState::At {
                self.reset();
            }
            return false;
        };
        self.path.truncate(pi + 1);
        self.word.truncate(self.path[pi].word_end);
        let idx = self.path[pi].child_idx + 1;
        self.path[pi].child_idx = idx;
        let pnode = self.node(self.path[pi].node);
        let phdr = pnode.header();
        let (label, _, child) = pnode.child_at(&phdr, idx);
        self.word.push(label);
        self.descend_min(child);
        true
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    let n = a.len().min(b.len());
    let mut i = 0;
    while i < n && a[i] == b[i] {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::ConcurrentLevel;

    fn filled_trie(keys: &[&[u8]]) -> Arc<Patricia> {
        let trie = Patricia::new(4, 1 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();
        let mut w = trie.writer_token();
        w.acquire();
        for (i, key) in keys.iter().enumerate() {
            let newly = w.insert(key, &(i as u32).to_le_bytes()).unwrap();
            assert!(newly && w.has_value());
        }
        w.release();
        trie
    }

    fn collect_forward(trie: &Arc<Patricia>) -> Vec<Vec<u8>> {
        let mut cur = trie.cursor();
        cur.acquire();
        let mut out = Vec::new();
        if cur.seek_begin() {
            loop {
                out.push(cur.word().to_vec());
                if !cur.incr() {
                    break;
                }
            }
        }
        cur.release();
        out
    }

    #[test]
    fn forward_iteration_is_sorted() {
        let keys: Vec<&[u8]> = vec![
            b"b", b"a", b"ab", b"", b"abc", b"aa", b"zzz", b"z", b"ba",
        ];
        let trie = filled_trie(&keys);
        let mut sorted: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        sorted.sort();
        assert_eq!(collect_forward(&trie), sorted);
    }

    #[test]
    fn backward_iteration_mirrors_forward() {
        let keys: Vec<&[u8]> = vec![b"apple", b"app", b"apply", b"banana", b"band", b"b"];
        let trie = filled_trie(&keys);
        let forward = collect_forward(&trie);

        let mut cur = trie.cursor();
        cur.acquire();
        assert!(cur.seek_end());
        let mut backward = vec![cur.word().to_vec()];
        while cur.decr() {
            backward.push(cur.word().to_vec());
        }
        backward.reverse();
        assert_eq!(backward, forward);
        cur.release();
    }

    #[test]
    fn incr_decr_are_inverse() {
        let keys: Vec<&[u8]> = vec![b"a", b"ab", b"abc", b"b", b"ba", b"c"];
        let trie = filled_trie(&keys);
        let mut cur = trie.cursor();
        cur.acquire();
        assert!(cur.seek_lower_bound(b"ab"));
        assert_eq!(cur.word(), b"ab");
        assert!(cur.incr());
        assert_eq!(cur.word(), b"abc");
        assert!(cur.decr());
        assert_eq!(cur.word(), b"ab");

        // Clamped at both ends.
        assert!(cur.seek_end());
        assert_eq!(cur.word(), b"c");
        assert!(!cur.incr());
        assert_eq!(cur.word(), b"c");
        assert!(cur.seek_begin());
        assert!(!cur.decr());
        assert_eq!(cur.word(), b"a");
        cur.release();
    }

    #[test]
    fn lower_bound_variants() {
        let keys: Vec<&[u8]> = vec![b"app", b"apple", b"apply", b"box"];
        let trie = filled_trie(&keys);
        let mut cur = trie.cursor();
        cur.acquire();

        assert!(cur.seek_lower_bound(b"app"));
        assert_eq!(cur.word(), b"app");

        assert!(cur.seek_lower_bound(b"appl"));
        assert_eq!(cur.word(), b"apple");

        assert!(cur.seek_lower_bound(b"applz"));
        assert_eq!(cur.word(), b"box");

        assert!(cur.seek_lower_bound(b"apples"));
        assert_eq!(cur.word(), b"apply");

        assert!(cur.seek_lower_bound(b""));
        assert_eq!(cur.word(), b"app");

        assert!(cur.seek_lower_bound(b"b"));
        assert_eq!(cur.word(), b"box");

        assert!(!cur.seek_lower_bound(b"boy"));
        cur.release();
    }

    #[test]
    fn empty_trie_has_no_positions() {
        let trie = Patricia::new(4, 1 << 20, ConcurrentLevel::OneWriteMultiRead).unwrap();
        let mut cur = trie.cursor();
        cur.acquire();
        assert!(!cur.seek_begin());
        assert!(!cur.seek_end());
        assert!(!cur.seek_lower_bound(b"x"));
        assert!(!cur.incr());
        assert!(!cur.decr());
        assert!(!cur.is_valid());
        cur.release();
    }

    #[test]
    fn values_follow_the_cursor() {
        let keys: Vec<&[u8]> = vec![b"k1", b"k2", b"k3"];
        let trie = filled_trie(&keys);
        let mut cur = trie.cursor();
        cur.acquire();
        assert!(cur.seek_begin());
        let mut seen = Vec::new();
        loop {
            let v = u32::from_le_bytes(cur.value().unwrap().try_into().unwrap());
            seen.push((cur.word().to_vec(), v));
            if !cur.incr() {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                (b"k1".to_vec(), 0),
                (b"k2".to_vec(), 1),
                (b"k3".to_vec(), 2)
            ]
        );
        cur.release();
    }
}
