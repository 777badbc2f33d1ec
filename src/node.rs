//! Arena node encoding.
//!
//! A node occupies one arena block laid out as 32-bit words:
//!
//! ```text
//! +0   header     tag | terminal | rebuilt | fan count | linear label | prefix_len
//! +4   value_off  (present iff terminal; scaled offset of the value slot)
//!      shape data
//!        Leaf:      nothing
//!        Linear:    one child slot
//!        SmallFan:  k label bytes (padded), k child slots, 2 <= k <= 8
//!        BitmapFan: 256-bit label bitmap, popcount child slots
//!      prefix      compressed edge label bytes, padded to a word
//! ```
//!
//! Everything except child slots and the `REBUILT` header bit is immutable
//! after publication: structural edits build a fresh node and swap exactly
//! one parent child slot (or the root), so a reader holding any slot value
//! sees either the whole old subtree or the whole new one. Child slots are
//! `AtomicU32`s storing scaled offsets; `TAIL` never appears in a published
//! slot.
//!
//! The `REBUILT` bit marks a superseded node. Writers set it before copying
//! the node's slots into a replacement; a writer that CASes a slot inside a
//! node and then finds the bit set must assume the edit was lost and retry
//! from the root. Iterators treat the bit as "retired" and invalidate.

use std::sync::atomic::AtomicU32;

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD};
use crate::pool::TcArena;
use crate::thread_cache::TAIL;

/// Largest small-fan before promotion to the bitmap shape.
pub(crate) const SMALL_FAN_MAX: usize = 8;

/// Longest supported key; bounds `prefix_len` to its 16 header bits.
pub(crate) const MAX_KEY_LEN: usize = 0xFFFF;

const TAG_SHIFT: u32 = 0;
const TAG_MASK: u32 = 0b11;
const TERMINAL_BIT: u32 = 1 << 2;
const REBUILT_BIT: u32 = 1 << 3;
const COUNT_SHIFT: u32 = 4;
const COUNT_MASK: u32 = 0xF;
const LABEL_SHIFT: u32 = 8;
const PREFIX_SHIFT: u32 = 16;

/// Node shapes. The set is closed; see the module docs for layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Shape {
    Leaf = 0,
    Linear = 1,
    SmallFan = 2,
    BitmapFan = 3,
}

impl Shape {
    #[inline(always)]
    fn from_bits(v: u32) -> Self {
        match v & TAG_MASK {
            0 => Self::Leaf,
            1 => Self::Linear,
            2 => Self::SmallFan,
            _ => Self::BitmapFan,
        }
    }
}

/// Decoded header word. Cheap to copy around during a walk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub(crate) shape: Shape,
    pub(crate) terminal: bool,
    pub(crate) rebuilt: bool,
    /// Small-fan child count; unused for other shapes.
    count: usize,
    /// Linear child label; unused for other shapes.
    label: u8,
    pub(crate) prefix_len: usize,
}

impl Header {
    #[inline]
    fn decode(word: u32) -> Self {
        Self {
            shape: Shape::from_bits(word >> TAG_SHIFT),
            terminal: word & TERMINAL_BIT != 0,
            rebuilt: word & REBUILT_BIT != 0,
            count: ((word >> COUNT_SHIFT) & COUNT_MASK) as usize,
            label: (word >> LABEL_SHIFT) as u8,
            prefix_len: (word >> PREFIX_SHIFT) as usize,
        }
    }

    fn encode(
        shape: Shape,
        terminal: bool,
        count: usize,
        label: u8,
        prefix_len: usize,
    ) -> u32 {
        debug_assert!(count <= SMALL_FAN_MAX);
        debug_assert!(prefix_len <= MAX_KEY_LEN);
        (shape as u32)
            | if terminal { TERMINAL_BIT } else { 0 }
            | (count as u32) << COUNT_SHIFT
            | u32::from(label) << LABEL_SHIFT
            | (prefix_len as u32) << PREFIX_SHIFT
    }
}

#[inline(always)]
fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

#[inline(always)]
pub(crate) fn scaled_to_pos(scaled: u32) -> usize {
    (scaled as usize) << 2
}

#[inline(always)]
pub(crate) fn pos_to_scaled(pos: usize) -> u32 {
    debug_assert_eq!(pos & 3, 0);
    (pos >> 2) as u32
}

/// A view over one published node.
#[derive(Clone, Copy)]
pub(crate) struct NodeRef {
    base: *mut u8,
    pos: usize,
}

impl NodeRef {
    /// # Safety
    /// `pos` must be the byte offset of a node in the arena behind `base`.
    #[inline(always)]
    pub(crate) unsafe fn at(base: *mut u8, pos: usize) -> Self {
        debug_assert_eq!(pos & 3, 0);
        Self { base, pos }
    }

    #[inline(always)]
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    fn word(&self, byte_off: usize) -> &AtomicU32 {
        // SAFETY: nodes are word-aligned and fully inside the arena.
        unsafe { &*self.base.add(self.pos + byte_off).cast::<AtomicU32>() }
    }

    #[inline(always)]
    pub(crate) fn header(&self) -> Header {
        Header::decode(self.word(0).load(READ_ORD))
    }

    /// Mark this node superseded. Returns false when another writer got
    /// there first.
    pub(crate) fn try_mark_rebuilt(&self) -> bool {
        let prev = self.word(0).fetch_or(REBUILT_BIT, CAS_SUCCESS);
        prev & REBUILT_BIT == 0
    }

    /// Undo a provisional rebuild mark after a failed publication.
    pub(crate) fn clear_rebuilt(&self) {
        self.word(0).fetch_and(!REBUILT_BIT, CAS_SUCCESS);
    }

    #[inline(always)]
    pub(crate) fn is_rebuilt(&self) -> bool {
        self.word(0).load(READ_ORD) & REBUILT_BIT != 0
    }

    #[inline]
    fn shape_off(&self, hdr: &Header) -> usize {
        4 + if hdr.terminal { 4 } else { 0 }
    }

    /// Scaled offset of the value slot. Node must be terminal.
    #[inline]
    pub(crate) fn value_off(&self, hdr: &Header) -> u32 {
        debug_assert!(hdr.terminal);
        self.word(4).load(READ_ORD)
    }

    pub(crate) fn child_count(&self, hdr: &Header) -> usize {
        match hdr.shape {
            Shape::Leaf => 0,
            Shape::Linear => 1,
            Shape::SmallFan => hdr.count,
            Shape::BitmapFan => {
                let off = self.shape_off(hdr);
                (0..8)
                    .map(|w| self.word(off + w * 4).load(READ_ORD).count_ones() as usize)
                    .sum()
            }
        }
    }

    /// Byte offset (absolute in the arena) of the idx'th child slot.
    fn slot_byte_off(&self, hdr: &Header, idx: usize) -> usize {
        let off = self.shape_off(hdr);
        match hdr.shape {
            Shape::Leaf => unreachable!("leaf has no child slots"),
            Shape::Linear => self.pos + off,
            Shape::SmallFan => self.pos + off + pad4(hdr.count) + idx * 4,
            Shape::BitmapFan => self.pos + off + 32 + idx * 4,
        }
    }

    /// Find the child labelled `label`: `(slot byte offset, scaled child)`.
    pub(crate) fn find_child(&self, hdr: &Header, label: u8) -> Option<(usize, u32)> {
        match hdr.shape {
            Shape::Leaf => None,
            Shape::Linear => {
                if hdr.label == label {
                    let slot = self.slot_byte_off(hdr, 0);
                    Some((slot, self.load_slot(slot)))
                } else {
                    None
                }
            }
            Shape::SmallFan => {
                let off = self.shape_off(hdr);
                for idx in 0..hdr.count {
                    // SAFETY: labels are inside this node's block.
                    let l = unsafe { self.base.add(self.pos + off + idx).read() };
                    if l == label {
                        let slot = self.slot_byte_off(hdr, idx);
                        return Some((slot, self.load_slot(slot)));
                    }
                }
                None
            }
            Shape::BitmapFan => {
                let off = self.shape_off(hdr);
                let word = (label >> 5) as usize;
                let bit = 1u32 << (label & 31);
                let w = self.word(off + word * 4).load(READ_ORD);
                if w & bit == 0 {
                    return None;
                }
                let mut rank = (w & (bit - 1)).count_ones() as usize;
                for i in 0..word {
                    rank += self.word(off + i * 4).load(READ_ORD).count_ones() as usize;
                }
                let slot = self.slot_byte_off(hdr, rank);
                Some((slot, self.load_slot(slot)))
            }
        }
    }

    /// The idx'th child in ascending label order: `(label, slot byte offset,
    /// scaled child)`.
    pub(crate) fn child_at(&self, hdr: &Header, idx: usize) -> (u8, usize, u32) {
        match hdr.shape {
            Shape::Leaf => unreachable!("leaf has no children"),
            Shape::Linear => {
                debug_assert_eq!(idx, 0);
                let slot = self.slot_byte_off(hdr, 0);
                (hdr.label, slot, self.load_slot(slot))
            }
            Shape::SmallFan => {
                debug_assert!(idx < hdr.count);
                let off = self.shape_off(hdr);
                // SAFETY: labels are inside this node's block.
                let label = unsafe { self.base.add(self.pos + off + idx).read() };
                let slot = self.slot_byte_off(hdr, idx);
                (label, slot, self.load_slot(slot))
            }
            Shape::BitmapFan => {
                let off = self.shape_off(hdr);
                let mut remaining = idx;
                for w in 0..8 {
                    let mut bits = self.word(off + w * 4).load(READ_ORD);
                    let ones = bits.count_ones() as usize;
                    if remaining >= ones {
                        remaining -= ones;
                        continue;
                    }
                    for _ in 0..remaining {
                        bits &= bits - 1;
                    }
                    let label = (w * 32 + bits.trailing_zeros() as usize) as u8;
                    let slot = self.slot_byte_off(hdr, idx);
                    return (label, slot, self.load_slot(slot));
                }
                unreachable!("child index out of range");
            }
        }
    }

    /// Index of the first child whose label is `>= label`, if any.
    pub(crate) fn child_lower_bound(&self, hdr: &Header, label: u8) -> Option<usize> {
        let count = self.child_count(hdr);
        for idx in 0..count {
            let (l, _, _) = self.child_at(hdr, idx);
            if l >= label {
                return Some(idx);
            }
        }
        None
    }

    #[inline(always)]
    fn load_slot(&self, slot_byte_off: usize) -> u32 {
        // SAFETY: slot offsets computed from a published header stay inside
        // the node block.
        unsafe { &*self.base.add(slot_byte_off).cast::<AtomicU32>() }.load(READ_ORD)
    }

    /// Compressed edge label of this node.
    pub(crate) fn prefix(&self, hdr: &Header) -> &[u8] {
        let off = self.prefix_byte_off(hdr);
        // SAFETY: the prefix lies inside this node's block, immutable after
        // publication, and the arena outlives every NodeRef.
        unsafe { std::slice::from_raw_parts(self.base.add(self.pos + off), hdr.prefix_len) }
    }

    fn prefix_byte_off(&self, hdr: &Header) -> usize {
        let off = self.shape_off(hdr);
        match hdr.shape {
            Shape::Leaf => off,
            Shape::Linear => off + 4,
            Shape::SmallFan => off + pad4(hdr.count) + hdr.count * 4,
            Shape::BitmapFan => off + 32 + self.child_count(hdr) * 4,
        }
    }

    /// Total block size of this node in bytes.
    pub(crate) fn block_size(&self, hdr: &Header) -> usize {
        self.prefix_byte_off(hdr) + pad4(hdr.prefix_len)
    }

    /// CAS one child slot from `old` to `new`. The release on success is the
    /// publication point of the new subtree.
    pub(crate) fn cas_slot(&self, slot_byte_off: usize, old: u32, new: u32) -> bool {
        debug_assert_ne!(new, TAIL);
        // SAFETY: slot offsets stay inside the node block.
        let slot = unsafe { &*self.base.add(slot_byte_off).cast::<AtomicU32>() };
        slot.compare_exchange(old, new, CAS_SUCCESS, CAS_FAILURE).is_ok()
    }
}

// ----------------------------------------------------------------------
//  Builder
// ----------------------------------------------------------------------

/// Description of a node to build. Children must be sorted by label and
/// non-empty labels pairwise distinct.
pub(crate) struct NodeSpec<'a> {
    pub(crate) prefix: &'a [u8],
    /// `Some(scaled value offset)` makes the node terminal.
    pub(crate) value_off: Option<u32>,
    /// `(label, scaled child offset)` pairs, ascending by label.
    pub(crate) children: &'a [(u8, u32)],
}

impl NodeSpec<'_> {
    fn shape(&self) -> Shape {
        match self.children.len() {
            0 => Shape::Leaf,
            1 => Shape::Linear,
            n if n <= SMALL_FAN_MAX => Shape::SmallFan,
            _ => Shape::BitmapFan,
        }
    }

    fn size(&self) -> usize {
        let k = self.children.len();
        let shape_bytes = match self.shape() {
            Shape::Leaf => 0,
            Shape::Linear => 4,
            Shape::SmallFan => pad4(k) + k * 4,
            Shape::BitmapFan => 32 + k * 4,
        };
        4 + if self.value_off.is_some() { 4 } else { 0 } + shape_bytes + pad4(self.prefix.len())
    }
}

/// Allocate and fully initialise a node; returns its byte offset. The node
/// is unpublished: the caller makes it visible with one slot CAS.
pub(crate) fn build_node(pool: &TcArena, spec: &NodeSpec<'_>) -> Option<usize> {
    debug_assert!(spec.prefix.len() <= MAX_KEY_LEN);
    debug_assert!(spec.value_off.is_some() || !spec.children.is_empty());
    debug_assert!(spec.children.windows(2).all(|w| w[0].0 < w[1].0));
    let shape = spec.shape();
    let size = spec.size();
    let pos = pool.alloc(size)?;
    let k = spec.children.len();
    let hdr = Header::encode(
        shape,
        spec.value_off.is_some(),
        if shape == Shape::SmallFan { k } else { 0 },
        if shape == Shape::Linear {
            spec.children[0].0
        } else {
            0
        },
        spec.prefix.len(),
    );
    // SAFETY: [pos, pos + size) is freshly allocated, thread-private until
    // the caller publishes it.
    unsafe {
        let p = pool.ptr(pos);
        p.cast::<u32>().write(hdr);
        let mut off = 4usize;
        if let Some(v) = spec.value_off {
            p.add(off).cast::<u32>().write(v);
            off += 4;
        }
        match shape {
            Shape::Leaf => {}
            Shape::Linear => {
                p.add(off).cast::<u32>().write(spec.children[0].1);
                off += 4;
            }
            Shape::SmallFan => {
                for (i, &(label, _)) in spec.children.iter().enumerate() {
                    p.add(off + i).write(label);
                }
                for i in k..pad4(k) {
                    p.add(off + i).write(0);
                }
                off += pad4(k);
                for &(_, child) in spec.children {
                    p.add(off).cast::<u32>().write(child);
                    off += 4;
                }
            }
            Shape::BitmapFan => {
                let mut bitmap = [0u32; 8];
                for &(label, _) in spec.children {
                    bitmap[(label >> 5) as usize] |= 1 << (label & 31);
                }
                for w in bitmap {
                    p.add(off).cast::<u32>().write(w);
                    off += 4;
                }
                for &(_, child) in spec.children {
                    p.add(off).cast::<u32>().write(child);
                    off += 4;
                }
            }
        }
        std::ptr::copy_nonoverlapping(spec.prefix.as_ptr(), p.add(off), spec.prefix.len());
        for i in spec.prefix.len()..pad4(spec.prefix.len()) {
            p.add(off + i).write(0);
        }
    }
    Some(pos)
}

/// Root publication helper: the root cell is an `AtomicU32` on the trie, not
/// an in-arena slot, but follows the same release discipline.
pub(crate) fn cas_root(root: &AtomicU32, old: u32, new: u32) -> bool {
    root.compare_exchange(old, new, CAS_SUCCESS, CAS_FAILURE).is_ok()
}

/// Store a fully-initialised value into a fresh arena slot; returns the
/// scaled offset. Zero-size values share a dummy slot at offset 0 meaning
/// "present, empty".
pub(crate) fn store_value(pool: &TcArena, value: &[u8]) -> Option<u32> {
    if value.is_empty() {
        return Some(0);
    }
    let pos = pool.alloc(value.len())?;
    // SAFETY: fresh allocation, thread-private.
    unsafe {
        std::ptr::copy_nonoverlapping(value.as_ptr(), pool.ptr(pos), value.len());
    }
    Some(pos_to_scaled(pos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn arena() -> TcArena {
        TcArena::new(1 << 20, &Config::default()).unwrap()
    }

    fn node(pool: &TcArena, spec: &NodeSpec<'_>) -> NodeRef {
        let pos = build_node(pool, spec).unwrap();
        // SAFETY: pos was just returned by build_node.
        unsafe { NodeRef::at(pool.base(), pos) }
    }

    #[test]
    fn leaf_roundtrip() {
        let pool = arena();
        let n = node(
            &pool,
            &NodeSpec {
                prefix: b"hello",
                value_off: Some(7),
                children: &[],
            },
        );
        let hdr = n.header();
        assert_eq!(hdr.shape, Shape::Leaf);
        assert!(hdr.terminal);
        assert!(!hdr.rebuilt);
        assert_eq!(n.prefix(&hdr), b"hello");
        assert_eq!(n.value_off(&hdr), 7);
        assert_eq!(n.child_count(&hdr), 0);
    }

    #[test]
    fn linear_child_lookup() {
        let pool = arena();
        let n = node(
            &pool,
            &NodeSpec {
                prefix: b"",
                value_off: None,
                children: &[(b'x', 99)],
            },
        );
        let hdr = n.header();
        assert_eq!(hdr.shape, Shape::Linear);
        assert!(!hdr.terminal);
        let (_, child) = n.find_child(&hdr, b'x').unwrap();
        assert_eq!(child, 99);
        assert!(n.find_child(&hdr, b'y').is_none());
        assert_eq!(n.child_at(&hdr, 0).0, b'x');
    }

    #[test]
    fn small_fan_sorted_lookup() {
        let pool = arena();
        let children: Vec<(u8, u32)> = vec![(b'a', 1), (b'c', 3), (b'f', 6), (b'z', 26)];
        let n = node(
            &pool,
            &NodeSpec {
                prefix: b"pre",
                value_off: Some(42),
                children: &children,
            },
        );
        let hdr = n.header();
        assert_eq!(hdr.shape, Shape::SmallFan);
        assert_eq!(n.child_count(&hdr), 4);
        assert_eq!(n.prefix(&hdr), b"pre");
        for &(label, child) in &children {
            let (_, got) = n.find_child(&hdr, label).unwrap();
            assert_eq!(got, child);
        }
        assert!(n.find_child(&hdr, b'b').is_none());
        // Ascending iteration and lower bound.
        let labels: Vec<u8> = (0..4).map(|i| n.child_at(&hdr, i).0).collect();
        assert_eq!(labels, vec![b'a', b'c', b'f', b'z']);
        assert_eq!(n.child_lower_bound(&hdr, b'b'), Some(1));
        assert_eq!(n.child_lower_bound(&hdr, b'z'), Some(3));
        assert_eq!(n.child_lower_bound(&hdr, b'z' + 1), None);
    }

    #[test]
    fn bitmap_fan_rank_lookup() {
        let pool = arena();
        let children: Vec<(u8, u32)> = (0..=255u8)
            .step_by(7)
            .map(|l| (l, u32::from(l) + 1000))
            .collect();
        let n = node(
            &pool,
            &NodeSpec {
                prefix: b"",
                value_off: None,
                children: &children,
            },
        );
        let hdr = n.header();
        assert_eq!(hdr.shape, Shape::BitmapFan);
        assert_eq!(n.child_count(&hdr), children.len());
        for (idx, &(label, child)) in children.iter().enumerate() {
            let (_, got) = n.find_child(&hdr, label).unwrap();
            assert_eq!(got, child);
            let (l, _, c) = n.child_at(&hdr, idx);
            assert_eq!((l, c), (label, child));
        }
        assert!(n.find_child(&hdr, 1).is_none());
        assert_eq!(n.child_lower_bound(&hdr, 1), Some(1));
    }

    #[test]
    fn slot_cas_swaps_single_child() {
        let pool = arena();
        let n = node(
            &pool,
            &NodeSpec {
                prefix: b"",
                value_off: None,
                children: &[(b'k', 5), (b'm', 9)],
            },
        );
        let hdr = n.header();
        let (slot, old) = n.find_child(&hdr, b'm').unwrap();
        assert_eq!(old, 9);
        assert!(n.cas_slot(slot, 9, 77));
        assert!(!n.cas_slot(slot, 9, 78));
        let (_, now) = n.find_child(&hdr, b'm').unwrap();
        assert_eq!(now, 77);
        // The sibling is untouched.
        assert_eq!(n.find_child(&hdr, b'k').unwrap().1, 5);
    }

    #[test]
    fn rebuilt_bit_set_and_clear() {
        let pool = arena();
        let n = node(
            &pool,
            &NodeSpec {
                prefix: b"q",
                value_off: Some(1),
                children: &[],
            },
        );
        assert!(!n.is_rebuilt());
        assert!(n.try_mark_rebuilt());
        assert!(!n.try_mark_rebuilt());
        assert!(n.is_rebuilt());
        n.clear_rebuilt();
        assert!(!n.is_rebuilt());
        // The rest of the header survives the bit churn.
        let hdr = n.header();
        assert_eq!(n.prefix(&hdr), b"q");
        assert!(hdr.terminal);
    }

    #[test]
    fn block_size_matches_layout() {
        let pool = arena();
        for children in [0usize, 1, 3, 8, 20] {
            let kids: Vec<(u8, u32)> = (0..children).map(|i| (i as u8, i as u32 + 1)).collect();
            let spec = NodeSpec {
                prefix: b"abcde",
                value_off: Some(3),
                children: &kids,
            };
            let n = node(&pool, &spec);
            let hdr = n.header();
            assert_eq!(n.block_size(&hdr), spec.size());
            assert_eq!(n.prefix(&hdr), b"abcde");
        }
    }
}
