//! The concurrent Patricia trie.
//!
//! `Patricia` maps byte-string keys to fixed-size values stored in a
//! [`TcArena`]. All structural edits (`fork`, `split`, `mark_final`,
//! `add_state_move`) build fully-initialised replacement nodes and publish
//! them with exactly one child-slot (or root) CAS, then bump `verseq` and
//! push the superseded block on the retirement queue tagged with the new
//! verseq. Retired blocks are recycled only once every token acquired at or
//! before that verseq has been released.
//!
//! # Multi-writer publication
//!
//! Replacing a node races with slot CASes *inside* that node. A rebuilder
//! claims the node by setting its `REBUILT` header bit before copying its
//! slots; a writer that CASes a slot and then observes the bit must treat
//! the edit as possibly lost, re-walk, and either adopt the surviving copy
//! or retry. An edit whose post-CAS check sees the bit clear is durable.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::{
    build_node, cas_root, pos_to_scaled, scaled_to_pos, store_value, NodeRef, NodeSpec,
    MAX_KEY_LEN,
};
use crate::ordering::{READ_ORD, STAT_ORD, WRITE_ORD};
use crate::pool::TcArena;
use crate::thread_cache::TAIL;
use crate::token::{
    acquire_core, dispose_core, release_core, TokenCore, TokenQueue, TokenState, NO_VALUE,
};
use crate::tracing_helpers::log_event;

static NEXT_TRIE_ID: AtomicU64 = AtomicU64::new(1);

/// Declared concurrency capability of a trie instance, in strictly
/// increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConcurrentLevel {
    /// Immutable: zero writers, any readers, no token machinery.
    NoWriteReadOnly = 0,

    /// One thread total; retired blocks recycle immediately.
    SingleThreadStrict = 1,

    /// One thread writing, tokens keep iterators valid across edits.
    SingleThreadShared = 2,

    /// One writer thread, many reader threads.
    OneWriteMultiRead = 3,

    /// Many writers, many readers.
    MultiWriteMultiRead = 4,
}

impl ConcurrentLevel {
    /// Whether tokens participate in the retirement queue.
    #[inline(always)]
    fn queued(self) -> bool {
        self >= Self::SingleThreadShared
    }
}

/// Structural edit counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub n_fork: usize,
    pub n_split: usize,
    pub n_mark_final: usize,
    pub n_add_state_move: usize,
}

impl Stat {
    #[must_use]
    pub fn sum(&self) -> usize {
        self.n_fork + self.n_split + self.n_mark_final + self.n_add_state_move
    }
}

/// Arena and retirement statistics snapshot.
#[derive(Debug, Clone)]
pub struct MemStat {
    /// Free block count per fastbin size class.
    pub fastbin: Vec<usize>,
    pub used_size: usize,
    pub capacity: usize,
    /// Free bytes cached across all threads, hot regions included.
    pub frag_size: usize,
    pub huge_size: usize,
    pub huge_cnt: usize,
    pub lazy_free_sum: usize,
    pub lazy_free_cnt: usize,
}

struct LazyFreeItem {
    tag: u64,
    pos: u32,
    len: u32,
}

/// A concurrent in-memory Patricia trie over an offset-addressed arena.
pub struct Patricia {
    pool: TcArena,
    valsize: usize,
    level: ConcurrentLevel,
    readonly: AtomicBool,

    /// Scaled offset of the root node; `TAIL` while the trie is empty.
    root: AtomicU32,

    /// Monotonic structural edit counter.
    verseq: AtomicU64,

    /// Everything retired below this verseq has been recycled.
    freed_below: AtomicU64,

    n_words: AtomicUsize,
    n_fork: AtomicUsize,
    n_split: AtomicUsize,
    n_mark_final: AtomicUsize,
    n_add_state_move: AtomicUsize,

    queue: TokenQueue,
    lazy: Mutex<VecDeque<LazyFreeItem>>,
    lazy_cnt: AtomicUsize,
    lazy_sum: AtomicUsize,

    id: u64,
}

// ----------------------------------------------------------------------
//  Construction
// ----------------------------------------------------------------------

impl Patricia {
    /// Create a trie with `valsize`-byte values over an arena of at most
    /// `max_mem` bytes.
    pub fn new(
        valsize: usize,
        max_mem: usize,
        level: ConcurrentLevel,
    ) -> Result<Arc<Self>> {
        Self::with_config(valsize, max_mem, level, &Config::default())
    }

    /// [`Patricia::new`] with tuning passed as a `key=value` config string,
    /// e.g. `"hugepage=transparent,vm_explicit_commit=1"`.
    pub fn with_config_str(
        valsize: usize,
        max_mem: usize,
        level: ConcurrentLevel,
        conf: &str,
    ) -> Result<Arc<Self>> {
        Self::with_config(valsize, max_mem, level, &Config::parse(conf)?)
    }

    /// [`Patricia::new`] with explicit arena tuning.
    pub fn with_config(
        valsize: usize,
        max_mem: usize,
        level: ConcurrentLevel,
        cfg: &Config,
    ) -> Result<Arc<Self>> {
        if valsize > u32::MAX as usize / 2 {
            return Err(Error::InvalidArgument("valsize too large"));
        }
        let pool = TcArena::new(max_mem, cfg)?;
        Ok(Arc::new(Self::assemble(
            pool,
            valsize,
            level,
            TAIL,
            1,
            0,
            Stat::default(),
        )))
    }

    pub(crate) fn assemble(
        pool: TcArena,
        valsize: usize,
        level: ConcurrentLevel,
        root: u32,
        verseq: u64,
        n_words: usize,
        stat: Stat,
    ) -> Self {
        Self {
            pool,
            valsize,
            level,
            readonly: AtomicBool::new(level == ConcurrentLevel::NoWriteReadOnly),
            root: AtomicU32::new(root),
            verseq: AtomicU64::new(verseq),
            freed_below: AtomicU64::new(verseq),
            n_words: AtomicUsize::new(n_words),
            n_fork: AtomicUsize::new(stat.n_fork),
            n_split: AtomicUsize::new(stat.n_split),
            n_mark_final: AtomicUsize::new(stat.n_mark_final),
            n_add_state_move: AtomicUsize::new(stat.n_add_state_move),
            queue: TokenQueue::new(),
            lazy: Mutex::new(VecDeque::new()),
            lazy_cnt: AtomicUsize::new(0),
            lazy_sum: AtomicUsize::new(0),
            id: NEXT_TRIE_ID.fetch_add(1, STAT_ORD),
        }
    }

    // ------------------------------------------------------------------
    //  Introspection
    // ------------------------------------------------------------------

    #[inline(always)]
    pub fn concurrent_level(&self) -> ConcurrentLevel {
        self.level
    }

    #[inline(always)]
    pub fn get_valsize(&self) -> usize {
        self.valsize
    }

    #[inline(always)]
    pub fn mem_align_size(&self) -> usize {
        self.pool.align_size()
    }

    #[inline(always)]
    pub fn num_words(&self) -> usize {
        self.n_words.load(STAT_ORD)
    }

    #[inline(always)]
    pub fn mem_size(&self) -> usize {
        self.pool.used()
    }

    #[inline(always)]
    pub fn mem_capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Flushed fragmentation counter; lags per-thread drift.
    #[inline(always)]
    pub fn mem_frag_size(&self) -> usize {
        self.pool.frag_size()
    }

    /// Exact free bytes across all thread caches, hot windows included.
    pub fn pool_free_size(&self) -> usize {
        self.pool.slow_get_free_size()
    }

    pub fn trie_stat(&self) -> Stat {
        Stat {
            n_fork: self.n_fork.load(STAT_ORD),
            n_split: self.n_split.load(STAT_ORD),
            n_mark_final: self.n_mark_final.load(STAT_ORD),
            n_add_state_move: self.n_add_state_move.load(STAT_ORD),
        }
    }

    /// Flush thread-cache drift and return the structural counters.
    pub fn sync_stat(&self) -> Stat {
        self.pool.sync_frag_size();
        self.trie_stat()
    }

    pub fn mem_get_stat(&self) -> MemStat {
        let (huge_cnt, huge_size) = self.pool.huge_stat();
        MemStat {
            fastbin: self.pool.fastbin_histogram(),
            used_size: self.pool.used(),
            capacity: self.pool.capacity(),
            frag_size: self.pool.slow_get_free_size(),
            huge_size,
            huge_cnt,
            lazy_free_sum: self.lazy_sum.load(STAT_ORD),
            lazy_free_cnt: self.lazy_cnt.load(STAT_ORD),
        }
    }

    /// Tokens currently on the retirement queue.
    #[inline(always)]
    pub fn token_qlen(&self) -> usize {
        self.queue.qlen()
    }

    /// Pre-commit roughly `bytes` of arena into this thread's hot region.
    pub fn mempool_tc_populate(&self, bytes: usize) {
        self.pool.tc_populate(bytes);
    }

    pub(crate) fn pool(&self) -> &TcArena {
        &self.pool
    }

    pub(crate) fn root_scaled(&self) -> u32 {
        self.root.load(READ_ORD)
    }

    pub(crate) fn verseq_now(&self) -> u64 {
        self.verseq.load(READ_ORD)
    }

    // ------------------------------------------------------------------
    //  Freeze
    // ------------------------------------------------------------------

    /// One-way transition after which no writer succeeds. Readers and live
    /// iterators are unaffected.
    pub fn set_readonly(&self) {
        self.readonly.store(true, WRITE_ORD);
    }

    #[inline(always)]
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(READ_ORD)
    }

    // ------------------------------------------------------------------
    //  Lookup
    // ------------------------------------------------------------------

    /// Walk `key` from the root; on a hit, publish the value offset onto the
    /// token.
    pub fn lookup(&self, key: &[u8], token: &mut ReaderToken) -> bool {
        debug_assert_eq!(token.trie.id, self.id, "token belongs to another trie");
        self.lookup_core(key, token.core())
    }

    pub(crate) fn lookup_core(&self, key: &[u8], core: &TokenCore) -> bool {
        debug_assert!(matches!(
            core.state(),
            TokenState::AcquireDone | TokenState::AcquireIdle | TokenState::AcquireLock
        ));
        match self.lookup_raw(key) {
            Some(value_pos) => {
                core.value_pos.store(value_pos, WRITE_ORD);
                true
            }
            None => {
                core.value_pos.store(NO_VALUE, WRITE_ORD);
                false
            }
        }
    }

    /// Tokenless walk; returns the byte offset of the value slot.
    pub(crate) fn lookup_raw(&self, key: &[u8]) -> Option<usize> {
        let base = self.pool.base();
        let mut cur = self.root.load(READ_ORD);
        let mut rest = key;
        loop {
            if cur == TAIL {
                return None;
            }
            // SAFETY: published child slots always hold live node offsets.
            let node = unsafe { NodeRef::at(base, scaled_to_pos(cur)) };
            let hdr = node.header();
            let prefix = node.prefix(&hdr);
            if rest.len() < prefix.len() || &rest[..prefix.len()] != prefix {
                return None;
            }
            rest = &rest[prefix.len()..];
            if rest.is_empty() {
                return if hdr.terminal {
                    Some(scaled_to_pos(node.value_off(&hdr)))
                } else {
                    None
                };
            }
            match node.find_child(&hdr, rest[0]) {
                Some((_, child)) => {
                    cur = child;
                    rest = &rest[1..];
                }
                None => return None,
            }
        }
    }

    // ------------------------------------------------------------------
    //  Insert
    // ------------------------------------------------------------------

    /// Insert `key` with `value`.
    ///
    /// Returns `Ok(true)` when the key was newly inserted and `Ok(false)`
    /// when it already existed; either way the token's value points at the
    /// authoritative slot. The exception is arena exhaustion, which reports
    /// `Ok(true)` with **no** value on the token (see
    /// [`WriterToken::has_value`]).
    pub fn insert(&self, key: &[u8], value: &[u8], token: &mut WriterToken) -> Result<bool> {
        debug_assert_eq!(token.trie.id, self.id, "token belongs to another trie");
        self.insert_core(key, value, token.core())
    }

    pub(crate) fn insert_core(&self, key: &[u8], value: &[u8], core: &TokenCore) -> Result<bool> {
        if self.level == ConcurrentLevel::NoWriteReadOnly || self.is_readonly() {
            return Err(Error::Readonly);
        }
        if value.len() != self.valsize {
            return Err(Error::InvalidArgument("value length != valsize"));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(Error::InvalidArgument("key too long"));
        }
        debug_assert_eq!(core.state(), TokenState::AcquireDone);

        if self.level == ConcurrentLevel::MultiWriteMultiRead {
            // Stash the key for uncertain-publication resolution.
            RESOLVE_KEY.with(|k| {
                let mut k = k.borrow_mut();
                k.clear();
                k.extend_from_slice(key);
            });
        }
        loop {
            match self.try_insert_once(key, value) {
                Attempt::Inserted { value_pos, verseq } => {
                    core.value_pos.store(value_pos, WRITE_ORD);
                    // The writer observes only current state from here on;
                    // advancing its age lets reclamation proceed under a
                    // long-held writer token.
                    core.live_verseq.store(verseq, WRITE_ORD);
                    self.reclaim();
                    return Ok(true);
                }
                Attempt::Exists { value_pos } => {
                    core.value_pos.store(value_pos, WRITE_ORD);
                    return Ok(false);
                }
                Attempt::OutOfMemory => {
                    // Reported as "newly inserted, no value": the caller
                    // distinguishes OOM from a plain miss through the token.
                    core.value_pos.store(NO_VALUE, WRITE_ORD);
                    return Ok(true);
                }
                Attempt::Retry => {}
            }
        }
    }

    fn try_insert_once(&self, key: &[u8], value: &[u8]) -> Attempt {
        let base = self.pool.base();
        let mut slot = SlotLoc::Root;
        let mut cur = self.root.load(READ_ORD);
        let mut rest = key;
        loop {
            if cur == TAIL {
                return self.insert_first(rest, value);
            }
            // SAFETY: published offsets reference live nodes.
            let node = unsafe { NodeRef::at(base, scaled_to_pos(cur)) };
            let hdr = node.header();
            if hdr.rebuilt {
                // Superseded while we walked; start over on the fresh tree.
                return Attempt::Retry;
            }
            let prefix = node.prefix(&hdr);
            let common = common_prefix(rest, prefix);
            if common < prefix.len() {
                return if common == rest.len() {
                    self.do_split(slot, node, hdr, common, value)
                } else {
                    self.do_fork(slot, node, hdr, common, rest, value)
                };
            }
            rest = &rest[prefix.len()..];
            if rest.is_empty() {
                return if hdr.terminal {
                    Attempt::Exists {
                        value_pos: scaled_to_pos(node.value_off(&hdr)),
                    }
                } else {
                    self.do_mark_final(slot, node, hdr, value)
                };
            }
            match node.find_child(&hdr, rest[0]) {
                Some((slot_off, child)) => {
                    slot = SlotLoc::Slot {
                        parent_pos: node.pos(),
                        slot_off,
                    };
                    cur = child;
                    rest = &rest[1..];
                }
                None => return self.do_add_state_move(slot, node, hdr, rest, value),
            }
        }
    }

    /// First key: CAS the root cell from `TAIL`.
    fn insert_first(&self, key: &[u8], value: &[u8]) -> Attempt {
        let mut staged = Staged::new(&self.pool);
        let Some(value_off) = staged.value(value) else {
            return staged.oom();
        };
        let Some(leaf) = staged.node(&NodeSpec {
            prefix: key,
            value_off: Some(value_off),
            children: &[],
        }) else {
            return staged.oom();
        };
        if !cas_root(&self.root, TAIL, pos_to_scaled(leaf)) {
            staged.rollback();
            return Attempt::Retry;
        }
        staged.commit();
        let verseq = self.commit_edit(EditKind::AddStateMove, None);
        Attempt::Inserted {
            value_pos: scaled_to_pos(value_off),
            verseq,
        }
    }

    /// Key ends inside the edge label: intermediate terminal node.
    fn do_split(
        &self,
        slot: SlotLoc,
        node: NodeRef,
        hdr: crate::node::Header,
        at: usize,
        value: &[u8],
    ) -> Attempt {
        if !node.try_mark_rebuilt() {
            return Attempt::Retry;
        }
        let prefix = node.prefix(&hdr);
        let mut staged = Staged::new(&self.pool);
        let children = collect_children(&node, &hdr);
        let Some(lower) = staged.node(&NodeSpec {
            prefix: &prefix[at + 1..],
            value_off: hdr.terminal.then(|| node.value_off(&hdr)),
            children: &children,
        }) else {
            node.clear_rebuilt();
            return staged.oom();
        };
        let Some(value_off) = staged.value(value) else {
            node.clear_rebuilt();
            return staged.oom();
        };
        let Some(upper) = staged.node(&NodeSpec {
            prefix: &prefix[..at],
            value_off: Some(value_off),
            children: &[(prefix[at], pos_to_scaled(lower))],
        }) else {
            node.clear_rebuilt();
            return staged.oom();
        };
        self.publish_replace(
            slot,
            node,
            hdr,
            upper,
            staged,
            EditKind::Split,
            scaled_to_pos(value_off),
        )
    }

    /// Byte mismatch inside the edge label: branch into two suffixes.
    fn do_fork(
        &self,
        slot: SlotLoc,
        node: NodeRef,
        hdr: crate::node::Header,
        at: usize,
        rest: &[u8],
        value: &[u8],
    ) -> Attempt {
        if !node.try_mark_rebuilt() {
            return Attempt::Retry;
        }
        let prefix = node.prefix(&hdr);
        let mut staged = Staged::new(&self.pool);
        let children = collect_children(&node, &hdr);
        let Some(lower) = staged.node(&NodeSpec {
            prefix: &prefix[at + 1..],
            value_off: hdr.terminal.then(|| node.value_off(&hdr)),
            children: &children,
        }) else {
            node.clear_rebuilt();
            return staged.oom();
        };
        let Some(value_off) = staged.value(value) else {
            node.clear_rebuilt();
            return staged.oom();
        };
        let Some(leaf) = staged.node(&NodeSpec {
            prefix: &rest[at + 1..],
            value_off: Some(value_off),
            children: &[],
        }) else {
            node.clear_rebuilt();
            return staged.oom();
        };
        let mut pair = [
            (prefix[at], pos_to_scaled(lower)),
            (rest[at], pos_to_scaled(leaf)),
        ];
        pair.sort_unstable_by_key(|&(l, _)| l);
        let Some(upper) = staged.node(&NodeSpec {
            prefix: &prefix[..at],
            value_off: None,
            children: &pair,
        }) else {
            node.clear_rebuilt();
            return staged.oom();
        };
        self.publish_replace(
            slot,
            node,
            hdr,
            upper,
            staged,
            EditKind::Fork,
            scaled_to_pos(value_off),
        )
    }

    /// Flip an existing node terminal.
    fn do_mark_final(
        &self,
        slot: SlotLoc,
        node: NodeRef,
        hdr: crate::node::Header,
        value: &[u8],
    ) -> Attempt {
        if !node.try_mark_rebuilt() {
            return Attempt::Retry;
        }
        let prefix = node.prefix(&hdr);
        let mut staged = Staged::new(&self.pool);
        let children = collect_children(&node, &hdr);
        let Some(value_off) = staged.value(value) else {
            node.clear_rebuilt();
            return staged.oom();
        };
        let Some(replacement) = staged.node(&NodeSpec {
            prefix,
            value_off: Some(value_off),
            children: &children,
        }) else {
            node.clear_rebuilt();
            return staged.oom();
        };
        self.publish_replace(
            slot,
            node,
            hdr,
            replacement,
            staged,
            EditKind::MarkFinal,
            scaled_to_pos(value_off),
        )
    }

    /// Append a new child transition, promoting the shape when needed.
    fn do_add_state_move(
        &self,
        slot: SlotLoc,
        node: NodeRef,
        hdr: crate::node::Header,
        rest: &[u8],
        value: &[u8],
    ) -> Attempt {
        if !node.try_mark_rebuilt() {
            return Attempt::Retry;
        }
        let prefix = node.prefix(&hdr);
        let mut staged = Staged::new(&self.pool);
        let Some(value_off) = staged.value(value) else {
            node.clear_rebuilt();
            return staged.oom();
        };
        let Some(leaf) = staged.node(&NodeSpec {
            prefix: &rest[1..],
            value_off: Some(value_off),
            children: &[],
        }) else {
            node.clear_rebuilt();
            return staged.oom();
        };
        let mut children = collect_children(&node, &hdr);
        let label = rest[0];
        let insert_at = children.partition_point(|&(l, _)| l < label);
        children.insert(insert_at, (label, pos_to_scaled(leaf)));
        let Some(replacement) = staged.node(&NodeSpec {
            prefix,
            value_off: hdr.terminal.then(|| node.value_off(&hdr)),
            children: &children,
        }) else {
            node.clear_rebuilt();
            return staged.oom();
        };
        self.publish_replace(
            slot,
            node,
            hdr,
            replacement,
            staged,
            EditKind::AddStateMove,
            scaled_to_pos(value_off),
        )
    }

    /// Publish `replacement` over `node` through `slot`, then commit or
    /// unwind. This is the single place the multi-writer lost-update
    /// protocol lives.
    fn publish_replace(
        &self,
        slot: SlotLoc,
        node: NodeRef,
        hdr: crate::node::Header,
        replacement: usize,
        staged: Staged<'_>,
        kind: EditKind,
        value_pos: usize,
    ) -> Attempt {
        let base = self.pool.base();
        let old = pos_to_scaled(node.pos());
        let new = pos_to_scaled(replacement);
        let published = match slot {
            SlotLoc::Root => {
                if cas_root(&self.root, old, new) {
                    Published::Durable
                } else {
                    Published::Lost
                }
            }
            SlotLoc::Slot {
                parent_pos,
                slot_off,
            } => {
                // SAFETY: parent was a published node on our walk; retired
                // nodes stay readable until reclaimed, which our writer
                // token prevents.
                let parent = unsafe { NodeRef::at(base, parent_pos) };
                if parent.is_rebuilt() {
                    Published::Lost
                } else if !parent.cas_slot(slot_off, old, new) {
                    Published::Lost
                } else if self.level == ConcurrentLevel::MultiWriteMultiRead
                    && parent.is_rebuilt()
                {
                    Published::Unsure
                } else {
                    Published::Durable
                }
            }
        };
        match published {
            Published::Durable => {
                staged.commit();
                let verseq =
                    self.commit_edit(kind, Some((node.pos(), node.block_size(&hdr))));
                Attempt::Inserted { value_pos, verseq }
            }
            Published::Lost => {
                node.clear_rebuilt();
                staged.rollback();
                Attempt::Retry
            }
            Published::Unsure => {
                // The parent was rebuilt around our CAS. If the surviving
                // copy carries our slot value, the edit made it; otherwise
                // our nodes are unreachable.
                log_event!(trace, kind = ?kind, "publication raced a parent rebuild");
                match self.resolve_publication(replacement) {
                    RaceOutcome::Ours => {
                        staged.commit();
                        let verseq =
                            self.commit_edit(kind, Some((node.pos(), node.block_size(&hdr))));
                        Attempt::Inserted { value_pos, verseq }
                    }
                    RaceOutcome::Theirs { value_pos } => {
                        node.clear_rebuilt();
                        staged.rollback();
                        Attempt::Exists { value_pos }
                    }
                    RaceOutcome::Gone => {
                        node.clear_rebuilt();
                        staged.rollback();
                        Attempt::Retry
                    }
                }
            }
        }
    }

    /// Resolve an uncertain publication by re-walking the inserted key
    /// (stashed in `RESOLVE_KEY` by `insert_core`) on the current tree.
    /// Reaching our replacement node proves the edit survived the parent
    /// rebuild; finding the key through foreign nodes means a competing
    /// insert won; anything else means the edit is simply gone.
    fn resolve_publication(&self, replacement: usize) -> RaceOutcome {
        RESOLVE_KEY.with(|k| {
            let key = k.borrow();
            let base = self.pool.base();
            let mut cur = self.root.load(READ_ORD);
            let mut rest: &[u8] = &key;
            loop {
                if cur == TAIL {
                    return RaceOutcome::Gone;
                }
                if scaled_to_pos(cur) == replacement {
                    return RaceOutcome::Ours;
                }
                // SAFETY: published offsets reference live nodes.
                let node = unsafe { NodeRef::at(base, scaled_to_pos(cur)) };
                let hdr = node.header();
                let prefix = node.prefix(&hdr);
                if rest.len() < prefix.len() || &rest[..prefix.len()] != prefix {
                    return RaceOutcome::Gone;
                }
                rest = &rest[prefix.len()..];
                if rest.is_empty() {
                    return if hdr.terminal {
                        RaceOutcome::Theirs {
                            value_pos: scaled_to_pos(node.value_off(&hdr)),
                        }
                    } else {
                        RaceOutcome::Gone
                    };
                }
                match node.find_child(&hdr, rest[0]) {
                    Some((_, child)) => {
                        cur = child;
                        rest = &rest[1..];
                    }
                    None => return RaceOutcome::Gone,
                }
            }
        })
    }

    fn commit_edit(&self, kind: EditKind, retired: Option<(usize, usize)>) -> u64 {
        let verseq = self.verseq.fetch_add(1, WRITE_ORD) + 1;
        self.n_words.fetch_add(1, STAT_ORD);
        match kind {
            EditKind::Fork => &self.n_fork,
            EditKind::Split => &self.n_split,
            EditKind::MarkFinal => &self.n_mark_final,
            EditKind::AddStateMove => &self.n_add_state_move,
        }
        .fetch_add(1, STAT_ORD);
        if let Some((pos, len)) = retired {
            if self.level == ConcurrentLevel::SingleThreadStrict {
                // No readers can exist: recycle on the spot.
                self.pool.sfree(pos, len);
            } else {
                let mut q = self.lazy.lock();
                q.push_back(LazyFreeItem {
                    tag: verseq,
                    pos: pos_to_scaled(pos),
                    len: len as u32,
                });
                self.lazy_cnt.fetch_add(1, STAT_ORD);
                self.lazy_sum.fetch_add(len, STAT_ORD);
            }
        }
        log_event!(debug, verseq, ?kind, "structural edit committed");
        verseq
    }

    /// Drain the retirement queue up to the minimum live verseq.
    pub(crate) fn reclaim(&self) {
        if self.level == ConcurrentLevel::SingleThreadStrict {
            return;
        }
        // One past the newest tag: with no live tokens everything is
        // reclaimable, including the most recent retirement.
        let current = self.verseq.load(READ_ORD) + 1;
        let Some(min) = self.queue.reclaim_min(current) else {
            return;
        };
        let mut freed: Vec<LazyFreeItem> = Vec::new();
        {
            let mut q = self.lazy.lock();
            while let Some(front) = q.front() {
                if front.tag >= min {
                    break;
                }
                freed.push(q.pop_front().expect("front exists"));
            }
        }
        if !freed.is_empty() {
            let mut bytes = 0usize;
            for item in &freed {
                bytes += item.len as usize;
                self.pool.sfree(scaled_to_pos(item.pos), item.len as usize);
            }
            self.lazy_cnt.fetch_sub(freed.len(), STAT_ORD);
            self.lazy_sum.fetch_sub(bytes, STAT_ORD);
        }
        self.freed_below.fetch_max(min, WRITE_ORD);
    }

    // ------------------------------------------------------------------
    //  Tokens
    // ------------------------------------------------------------------

    /// A fresh reader token, unacquired.
    pub fn reader_token(self: &Arc<Self>) -> ReaderToken {
        ReaderToken {
            trie: Arc::clone(self),
            core: new_core(self.id),
            cached: false,
            _not_send: PhantomData,
        }
    }

    /// A fresh writer token, unacquired.
    pub fn writer_token(self: &Arc<Self>) -> WriterToken {
        WriterToken {
            trie: Arc::clone(self),
            core: new_core(self.id),
            cached: false,
            _not_send: PhantomData,
        }
    }

    /// The calling thread's cached reader token, created on first use and
    /// reused across wrapper lifetimes.
    pub fn tls_reader_token(self: &Arc<Self>) -> ReaderToken {
        let core = tls_core(self, false);
        ReaderToken {
            trie: Arc::clone(self),
            core,
            cached: true,
            _not_send: PhantomData,
        }
    }

    /// The calling thread's cached writer token.
    pub fn tls_writer_token(self: &Arc<Self>) -> WriterToken {
        let core = tls_core(self, true);
        WriterToken {
            trie: Arc::clone(self),
            core,
            cached: true,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn acquire_token(&self, core: *mut TokenCore) {
        // SAFETY: core is owned by the calling wrapper.
        unsafe {
            acquire_core(
                &self.queue,
                core,
                &self.verseq,
                self.freed_below.load(READ_ORD),
                self.level.queued(),
            );
        }
    }

    pub(crate) fn release_token(&self, core: *mut TokenCore) {
        // SAFETY: core is owned by the calling wrapper.
        unsafe {
            release_core(
                &self.queue,
                core,
                self.verseq.load(READ_ORD),
                self.level.queued(),
            );
        }
        self.reclaim();
    }

    fn drop_wrapper(&self, core: *mut TokenCore, cached: bool) {
        // SAFETY: wrapper owns the core reference.
        unsafe {
            let state = (*core).state();
            if matches!(
                state,
                TokenState::AcquireDone | TokenState::AcquireIdle | TokenState::AcquireLock
            ) {
                self.release_token(core);
            }
            if cached {
                // The TLS cache keeps the core for the next wrapper.
                return;
            }
            if dispose_core(&self.queue, core, self.verseq.load(READ_ORD)) {
                self.queue.free_detached(core);
            }
        }
    }

    pub(crate) fn queue(&self) -> &TokenQueue {
        &self.queue
    }

    pub(crate) fn trie_id(&self) -> u64 {
        self.id
    }

    /// Value slot bytes behind a token-published offset.
    pub(crate) fn value_bytes(&self, value_pos: usize) -> &[u8] {
        if self.valsize == 0 {
            return &[];
        }
        // SAFETY: value slots live in the arena and are never retired while
        // the publishing token stays acquired.
        unsafe { std::slice::from_raw_parts(self.pool.ptr(value_pos), self.valsize) }
    }
}

impl Drop for Patricia {
    fn drop(&mut self) {
        self.queue.drain_all();
        debug_assert_eq!(
            self.queue.qlen(),
            0,
            "trie destroyed while tokens are still acquired"
        );
    }
}

// ----------------------------------------------------------------------
//  Insert plumbing
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum SlotLoc {
    Root,
    Slot { parent_pos: usize, slot_off: usize },
}

#[derive(Debug, Clone, Copy)]
enum EditKind {
    Fork,
    Split,
    MarkFinal,
    AddStateMove,
}

enum Attempt {
    Inserted { value_pos: usize, verseq: u64 },
    Exists { value_pos: usize },
    OutOfMemory,
    Retry,
}

enum Published {
    Durable,
    Lost,
    Unsure,
}

enum RaceOutcome {
    Ours,
    Theirs { value_pos: usize },
    Gone,
}

thread_local! {
    /// Key being inserted by this thread, for uncertain-publication
    /// resolution.
    static RESOLVE_KEY: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    let n = a.len().min(b.len());
    let mut i = 0;
    while i < n && a[i] == b[i] {
        i += 1;
    }
    i
}

fn collect_children(node: &NodeRef, hdr: &crate::node::Header) -> Vec<(u8, u32)> {
    let count = node.child_count(hdr);
    let mut out = Vec::with_capacity(count + 1);
    for idx in 0..count {
        let (label, _, child) = node.child_at(hdr, idx);
        out.push((label, child));
    }
    out
}

/// Allocation staging: everything allocated for one attempt is either
/// committed wholesale or unwound in reverse order, which hands blocks back
/// to the hot cursor they came from.
struct Staged<'a> {
    pool: &'a TcArena,
    blocks: Vec<(usize, usize)>,
}

impl<'a> Staged<'a> {
    fn new(pool: &'a TcArena) -> Self {
        Self {
            pool,
            blocks: Vec::new(),
        }
    }

    fn value(&mut self, value: &[u8]) -> Option<u32> {
        let off = store_value(self.pool, value)?;
        if !value.is_empty() {
            self.blocks.push((scaled_to_pos(off), value.len()));
        }
        Some(off)
    }

    fn node(&mut self, spec: &NodeSpec<'_>) -> Option<usize> {
        let pos = build_node(self.pool, spec)?;
        // SAFETY: pos was just returned by build_node.
        let node = unsafe { NodeRef::at(self.pool.base(), pos) };
        let hdr = node.header();
        self.blocks.push((pos, node.block_size(&hdr)));
        Some(pos)
    }

    fn oom(self) -> Attempt {
        self.rollback();
        Attempt::OutOfMemory
    }

    fn rollback(mut self) {
        while let Some((pos, len)) = self.blocks.pop() {
            self.pool.sfree(pos, len);
        }
    }

    fn commit(mut self) {
        self.blocks.clear();
    }
}

// ----------------------------------------------------------------------
//  Token wrappers
// ----------------------------------------------------------------------

fn new_core(trie_id: u64) -> NonNull<TokenCore> {
    // SAFETY: Box::into_raw never returns null.
    unsafe { NonNull::new_unchecked(Box::into_raw(Box::new(TokenCore::new(trie_id)))) }
}

struct TlsTokenEntry {
    trie_id: u64,
    trie: Weak<Patricia>,
    reader: *mut TokenCore,
    writer: *mut TokenCore,
}

#[derive(Default)]
struct TlsTokens {
    entries: Vec<TlsTokenEntry>,
}

impl Drop for TlsTokens {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            for core in [entry.reader, entry.writer] {
                if core.is_null() {
                    continue;
                }
                match entry.trie.upgrade() {
                    Some(trie) => {
                        // SAFETY: the cached core is released (wrappers
                        // release on drop) and owned solely by this thread.
                        unsafe {
                            if dispose_core(trie.queue(), core, trie.verseq_now()) {
                                trie.queue().free_detached(core);
                            }
                        }
                    }
                    None => {
                        // The trie's teardown drained the queue, so the core
                        // is fully detached.
                        // SAFETY: sole remaining reference.
                        unsafe { drop(Box::from_raw(core)) };
                    }
                }
            }
        }
    }
}

thread_local! {
    static TLS_TOKENS: RefCell<TlsTokens> = RefCell::new(TlsTokens::default());
}

fn tls_core(trie: &Arc<Patricia>, writer: bool) -> NonNull<TokenCore> {
    TLS_TOKENS.with(|cell| {
        let mut tokens = cell.borrow_mut();
        let idx = match tokens.entries.iter().position(|e| e.trie_id == trie.id) {
            Some(idx) => idx,
            None => {
                tokens.entries.push(TlsTokenEntry {
                    trie_id: trie.id,
                    trie: Arc::downgrade(trie),
                    reader: std::ptr::null_mut(),
                    writer: std::ptr::null_mut(),
                });
                tokens.entries.len() - 1
            }
        };
        let entry = &mut tokens.entries[idx];
        let slot = if writer {
            &mut entry.writer
        } else {
            &mut entry.reader
        };
        if slot.is_null() {
            *slot = new_core(trie.id).as_ptr();
        }
        // SAFETY: freshly created or previously cached, never null here.
        unsafe { NonNull::new_unchecked(*slot) }
    })
}

macro_rules! token_common {
    ($ty:ident) => {
        impl $ty {
            #[inline(always)]
            pub(crate) fn core(&self) -> &TokenCore {
                // SAFETY: the core outlives the wrapper by construction.
                unsafe { self.core.as_ref() }
            }

            /// The trie this token belongs to.
            #[must_use]
            pub fn trie(&self) -> &Arc<Patricia> {
                &self.trie
            }

            /// Enter the acquired state; reading values becomes legal and
            /// reclamation is pinned at the current verseq.
            pub fn acquire(&mut self) {
                self.trie.acquire_token(self.core.as_ptr());
            }

            /// Leave the acquired state; the token parks on the retirement
            /// queue until the dequeue pass moves it on.
            pub fn release(&mut self) {
                self.trie.release_token(self.core.as_ptr());
            }

            /// Owner-only: mark the token inactive between operations
            /// without leaving the queue.
            pub fn idle(&mut self) {
                self.core().idle();
            }

            /// Resume from [`Self::idle`].
            pub fn unidle(&mut self) {
                self.core().unidle();
            }

            /// True while nothing this token observed has been reclaimed.
            #[must_use]
            pub fn is_valid(&self) -> bool {
                self.core().is_valid()
            }

            /// Value slot published by the last hit, if any.
            #[must_use]
            pub fn value(&self) -> Option<&[u8]> {
                let pos = self.core().value_pos.load(READ_ORD);
                if pos == NO_VALUE {
                    None
                } else {
                    Some(self.trie.value_bytes(pos))
                }
            }

            /// Whether the last operation published a value.
            #[must_use]
            pub fn has_value(&self) -> bool {
                self.core().value_pos.load(READ_ORD) != NO_VALUE
            }
        }

        impl Drop for $ty {
            fn drop(&mut self) {
                self.trie.drop_wrapper(self.core.as_ptr(), self.cached);
            }
        }
    };
}

/// Shared-read handle. One per thread; not `Send`.
pub struct ReaderToken {
    trie: Arc<Patricia>,
    core: NonNull<TokenCore>,
    cached: bool,
    _not_send: PhantomData<*mut u8>,
}

token_common!(ReaderToken);

impl ReaderToken {
    /// Walk `key`; on a hit the value is readable through
    /// [`Self::value`].
    pub fn lookup(&mut self, key: &[u8]) -> bool {
        let trie = Arc::clone(&self.trie);
        trie.lookup_core(key, self.core())
    }
}

/// Mutation handle. One per thread; not `Send`.
pub struct WriterToken {
    trie: Arc<Patricia>,
    core: NonNull<TokenCore>,
    cached: bool,
    _not_send: PhantomData<*mut u8>,
}

token_common!(WriterToken);

impl WriterToken {
    /// Insert through this token; see [`Patricia::insert`].
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        let trie = Arc::clone(&self.trie);
        trie.insert_core(key, value, self.core())
    }

    /// Writers may also look keys up.
    pub fn lookup(&mut self, key: &[u8]) -> bool {
        let trie = Arc::clone(&self.trie);
        trie.lookup_core(key, self.core())
    }

    /// Mutable view of the value slot published by the last operation.
    pub fn value_mut(&mut self) -> Option<&mut [u8]> {
        let pos = self.core().value_pos.load(READ_ORD);
        if pos == NO_VALUE || self.trie.valsize == 0 {
            return None;
        }
        // SAFETY: the slot is valsize bytes of live arena; mutation through
        // the sole writer token is the supported way to update in place.
        unsafe {
            Some(std::slice::from_raw_parts_mut(
                self.trie.pool.ptr(pos),
                self.trie.valsize,
            ))
        }
    }
}
