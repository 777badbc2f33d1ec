//! Per-thread allocation cache.
//!
//! A [`TcSlab`] carves memory out of the shared buffer without touching any
//! shared state on the hot path. It keeps three tiers of free memory:
//!
//! - **fastbins**: exact-size LIFO freelists for blocks up to the fastbin
//!   ceiling, one list per multiple of the alignment;
//! - **huge skiplist**: free blocks above the ceiling, kept in a size-ordered
//!   skiplist of up to 8 levels embedded in the free blocks themselves;
//! - **hot region**: a private `[hot_pos, hot_end)` window cut from the
//!   shared buffer, bump-allocated.
//!
//! All link fields store offsets scaled by the alignment, so a 32-bit link
//! addresses 16 GiB of arena. `TAIL` marks end-of-list.
//!
//! # Ownership
//!
//! A slab is mutated only by its owning thread. Other threads read the
//! statistics fields (`fragment_size`, `hot_pos`/`hot_end`, bin counts),
//! which are relaxed atomics precisely because those scans tolerate racing
//! updates. The slab survives its owning thread and is handed to the next
//! thread that registers with the arena.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicU32, AtomicUsize};

use crate::ordering::{RELAXED, STAT_ORD};
use crate::ALIGN_SIZE;

/// Skiplist height cap. The on-disk image depends on this value.
pub(crate) const SKIP_LIST_LEVEL_MAX: usize = 8;

/// End-of-list sentinel for scaled offset links.
pub(crate) const TAIL: u32 = u32::MAX;

/// log2 of [`ALIGN_SIZE`]; link fields store `pos >> OFFSET_SHIFT`.
pub(crate) const OFFSET_SHIFT: u32 = 2;

/// Accumulated fragmentation drift beyond which the local delta is flushed
/// into the arena-wide counter. Bounds cross-thread cacheline traffic.
const FRAG_FLUSH_THRESHOLD: isize = 256 * 1024;

/// Header written into every free block on the huge skiplist.
///
/// `size` is the block length in bytes; for the in-slab list head it holds
/// the current top level instead.
#[repr(C)]
pub(crate) struct HugeLink {
    size: u32,
    next: [u32; SKIP_LIST_LEVEL_MAX],
}

/// Minimum block length that can carry a skiplist header.
pub(crate) const HUGE_LINK_SIZE: usize = std::mem::size_of::<HugeLink>();

struct BinHead {
    /// Scaled offset of the first free block, `TAIL` when empty.
    /// Owner-thread only.
    head: UnsafeCell<u32>,

    /// Number of blocks in this bin. Read by cross-thread histogram scans.
    cnt: AtomicU32,
}

/// One thread's allocation cache over the shared buffer.
pub(crate) struct TcSlab {
    freelist: Box<[BinHead]>,

    /// Skiplist head; `size` holds the current top level.
    /// Owner-thread only.
    huge: UnsafeCell<HugeLink>,

    huge_size_sum: AtomicUsize,
    huge_node_cnt: AtomicUsize,

    /// Bytes held free in this slab (fastbins + huge list, not the hot
    /// region).
    fragment_size: AtomicUsize,

    /// Signed local drift not yet flushed to the arena counter.
    frag_inc: AtomicIsize,

    hot_pos: AtomicUsize,
    hot_end: AtomicUsize,

    /// Skiplist level sampling state. Owner-thread only.
    rng_state: UnsafeCell<u32>,
}

// SAFETY: mutation happens only on the owning thread; every field another
// thread may look at is an atomic, and the UnsafeCell fields are reached
// exclusively through the owner (enforced by the pool's TLS registry).
unsafe impl Send for TcSlab {}
unsafe impl Sync for TcSlab {}

#[inline(always)]
unsafe fn huge_at(base: *mut u8, scaled: u32) -> *mut HugeLink {
    // SAFETY: scaled links are produced from valid in-arena block offsets.
    unsafe { base.add((scaled as usize) << OFFSET_SHIFT).cast() }
}

#[cfg(debug_assertions)]
#[inline]
unsafe fn debug_fill_alloc(mem: *mut u8, len: usize) {
    // SAFETY: caller owns [mem, mem+len).
    unsafe { ptr::write_bytes(mem, 0xCC, len) };
}

#[cfg(not(debug_assertions))]
#[inline(always)]
unsafe fn debug_fill_alloc(_mem: *mut u8, _len: usize) {}

#[cfg(debug_assertions)]
#[inline]
unsafe fn debug_fill_free(mem: *mut u8, len: usize) {
    // SAFETY: caller owns [mem, mem+len).
    unsafe { ptr::write_bytes(mem, 0xDD, len) };
}

#[cfg(not(debug_assertions))]
#[inline(always)]
unsafe fn debug_fill_free(_mem: *mut u8, _len: usize) {}

impl TcSlab {
    pub(crate) fn new(fastbin_max: usize, seed: u32) -> Self {
        let nbins = fastbin_max / ALIGN_SIZE;
        let freelist = (0..nbins)
            .map(|_| BinHead {
                head: UnsafeCell::new(TAIL),
                cnt: AtomicU32::new(0),
            })
            .collect();
        Self {
            freelist,
            huge: UnsafeCell::new(HugeLink {
                size: 0,
                next: [TAIL; SKIP_LIST_LEVEL_MAX],
            }),
            huge_size_sum: AtomicUsize::new(0),
            huge_node_cnt: AtomicUsize::new(0),
            fragment_size: AtomicUsize::new(0),
            frag_inc: AtomicIsize::new(0),
            hot_pos: AtomicUsize::new(0),
            hot_end: AtomicUsize::new(0),
            rng_state: UnsafeCell::new(seed | 1),
        }
    }

    // ------------------------------------------------------------------
    //  Statistics accessors (any thread; values may be slightly stale)
    // ------------------------------------------------------------------

    #[inline(always)]
    pub(crate) fn fragment_size(&self) -> usize {
        self.fragment_size.load(STAT_ORD)
    }

    #[inline(always)]
    pub(crate) fn frag_inc(&self) -> &AtomicIsize {
        &self.frag_inc
    }

    #[inline(always)]
    pub(crate) fn hot_span(&self) -> (usize, usize) {
        (self.hot_pos.load(STAT_ORD), self.hot_end.load(STAT_ORD))
    }

    #[inline(always)]
    pub(crate) fn huge_stat(&self) -> (usize, usize) {
        (
            self.huge_node_cnt.load(STAT_ORD),
            self.huge_size_sum.load(STAT_ORD),
        )
    }

    pub(crate) fn fastbin_counts(&self, out: &mut [usize]) {
        for (i, bin) in self.freelist.iter().enumerate() {
            if let Some(slot) = out.get_mut(i) {
                *slot += bin.cnt.load(STAT_ORD) as usize;
            }
        }
    }

    // ------------------------------------------------------------------
    //  Fragmentation drift
    // ------------------------------------------------------------------

    fn frag_take(&self, amount: usize, global: &AtomicUsize) {
        self.fragment_size.fetch_sub(amount, STAT_ORD);
        let inc = self.frag_inc.load(RELAXED) - amount as isize;
        if inc < -FRAG_FLUSH_THRESHOLD {
            global.fetch_sub(inc.unsigned_abs(), STAT_ORD);
            self.frag_inc.store(0, RELAXED);
        } else {
            self.frag_inc.store(inc, RELAXED);
        }
    }

    fn frag_give(&self, amount: usize, global: &AtomicUsize) {
        self.fragment_size.fetch_add(amount, STAT_ORD);
        let inc = self.frag_inc.load(RELAXED) + amount as isize;
        if inc > FRAG_FLUSH_THRESHOLD {
            global.fetch_add(inc as usize, STAT_ORD);
            self.frag_inc.store(0, RELAXED);
        } else {
            self.frag_inc.store(inc, RELAXED);
        }
    }

    /// Flush the residual drift into the arena counter. Called when the
    /// owning thread exits and the slab goes back on the reuse list.
    pub(crate) fn flush_frag(&self, global: &AtomicUsize) {
        let inc = self.frag_inc.swap(0, RELAXED);
        if inc >= 0 {
            global.fetch_add(inc as usize, STAT_ORD);
        } else {
            global.fetch_sub(inc.unsigned_abs(), STAT_ORD);
        }
    }

    // ------------------------------------------------------------------
    //  Allocation
    // ------------------------------------------------------------------

    /// Allocate `request` bytes (a positive multiple of the alignment).
    /// Returns the byte offset, or `None` when this slab cannot satisfy the
    /// request without growing the buffer.
    ///
    /// # Safety
    /// Must be called on the owning thread; `base` must be the arena base.
    pub(crate) unsafe fn alloc(
        &self,
        base: *mut u8,
        request: usize,
        global: &AtomicUsize,
    ) -> Option<usize> {
        debug_assert!(request > 0 && request % ALIGN_SIZE == 0);
        let nbins = self.freelist.len();
        if request <= nbins * ALIGN_SIZE {
            let idx = request / ALIGN_SIZE - 1;
            // SAFETY: owner thread per contract.
            unsafe {
                let head = *self.freelist[idx].head.get();
                if head != TAIL {
                    let pos = (head as usize) << OFFSET_SHIFT;
                    self.frag_take(request, global);
                    self.freelist[idx].cnt.fetch_sub(1, RELAXED);
                    *self.freelist[idx].head.get() = base.add(pos).cast::<u32>().read();
                    debug_fill_alloc(base.add(pos), request);
                    return Some(pos);
                }
                // Exact bin empty: split a block from the 2x bin.
                let idx2 = idx * 2 + 1;
                if idx2 < nbins {
                    let head2 = *self.freelist[idx2].head.get();
                    if head2 != TAIL {
                        let pos = (head2 as usize) << OFFSET_SHIFT;
                        self.frag_take(request, global);
                        self.freelist[idx2].cnt.fetch_sub(1, RELAXED);
                        *self.freelist[idx2].head.get() = base.add(pos).cast::<u32>().read();
                        // The exact bin is empty, so the second half becomes
                        // its sole entry.
                        base.add(pos + request).cast::<u32>().write(TAIL);
                        self.freelist[idx].cnt.fetch_add(1, RELAXED);
                        *self.freelist[idx].head.get() =
                            ((pos + request) >> OFFSET_SHIFT) as u32;
                        debug_fill_alloc(base.add(pos), request);
                        return Some(pos);
                    }
                }
            }
            if let Some(pos) = self.hot_bump(base, request) {
                return Some(pos);
            }
            // SAFETY: owner thread per contract.
            unsafe { self.refill_hot_from_huge(base, request, global) }
        } else {
            // SAFETY: owner thread per contract.
            if let Some(pos) = unsafe { self.huge_best_fit(base, request, global) } {
                return Some(pos);
            }
            self.hot_bump(base, request)
        }
    }

    #[inline]
    fn hot_bump(&self, base: *mut u8, request: usize) -> Option<usize> {
        let pos = self.hot_pos.load(RELAXED);
        let end = pos + request;
        if end <= self.hot_end.load(RELAXED) {
            self.hot_pos.store(end, RELAXED);
            // SAFETY: [pos, end) is inside the hot window we own.
            unsafe { debug_fill_alloc(base.add(pos), request) };
            return Some(pos);
        }
        None
    }

    /// Small-request fallback: unlink the *largest* skiplist block, take the
    /// prefix, and adopt the suffix as the new hot window.
    unsafe fn refill_hot_from_huge(
        &self,
        base: *mut u8,
        request: usize,
        global: &AtomicUsize,
    ) -> Option<usize> {
        // SAFETY: owner thread; skiplist links are valid block offsets.
        unsafe {
            let head = self.huge.get();
            let top = (*head).size as usize;
            if top == 0 || (*head).next[top - 1] == TAIL {
                return None;
            }
            let mut update: [*mut HugeLink; SKIP_LIST_LEVEL_MAX] =
                [ptr::null_mut(); SKIP_LIST_LEVEL_MAX];
            let mut n1: *mut HugeLink = ptr::null_mut();
            let mut n2: *mut HugeLink = head;
            let mut k = top - 1;
            loop {
                while (*n2).next[k] != TAIL {
                    n1 = n2;
                    n2 = huge_at(base, (*n2).next[k]);
                }
                update[k] = n1;
                if k > 0 {
                    k -= 1;
                    n2 = n1;
                } else {
                    break;
                }
            }
            let rlen = (*n2).size as usize;
            if n2 == head || rlen < request {
                return None;
            }
            let res = n2 as usize - base as usize;
            let res_shift = (res >> OFFSET_SHIFT) as u32;
            for (k, up) in update.iter().enumerate().take(top) {
                if !up.is_null() && (**up).next[k] == res_shift {
                    (**up).next[k] = (*n2).next[k];
                }
            }
            self.shrink_top(head);
            let (hp, he) = (self.hot_pos.load(RELAXED), self.hot_end.load(RELAXED));
            if hp < he {
                self.sfree(base, hp, he - hp, global);
            }
            self.hot_pos.store(res + request, RELAXED);
            self.hot_end.store(res + rlen, RELAXED);
            self.huge_size_sum.fetch_sub(rlen, STAT_ORD);
            self.huge_node_cnt.fetch_sub(1, STAT_ORD);
            self.frag_take(rlen, global);
            debug_fill_alloc(base.add(res), request);
            Some(res)
        }
    }

    /// Large-request path: best-fit descent, unlink, return the prefix and
    /// free the tail back.
    unsafe fn huge_best_fit(
        &self,
        base: *mut u8,
        request: usize,
        global: &AtomicUsize,
    ) -> Option<usize> {
        // SAFETY: owner thread; skiplist links are valid block offsets.
        unsafe {
            let head = self.huge.get();
            let top = (*head).size as usize;
            let mut update: [*mut HugeLink; SKIP_LIST_LEVEL_MAX] =
                [ptr::null_mut(); SKIP_LIST_LEVEL_MAX];
            let mut n1: *mut HugeLink = head;
            let mut n2: *mut HugeLink = ptr::null_mut();
            for k in (0..top).rev() {
                loop {
                    let nx = (*n1).next[k];
                    if nx == TAIL {
                        break;
                    }
                    let cand = huge_at(base, nx);
                    n2 = cand;
                    if (*cand).size as usize >= request {
                        break;
                    }
                    n1 = cand;
                }
                update[k] = n1;
            }
            if n2.is_null() || ((*n2).size as usize) < request {
                return None;
            }
            let total = (*n2).size as usize;
            let remain = total - request;
            let res = n2 as usize - base as usize;
            let res_shift = (res >> OFFSET_SHIFT) as u32;
            for (k, up) in update.iter().enumerate().take(top) {
                if !up.is_null() && (**up).next[k] == res_shift {
                    (**up).next[k] = (*n2).next[k];
                }
            }
            self.shrink_top(head);
            self.huge_size_sum.fetch_sub(total, STAT_ORD);
            self.huge_node_cnt.fetch_sub(1, STAT_ORD);
            self.frag_take(total, global);
            if remain > 0 {
                self.sfree(base, res + request, remain, global);
            }
            debug_fill_alloc(base.add(res), request);
            Some(res)
        }
    }

    /// Drop empty top levels after an unlink.
    unsafe fn shrink_top(&self, head: *mut HugeLink) {
        // SAFETY: owner thread.
        unsafe {
            let mut size = (*head).size as usize;
            while size > 0 && (*head).next[size - 1] == TAIL {
                size -= 1;
            }
            (*head).size = size as u32;
        }
    }

    /// In-place reallocation. Shrink returns the tail to the freelist;
    /// growth extends in place only when the block is the hot-region
    /// predecessor, otherwise allocate + copy + free.
    ///
    /// # Safety
    /// Owner thread; `oldpos/oldlen` must describe a live allocation.
    pub(crate) unsafe fn alloc3(
        &self,
        base: *mut u8,
        oldpos: usize,
        oldlen: usize,
        newlen: usize,
        global: &AtomicUsize,
    ) -> Option<usize> {
        debug_assert!(oldpos % ALIGN_SIZE == 0);
        debug_assert!(oldlen % ALIGN_SIZE == 0 && newlen % ALIGN_SIZE == 0);
        if oldpos + oldlen == self.hot_pos.load(RELAXED) {
            let newend = oldpos + newlen;
            if newend <= self.hot_end.load(RELAXED) {
                self.hot_pos.store(newend, RELAXED);
                return Some(oldpos);
            }
        }
        // SAFETY: owner thread per contract.
        unsafe {
            match newlen.cmp(&oldlen) {
                std::cmp::Ordering::Less => {
                    self.sfree(base, oldpos + newlen, oldlen - newlen, global);
                    Some(oldpos)
                }
                std::cmp::Ordering::Equal => Some(oldpos),
                std::cmp::Ordering::Greater => {
                    let newpos = self.alloc(base, newlen, global)?;
                    ptr::copy_nonoverlapping(base.add(oldpos), base.add(newpos), oldlen);
                    self.sfree(base, oldpos, oldlen, global);
                    Some(newpos)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    //  Free
    // ------------------------------------------------------------------

    /// Return `[pos, pos + len)` to this slab.
    ///
    /// # Safety
    /// Owner thread; the block must have been allocated from this arena and
    /// not freed since.
    pub(crate) unsafe fn sfree(
        &self,
        base: *mut u8,
        pos: usize,
        len: usize,
        global: &AtomicUsize,
    ) {
        debug_assert!(pos % ALIGN_SIZE == 0 && len >= ALIGN_SIZE && len % ALIGN_SIZE == 0);
        // A block ending exactly at the hot cursor merges back into the hot
        // window without a freelist entry.
        if pos + len == self.hot_pos.load(RELAXED) {
            self.hot_pos.store(pos, RELAXED);
            return;
        }
        let nbins = self.freelist.len();
        // SAFETY: owner thread per contract.
        unsafe {
            if len <= nbins * ALIGN_SIZE {
                let idx = len / ALIGN_SIZE - 1;
                debug_fill_free(base.add(pos + ALIGN_SIZE), len - ALIGN_SIZE);
                base.add(pos)
                    .cast::<u32>()
                    .write(*self.freelist[idx].head.get());
                *self.freelist[idx].head.get() = (pos >> OFFSET_SHIFT) as u32;
                self.freelist[idx].cnt.fetch_add(1, RELAXED);
            } else {
                debug_assert!(len >= HUGE_LINK_SIZE);
                self.huge_insert(base, pos, len);
                debug_fill_free(base.add(pos + HUGE_LINK_SIZE), len - HUGE_LINK_SIZE);
                self.huge_size_sum.fetch_add(len, STAT_ORD);
                self.huge_node_cnt.fetch_add(1, STAT_ORD);
            }
        }
        self.frag_give(len, global);
    }

    /// Insert a free block into the skiplist at a sampled level
    /// (geometric, p = 1/4, capped at 8).
    unsafe fn huge_insert(&self, base: *mut u8, pos: usize, len: usize) {
        // SAFETY: owner thread; the block is dead memory we may overwrite.
        unsafe {
            let head = self.huge.get();
            let mut update: [*mut HugeLink; SKIP_LIST_LEVEL_MAX] =
                [ptr::null_mut(); SKIP_LIST_LEVEL_MAX];
            let mut n1: *mut HugeLink = head;
            for k in (0..(*head).size as usize).rev() {
                loop {
                    let nx = (*n1).next[k];
                    if nx == TAIL {
                        break;
                    }
                    let cand = huge_at(base, nx);
                    if (*cand).size as usize >= len {
                        break;
                    }
                    n1 = cand;
                }
                update[k] = n1;
            }
            let rand_lev = self.random_level();
            let mut k;
            if rand_lev >= (*head).size as usize {
                k = (*head).size as usize;
                (*head).size += 1;
                update[k] = head;
            } else {
                k = rand_lev;
            }
            let n2: *mut HugeLink = base.add(pos).cast();
            let pos_shift = (pos >> OFFSET_SHIFT) as u32;
            loop {
                let up = update[k];
                (*n2).next[k] = (*up).next[k];
                (*up).next[k] = pos_shift;
                if k == 0 {
                    break;
                }
                k -= 1;
            }
            (*n2).size = len as u32;
        }
    }

    fn random_level(&self) -> usize {
        let mut level = 1;
        while self.rand() % 4 == 0 && level < SKIP_LIST_LEVEL_MAX {
            level += 1;
        }
        level - 1
    }

    fn rand(&self) -> u32 {
        // SAFETY: owner thread only.
        let state = unsafe { &mut *self.rng_state.get() };
        *state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        (*state >> 16) & 0x7fff
    }

    // ------------------------------------------------------------------
    //  Hot window management
    // ------------------------------------------------------------------

    /// Adopt `[pos, pos + len)` as the hot window. A window that starts at
    /// the current `hot_end` extends in place; otherwise the old remainder is
    /// freed first.
    ///
    /// # Safety
    /// Owner thread; the span must be freshly grown buffer space.
    pub(crate) unsafe fn set_hot_area(
        &self,
        base: *mut u8,
        pos: usize,
        len: usize,
        global: &AtomicUsize,
    ) {
        if self.hot_end.load(RELAXED) == pos {
            self.hot_end.store(pos + len, RELAXED);
            return;
        }
        let (hp, he) = (self.hot_pos.load(RELAXED), self.hot_end.load(RELAXED));
        if hp < he {
            // SAFETY: the old hot remainder belongs to this slab.
            unsafe { self.sfree(base, hp, he - hp, global) };
        }
        self.hot_pos.store(pos, RELAXED);
        self.hot_end.store(pos + len, RELAXED);
    }

    /// Touch one byte per page of the hot window, forcing page-in.
    ///
    /// # Safety
    /// Owner thread; the hot window must be grown buffer space.
    pub(crate) unsafe fn populate_hot_area(&self, base: *mut u8, page_size: usize) {
        let (hp, he) = (self.hot_pos.load(RELAXED), self.hot_end.load(RELAXED));
        let mut pos = hp;
        while pos < he {
            // SAFETY: inside the hot window.
            unsafe { base.add(pos).write(0) };
            pos += page_size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::config::Config;

    fn setup(cap: usize) -> (Buffer, TcSlab, AtomicUsize) {
        let cfg = Config {
            chunk_size: 4096,
            ..Config::default()
        };
        let buf = Buffer::reserve(cap, &cfg).unwrap();
        let slab = TcSlab::new(256, 12345);
        let global = AtomicUsize::new(0);
        let (start, len) = buf.chunk_alloc(cap.min(4096)).unwrap();
        unsafe { slab.set_hot_area(buf.base(), start, len, &global) };
        (buf, slab, global)
    }

    #[test]
    fn bump_then_fastbin_roundtrip() {
        let (buf, slab, global) = setup(64 * 1024);
        let base = buf.base();
        unsafe {
            let a = slab.alloc(base, 16, &global).unwrap();
            let b = slab.alloc(base, 16, &global).unwrap();
            assert_eq!(b, a + 16);

            // Freeing the non-tail block lands in the 16-byte bin.
            slab.sfree(base, a, 16, &global);
            assert_eq!(slab.fragment_size(), 16);

            // The bin satisfies the next request LIFO.
            let c = slab.alloc(base, 16, &global).unwrap();
            assert_eq!(c, a);
            assert_eq!(slab.fragment_size(), 0);
        }
    }

    #[test]
    fn free_at_hot_cursor_merges_back() {
        let (buf, slab, global) = setup(64 * 1024);
        let base = buf.base();
        unsafe {
            let a = slab.alloc(base, 32, &global).unwrap();
            let (hp, _) = slab.hot_span();
            assert_eq!(hp, a + 32);
            slab.sfree(base, a, 32, &global);
            let (hp, _) = slab.hot_span();
            assert_eq!(hp, a);
            // No freelist entry was created.
            assert_eq!(slab.fragment_size(), 0);
        }
    }

    #[test]
    fn split_from_double_size_bin() {
        let (buf, slab, global) = setup(64 * 1024);
        let base = buf.base();
        unsafe {
            let a = slab.alloc(base, 32, &global).unwrap();
            let _pad = slab.alloc(base, 8, &global).unwrap();
            slab.sfree(base, a, 32, &global);

            // 16-byte bin is empty; the 32-byte block is split in two.
            let b = slab.alloc(base, 16, &global).unwrap();
            assert_eq!(b, a);
            assert_eq!(slab.fragment_size(), 16);
            let c = slab.alloc(base, 16, &global).unwrap();
            assert_eq!(c, a + 16);
            assert_eq!(slab.fragment_size(), 0);
        }
    }

    #[test]
    fn huge_blocks_take_best_fit() {
        let (buf, slab, global) = setup(1 << 20);
        let base = buf.base();
        unsafe {
            let a = slab.alloc(base, 512, &global).unwrap();
            let b = slab.alloc(base, 1024, &global).unwrap();
            let _pad = slab.alloc(base, 8, &global).unwrap();
            slab.sfree(base, a, 512, &global);
            slab.sfree(base, b, 1024, &global);
            let (cnt, sum) = slab.huge_stat();
            assert_eq!(cnt, 2);
            assert_eq!(sum, 1536);

            // 400 rounds to the 512 block, not the 1024 one.
            let c = slab.alloc(base, 400, &global).unwrap();
            assert_eq!(c, a);
            // The 112-byte tail went back to a fastbin.
            assert_eq!(slab.fragment_size(), 1024 + 112);
            let (cnt, sum) = slab.huge_stat();
            assert_eq!(cnt, 1);
            assert_eq!(sum, 1024);
        }
    }

    #[test]
    fn small_request_adopts_largest_huge_block() {
        let (buf, slab, global) = setup(1 << 20);
        let base = buf.base();
        unsafe {
            let a = slab.alloc(base, 2048, &global).unwrap();
            let _pad = slab.alloc(base, 8, &global).unwrap();
            slab.sfree(base, a, 2048, &global);

            // Exhaust the hot window with small bumps so the small path must
            // refill from the skiplist.
            loop {
                let (hp, he) = slab.hot_span();
                if he - hp < 16 {
                    break;
                }
                let _ = slab.alloc(base, 16, &global).unwrap();
            }
            let b = slab.alloc(base, 16, &global).unwrap();
            assert_eq!(b, a);
            let (hp, he) = slab.hot_span();
            assert_eq!(hp, a + 16);
            assert_eq!(he, a + 2048);
            let (cnt, _) = slab.huge_stat();
            assert_eq!(cnt, 0);
        }
    }

    #[test]
    fn alloc3_shrink_grow() {
        let (buf, slab, global) = setup(64 * 1024);
        let base = buf.base();
        unsafe {
            let a = slab.alloc(base, 64, &global).unwrap();
            // Tail block: grows in place by bumping the hot cursor.
            let same = slab.alloc3(base, a, 64, 128, &global).unwrap();
            assert_eq!(same, a);
            let (hp, _) = slab.hot_span();
            assert_eq!(hp, a + 128);

            // Not the tail anymore: growth relocates.
            let _pad = slab.alloc(base, 8, &global).unwrap();
            base.add(a).write(0x5A);
            let moved = slab.alloc3(base, a, 128, 256, &global).unwrap();
            assert_ne!(moved, a);
            assert_eq!(base.add(moved).read(), 0x5A);

            // Shrink a non-tail block: the tail goes to the freelist.
            let _pad2 = slab.alloc(base, 8, &global).unwrap();
            let frag_before = slab.fragment_size();
            let kept = slab.alloc3(base, moved, 256, 64, &global).unwrap();
            assert_eq!(kept, moved);
            assert_eq!(slab.fragment_size(), frag_before + 192);
        }
    }

    #[test]
    fn accounting_sums_to_used() {
        let (buf, slab, global) = setup(1 << 20);
        let base = buf.base();
        let mut live = Vec::new();
        unsafe {
            for i in 0..200usize {
                let len = ((i % 37) + 1) * ALIGN_SIZE;
                let pos = match slab.alloc(base, len, &global) {
                    Some(pos) => pos,
                    None => {
                        let (start, clen) = buf.chunk_alloc(len).unwrap();
                        slab.set_hot_area(base, start, clen, &global);
                        slab.alloc(base, len, &global).unwrap()
                    }
                };
                live.push((pos, len));
            }
            // Free the even-indexed half.
            let mut live_sum = 0usize;
            for (i, (pos, len)) in live.drain(..).enumerate() {
                if i % 2 == 0 {
                    slab.sfree(base, pos, len, &global);
                } else {
                    live_sum += len;
                }
            }
            // used == live + fragments + hot window.
            let (hp, he) = slab.hot_span();
            assert_eq!(live_sum + slab.fragment_size() + (he - hp), buf.used());
        }
    }

    #[test]
    fn skiplist_random_stress() {
        let (buf, slab, global) = setup(8 << 20);
        let base = buf.base();
        let mut rng = 99u64;
        let mut next = || {
            rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (rng >> 33) as usize
        };
        let mut live: Vec<(usize, usize)> = Vec::new();
        unsafe {
            for _ in 0..2000 {
                if live.is_empty() || next() % 3 != 0 {
                    let len = crate::buffer::align_up(260 + next() % 4000, ALIGN_SIZE);
                    match slab.alloc(base, len, &global) {
                        Some(pos) => live.push((pos, len)),
                        None => {
                            let (start, clen) = buf.chunk_alloc(len).expect("capacity");
                            slab.set_hot_area(base, start, clen, &global);
                        }
                    }
                } else {
                    let i = next() % live.len();
                    let (pos, len) = live.swap_remove(i);
                    slab.sfree(base, pos, len, &global);
                }
            }
            let live_sum: usize = live.iter().map(|&(_, l)| l).sum();
            let (hp, he) = slab.hot_span();
            assert_eq!(live_sum + slab.fragment_size() + (he - hp), buf.used());
        }
    }
}
