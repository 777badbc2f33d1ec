//! The shared arena: buffer + per-thread cache registry.
//!
//! [`TcArena`] owns the offset-addressed buffer and a registry of
//! [`TcSlab`]s. Each thread gets its own slab on first use; when a thread
//! exits, its slab flushes its fragmentation drift into the arena counter and
//! goes on a reuse list for the next thread that registers. Slabs are never
//! destroyed before the arena, so cross-thread statistics scans can read them
//! at any time.
//!
//! The arena never panics on exhaustion: every allocation entry point
//! returns `None` once the reservation is full, and callers decide what that
//! means for them.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::{align_up, Buffer};
use crate::config::Config;
use crate::error::Result;
use crate::ordering::STAT_ORD;
use crate::thread_cache::TcSlab;
use crate::tracing_helpers::log_event;
use crate::ALIGN_SIZE;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct Registry {
    slabs: Vec<Box<TcSlab>>,
    free: Vec<usize>,
}

pub(crate) struct PoolShared {
    buffer: Buffer,
    fastbin_max: usize,
    /// Flushed fragmentation bytes; per-slab drift is merged in lazily.
    fragment_size: AtomicUsize,
    registry: Mutex<Registry>,
    id: u64,
}

/// A thread-cached arena over one offset-addressed buffer.
pub struct TcArena {
    shared: Arc<PoolShared>,
}

// ----------------------------------------------------------------------
//  Thread-local slab lookup
// ----------------------------------------------------------------------

struct TlsEntry {
    pool_id: u64,
    pool: Weak<PoolShared>,
    slab: *const TcSlab,
    index: usize,
}

#[derive(Default)]
struct TlsRegistry {
    entries: Vec<TlsEntry>,
}

impl Drop for TlsRegistry {
    fn drop(&mut self) {
        // Thread exit: hand every slab back for reuse, flushing its residual
        // fragmentation drift.
        for entry in self.entries.drain(..) {
            if let Some(pool) = entry.pool.upgrade() {
                pool.release_slab(entry.index);
            }
        }
    }
}

thread_local! {
    static TLS_SLABS: RefCell<TlsRegistry> = RefCell::new(TlsRegistry::default());
}

impl PoolShared {
    fn tls_slab_ptr(self: &Arc<Self>) -> *const TcSlab {
        TLS_SLABS.with(|cell| {
            let mut reg = cell.borrow_mut();
            if let Some(entry) = reg.entries.iter().find(|e| e.pool_id == self.id) {
                return entry.slab;
            }
            let (slab, index) = self.acquire_slab();
            log_event!(debug, pool = self.id, index, "registered thread cache");
            reg.entries.push(TlsEntry {
                pool_id: self.id,
                pool: Arc::downgrade(self),
                slab,
                index,
            });
            slab
        })
    }

    fn tls_slab_ptr_or_null(self: &Arc<Self>) -> *const TcSlab {
        TLS_SLABS.with(|cell| {
            let reg = cell.borrow();
            reg.entries
                .iter()
                .find(|e| e.pool_id == self.id)
                .map_or(std::ptr::null(), |e| e.slab)
        })
    }

    fn acquire_slab(&self) -> (*const TcSlab, usize) {
        let mut reg = self.registry.lock();
        let index = match reg.free.pop() {
            Some(index) => index,
            None => {
                let seed = 0x9E37_79B9u32 ^ (reg.slabs.len() as u32) ^ (self.id as u32);
                reg.slabs.push(Box::new(TcSlab::new(self.fastbin_max, seed)));
                reg.slabs.len() - 1
            }
        };
        (&*reg.slabs[index] as *const TcSlab, index)
    }

    fn release_slab(&self, index: usize) {
        let mut reg = self.registry.lock();
        reg.slabs[index].flush_frag(&self.fragment_size);
        reg.free.push(index);
    }

    fn for_each_slab<F: FnMut(&TcSlab)>(&self, mut f: F) {
        let reg = self.registry.lock();
        for slab in &reg.slabs {
            f(slab);
        }
    }
}

impl TcArena {
    /// Reserve an arena of at most `max_mem` bytes.
    pub fn new(max_mem: usize, cfg: &Config) -> Result<Self> {
        let buffer = Buffer::reserve(max_mem, cfg)?;
        Ok(Self::from_buffer(buffer, cfg))
    }

    pub(crate) fn from_buffer(buffer: Buffer, cfg: &Config) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                buffer,
                fastbin_max: cfg.fastbin_max,
                fragment_size: AtomicUsize::new(0),
                registry: Mutex::new(Registry {
                    slabs: Vec::new(),
                    free: Vec::new(),
                }),
                id: NEXT_POOL_ID.fetch_add(1, STAT_ORD),
            }),
        }
    }

    #[inline(always)]
    pub fn align_size(&self) -> usize {
        ALIGN_SIZE
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.shared.buffer.capacity()
    }

    #[inline(always)]
    pub fn used(&self) -> usize {
        self.shared.buffer.used()
    }

    #[inline(always)]
    pub fn is_readonly(&self) -> bool {
        self.shared.buffer.is_file_backed()
    }

    /// Flushed fragmentation counter. May lag per-thread activity by up to
    /// the drift threshold per live thread.
    #[inline]
    pub fn frag_size(&self) -> usize {
        self.shared.fragment_size.load(STAT_ORD)
    }

    #[inline(always)]
    pub(crate) fn base(&self) -> *mut u8 {
        self.shared.buffer.base()
    }

    /// Pointer to byte offset `pos`.
    ///
    /// # Safety
    /// `pos` must lie inside the grown region.
    #[inline(always)]
    pub(crate) unsafe fn ptr(&self, pos: usize) -> *mut u8 {
        // SAFETY: forwarded contract.
        unsafe { self.shared.buffer.ptr(pos) }
    }

    /// Grown prefix of the buffer.
    ///
    /// # Safety
    /// No concurrent writers to the returned range.
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: forwarded contract.
        unsafe { self.shared.buffer.as_slice() }
    }

    #[inline]
    fn tls_slab(&self) -> &TcSlab {
        let ptr = self.shared.tls_slab_ptr();
        // SAFETY: slabs are boxed, never removed before the pool drops, and
        // the pool outlives this borrow through self.shared.
        unsafe { &*ptr }
    }

    /// Allocate `request` bytes, aligned and sized to the arena alignment.
    /// Returns the byte offset, or `None` when the reservation is exhausted.
    pub fn alloc(&self, request: usize) -> Option<usize> {
        debug_assert!(request > 0);
        if self.is_readonly() {
            return None;
        }
        let request = align_up(request.max(ALIGN_SIZE), ALIGN_SIZE);
        let slab = self.tls_slab();
        let base = self.base();
        let global = &self.shared.fragment_size;
        // SAFETY: slab belongs to this thread; base is this arena's buffer.
        unsafe {
            if let Some(pos) = slab.alloc(base, request, global) {
                return Some(pos);
            }
            self.alloc_slow(slab, request)
        }
    }

    #[cold]
    unsafe fn alloc_slow(&self, slab: &TcSlab, request: usize) -> Option<usize> {
        let (start, len) = self.shared.buffer.chunk_alloc(request)?;
        let base = self.base();
        let global = &self.shared.fragment_size;
        // SAFETY: freshly grown span; owner thread.
        unsafe {
            slab.set_hot_area(base, start, len, global);
            slab.alloc(base, request, global)
        }
    }

    /// Reallocate `[oldpos, oldpos + oldlen)` to `newlen` bytes, copying the
    /// prefix when the block moves.
    pub fn alloc3(&self, oldpos: usize, oldlen: usize, newlen: usize) -> Option<usize> {
        debug_assert!(oldlen > 0 && newlen > 0);
        if self.is_readonly() {
            return None;
        }
        let oldlen = align_up(oldlen.max(ALIGN_SIZE), ALIGN_SIZE);
        let newlen = align_up(newlen.max(ALIGN_SIZE), ALIGN_SIZE);
        let slab = self.tls_slab();
        let base = self.base();
        let global = &self.shared.fragment_size;
        // SAFETY: slab belongs to this thread; caller vouches for the block.
        unsafe {
            if let Some(pos) = slab.alloc3(base, oldpos, oldlen, newlen, global) {
                return Some(pos);
            }
            debug_assert!(oldlen < newlen);
            let (start, len) = self.shared.buffer.chunk_alloc(newlen)?;
            slab.set_hot_area(base, start, len, global);
            let pos = slab.alloc(base, newlen, global)?;
            std::ptr::copy_nonoverlapping(base.add(oldpos), base.add(pos), oldlen);
            slab.sfree(base, oldpos, oldlen, global);
            Some(pos)
        }
    }

    /// Return a block to the current thread's cache.
    pub fn sfree(&self, pos: usize, len: usize) {
        debug_assert!(len > 0);
        debug_assert!(pos % ALIGN_SIZE == 0);
        let len = align_up(len.max(ALIGN_SIZE), ALIGN_SIZE);
        debug_assert!(pos + len <= self.used());
        let slab = self.tls_slab();
        // SAFETY: slab belongs to this thread; caller vouches for the block.
        unsafe { slab.sfree(self.base(), pos, len, &self.shared.fragment_size) };
    }

    /// Grow `used` by at least `request` bytes without handing the span to
    /// any thread cache. Image loading fills the bytes directly.
    pub(crate) fn chunk_grow_for_image(&self, request: usize) -> Option<(usize, usize)> {
        self.shared.buffer.chunk_alloc(request)
    }

    /// Pre-commit roughly `bytes` of the reservation into the current
    /// thread's hot region, touching every page.
    pub fn tc_populate(&self, bytes: usize) {
        let Some((start, len)) = self.shared.buffer.chunk_populate(bytes) else {
            return;
        };
        let slab = self.tls_slab();
        let base = self.base();
        // SAFETY: freshly grown span; owner thread.
        unsafe {
            slab.set_hot_area(base, start, len, &self.shared.fragment_size);
            slab.populate_hot_area(base, 4096);
        }
    }

    // ------------------------------------------------------------------
    //  Statistics
    // ------------------------------------------------------------------

    /// Sum of every thread's free bytes: fragments plus hot windows. The
    /// per-slab cursor read is retried while it appears inverted, which can
    /// happen when the owner is mid-update.
    pub fn slow_get_free_size(&self) -> usize {
        let mut sz = 0usize;
        self.shared.for_each_slab(|tc| {
            let (hp, he) = loop {
                let (hp, he) = tc.hot_span();
                if hp <= he {
                    break (hp, he);
                }
            };
            sz += he - hp;
            sz += tc.fragment_size();
        });
        sz
    }

    /// Free bytes cached by the calling thread, zero if it has no slab yet.
    pub fn get_cur_tls_free_size(&self) -> usize {
        let ptr = self.shared.tls_slab_ptr_or_null();
        if ptr.is_null() {
            return 0;
        }
        // SAFETY: slabs live as long as the pool.
        let tc = unsafe { &*ptr };
        let (hp, he) = tc.hot_span();
        tc.fragment_size() + he.saturating_sub(hp)
    }

    /// Merge every slab's pending drift into the flushed counter.
    pub fn sync_frag_size(&self) {
        self.shared.for_each_slab(|tc| {
            tc.flush_frag(&self.shared.fragment_size);
        });
    }

    /// Recompute the flushed counter from scratch, counting hot windows as
    /// free. Caller must guarantee no concurrent arena activity.
    pub fn sync_frag_size_full(&self) {
        let mut total = 0usize;
        self.shared.for_each_slab(|tc| {
            tc.frag_inc().store(0, STAT_ORD);
            let (hp, he) = tc.hot_span();
            total += tc.fragment_size() + (he - hp);
        });
        self.shared.fragment_size.store(total, STAT_ORD);
    }

    /// Per-size-class free block histogram, summed over all threads.
    pub fn fastbin_histogram(&self) -> Vec<usize> {
        let mut out = vec![0usize; self.shared.fastbin_max / ALIGN_SIZE];
        self.shared.for_each_slab(|tc| tc.fastbin_counts(&mut out));
        out
    }

    /// `(count, bytes)` of huge free blocks over all threads.
    pub fn huge_stat(&self) -> (usize, usize) {
        let (mut cnt, mut sum) = (0usize, 0usize);
        self.shared.for_each_slab(|tc| {
            let (c, s) = tc.huge_stat();
            cnt += c;
            sum += s;
        });
        (cnt, sum)
    }
}
