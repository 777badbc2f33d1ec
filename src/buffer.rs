//! The offset-addressed backing region.
//!
//! One virtual reservation of `capacity` bytes whose base address never moves
//! for the lifetime of the arena. `used` grows monotonically under CAS in
//! chunk-aligned steps; shrinking while live is not supported. Everything
//! above the buffer refers to memory by offset, which keeps the arena image
//! position-independent and lets links fit in 32 bits.
//!
//! Two backings exist: an anonymous reservation (the live arena) and a
//! readonly file mapping (a reopened image).

use std::sync::atomic::AtomicUsize;

use crossbeam_utils::Backoff;

use crate::config::{Config, HugePage};
use crate::error::{Error, Result};
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, RELAXED};

/// `madvise` advice for eager page commit. Named constant rather than
/// `libc::MADV_POPULATE_WRITE` because older libc versions lack it; the
/// kernel accepts the raw value from 5.14 on and reports `EINVAL` before.
#[cfg(target_os = "linux")]
const MADV_POPULATE_WRITE: i32 = 23;

enum Backing {
    /// Anonymous reservation owned by this buffer.
    Reserved,

    /// Readonly file mapping; `map_base`/`map_len` cover the whole mapping,
    /// the buffer base points past the image header.
    #[cfg(unix)]
    FileMap { map_base: *mut u8, map_len: usize },
}

/// A growable, offset-addressed byte region with a stable base.
pub(crate) struct Buffer {
    base: *mut u8,
    capacity: usize,
    used: AtomicUsize,
    chunk_size: usize,
    vm_explicit_commit: bool,
    backing: Backing,
}

// SAFETY: the region behind `base` is only handed out by offset; all shared
// mutation goes through atomics (`used`) or is coordinated by the thread
// caches above this layer.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Reserve `max_mem` bytes of virtual memory, rounded up to a whole
    /// number of chunks. The reservation is the hard capacity: growth beyond
    /// it fails, it is never remapped.
    pub(crate) fn reserve(max_mem: usize, cfg: &Config) -> Result<Self> {
        cfg.validate()?;
        if max_mem == 0 {
            return Err(Error::InvalidArgument("max_mem must be nonzero"));
        }
        let capacity = align_up(max_mem, cfg.chunk_size);
        let base = os_reserve(capacity, cfg.hugepage)?;
        Ok(Self {
            base,
            capacity,
            used: AtomicUsize::new(0),
            chunk_size: cfg.chunk_size,
            vm_explicit_commit: cfg.vm_explicit_commit,
            backing: Backing::Reserved,
        })
    }

    /// Wrap a readonly file mapping. `map_base + data_offset` becomes the
    /// buffer base; `used` and `capacity` are fixed to the image size.
    #[cfg(unix)]
    pub(crate) fn from_file_map(
        map_base: *mut u8,
        map_len: usize,
        data_offset: usize,
        used: usize,
    ) -> Self {
        debug_assert!(data_offset + used <= map_len);
        Self {
            // SAFETY: caller guarantees the mapping covers data_offset + used.
            base: unsafe { map_base.add(data_offset) },
            capacity: used,
            used: AtomicUsize::new(used),
            chunk_size: crate::config::DEFAULT_CHUNK_SIZE,
            vm_explicit_commit: false,
            backing: Backing::FileMap { map_base, map_len },
        }
    }

    #[inline(always)]
    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub(crate) fn used(&self) -> usize {
        self.used.load(RELAXED)
    }

    #[inline(always)]
    pub(crate) fn is_file_backed(&self) -> bool {
        !matches!(self.backing, Backing::Reserved)
    }

    /// Pointer to offset `pos`.
    ///
    /// # Safety
    /// `pos` must lie inside the grown region.
    #[inline(always)]
    pub(crate) unsafe fn ptr(&self, pos: usize) -> *mut u8 {
        debug_assert!(pos < self.capacity);
        // SAFETY: pos is within the reservation per the caller contract.
        unsafe { self.base.add(pos) }
    }

    /// The grown prefix of the region as a byte slice.
    ///
    /// # Safety
    /// Caller must ensure no thread writes the returned range concurrently
    /// (quiesced or readonly arena).
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: [0, used) is committed memory per the growth protocol.
        unsafe { std::slice::from_raw_parts(self.base, self.used()) }
    }

    /// Grow `used` by at least `request` bytes, padding so the new region
    /// ends on a chunk boundary. Returns the whole grown span `(start, len)`
    /// for the caller to adopt as a hot area, or `None` when the capacity is
    /// exhausted for this request.
    pub(crate) fn chunk_alloc(&self, request: usize) -> Option<(usize, usize)> {
        if self.is_file_backed() {
            return None;
        }
        let backoff = Backoff::new();
        let (oldn, chunk_len) = loop {
            let oldn = self.used.load(RELAXED);
            let mut chunk_len = align_up(request, self.chunk_size);
            let tail = oldn & (self.chunk_size - 1);
            if tail != 0 {
                chunk_len += self.chunk_size - tail;
            }
            if oldn + chunk_len > self.capacity {
                if oldn + request > self.capacity {
                    return None;
                }
                chunk_len = self.capacity - oldn;
            }
            match self.used.compare_exchange_weak(
                oldn,
                oldn + chunk_len,
                CAS_SUCCESS,
                CAS_FAILURE,
            ) {
                Ok(_) => break (oldn, chunk_len),
                Err(_) => backoff.spin(),
            }
        };
        if self.vm_explicit_commit {
            self.commit(oldn, chunk_len);
        }
        Some((oldn, chunk_len))
    }

    /// Grow `used` by up to `sz` bytes rounded *down* to whole chunks (plus
    /// the padding needed to reach the next chunk boundary). Used by
    /// `tc_populate`; a zero-length result is legal.
    pub(crate) fn chunk_populate(&self, sz: usize) -> Option<(usize, usize)> {
        if self.is_file_backed() {
            return None;
        }
        let backoff = Backoff::new();
        loop {
            let oldn = self.used.load(RELAXED);
            let mut chunk_len = sz & !(self.chunk_size - 1);
            let tail = oldn & (self.chunk_size - 1);
            if tail != 0 {
                chunk_len += self.chunk_size - tail;
            }
            if oldn + chunk_len > self.capacity {
                chunk_len = self.capacity - oldn;
            }
            match self.used.compare_exchange_weak(
                oldn,
                oldn + chunk_len,
                CAS_SUCCESS,
                CAS_FAILURE,
            ) {
                Ok(_) => return Some((oldn, chunk_len)),
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Ask the OS to commit `[start, start + len)` eagerly.
    #[cfg(target_os = "linux")]
    fn commit(&self, start: usize, len: usize) {
        let page = 4096usize;
        let beg = start & !(page - 1);
        let end = align_up(start + len, page).min(self.capacity);
        loop {
            // SAFETY: [beg, end) lies inside our own reservation.
            let rc = unsafe {
                libc::madvise(
                    self.base.add(beg).cast(),
                    end - beg,
                    MADV_POPULATE_WRITE,
                )
            };
            if rc == 0 {
                return;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                // Transient: retry the populate.
                Some(code) if code == libc::EAGAIN => continue,
                // Pre-5.14 kernel: fall back to lazy faulting.
                _ => return,
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn commit(&self, _start: usize, _len: usize) {}
}

impl Drop for Buffer {
    fn drop(&mut self) {
        match self.backing {
            Backing::Reserved => os_release(self.base, self.capacity),
            #[cfg(unix)]
            Backing::FileMap { map_base, map_len } => {
                // SAFETY: we own the mapping created in persist::open.
                unsafe {
                    libc::munmap(map_base.cast(), map_len);
                }
            }
        }
    }
}

#[inline(always)]
pub(crate) fn align_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

#[cfg(unix)]
fn os_reserve(capacity: usize, hugepage: HugePage) -> Result<*mut u8> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let base_flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    #[cfg(target_os = "linux")]
    if hugepage == HugePage::Mmap {
        // SAFETY: fresh anonymous mapping, no address hint.
        let p = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                prot,
                base_flags | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if p != libc::MAP_FAILED {
            return Ok(p.cast());
        }
        // No hugepage pool configured; fall through to plain pages.
    }
    // SAFETY: fresh anonymous mapping, no address hint.
    let p = unsafe { libc::mmap(std::ptr::null_mut(), capacity, prot, base_flags, -1, 0) };
    if p == libc::MAP_FAILED {
        return Err(Error::OutOfMemory);
    }
    #[cfg(target_os = "linux")]
    if hugepage == HugePage::Transparent {
        // Advisory only; ignore failures on kernels without THP.
        // SAFETY: [p, p+capacity) is our fresh mapping.
        unsafe {
            libc::madvise(p, capacity, libc::MADV_HUGEPAGE);
        }
    }
    let _ = hugepage;
    Ok(p.cast())
}

#[cfg(unix)]
fn os_release(base: *mut u8, capacity: usize) {
    // SAFETY: base/capacity came from os_reserve.
    unsafe {
        libc::munmap(base.cast(), capacity);
    }
}

#[cfg(not(unix))]
fn os_reserve(capacity: usize, _hugepage: HugePage) -> Result<*mut u8> {
    let layout = std::alloc::Layout::from_size_align(capacity, 4096)
        .map_err(|_| Error::InvalidArgument("capacity overflow"))?;
    // SAFETY: layout has nonzero size (capacity >= one chunk).
    let p = unsafe { std::alloc::alloc_zeroed(layout) };
    if p.is_null() {
        return Err(Error::OutOfMemory);
    }
    Ok(p)
}

#[cfg(not(unix))]
fn os_release(base: *mut u8, capacity: usize) {
    let layout = std::alloc::Layout::from_size_align(capacity, 4096).unwrap();
    // SAFETY: base/layout came from os_reserve.
    unsafe { std::alloc::dealloc(base, layout) };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> Config {
        Config {
            chunk_size: 4096,
            ..Config::default()
        }
    }

    #[test]
    fn reserve_rounds_capacity_to_chunks() {
        let buf = Buffer::reserve(10_000, &small_cfg()).unwrap();
        assert_eq!(buf.capacity(), 12_288);
        assert_eq!(buf.used(), 0);
    }

    #[test]
    fn chunk_alloc_is_chunk_aligned() {
        let buf = Buffer::reserve(64 * 1024, &small_cfg()).unwrap();
        let (start, len) = buf.chunk_alloc(100).unwrap();
        assert_eq!(start, 0);
        assert_eq!(len, 4096);
        // A second grow starts where the first ended.
        let (start2, len2) = buf.chunk_alloc(5000).unwrap();
        assert_eq!(start2, 4096);
        assert_eq!(len2, 8192);
        assert_eq!(buf.used(), start2 + len2);
    }

    #[test]
    fn chunk_alloc_clips_at_capacity() {
        let buf = Buffer::reserve(8192, &small_cfg()).unwrap();
        let (_, len) = buf.chunk_alloc(4096 + 8).unwrap();
        assert_eq!(len, 8192);
        assert!(buf.chunk_alloc(4).is_none());
    }

    #[test]
    fn chunk_populate_rounds_down() {
        let buf = Buffer::reserve(64 * 1024, &small_cfg()).unwrap();
        let (start, len) = buf.chunk_populate(10_000).unwrap();
        assert_eq!(start, 0);
        assert_eq!(len, 8192);
        // Not a full chunk left in the request: zero-length result is legal.
        let (_, len2) = buf.chunk_populate(100).unwrap();
        assert_eq!(len2, 0);
    }

    #[test]
    fn writes_land_in_reservation() {
        let buf = Buffer::reserve(16 * 1024, &small_cfg()).unwrap();
        let (start, _) = buf.chunk_alloc(64).unwrap();
        // SAFETY: start is inside the grown region.
        unsafe {
            buf.ptr(start).write(0xAB);
            assert_eq!(buf.ptr(start).read(), 0xAB);
        }
    }
}
