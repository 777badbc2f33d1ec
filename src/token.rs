//! Token lifecycle and the retirement queue.
//!
//! A token bounds the lifetime of references a thread pulls out of the trie.
//! While a token is `AcquireDone`, no node retired at or after the token's
//! `live_verseq` may be reclaimed. Tokens are enqueued on an intrusive FIFO
//! at acquire time; the reclaim pass pops released tokens off the front and
//! takes the minimum `live_verseq` over everything still queued.
//!
//! The queue is a Michael-Scott list over the tokens themselves, with a
//! 16-byte `{next, verseq}` link updated by double-width CAS so recycled
//! token memory cannot ABA an in-flight enqueue. Dequeue runs under a small
//! spinlock: any thread that notices released tokens at the front takes the
//! lock opportunistically, pops a bounded batch, and frees disposed tokens
//! outside the critical section (`del_tokens`).
//!
//! # State machine
//!
//! ```text
//! ReleaseDone -> AcquireDone -> (AcquireIdle <-> AcquireLock)
//!      ^              |                |
//!      |              v                v
//!      +-------- ReleaseWait -> (pop) -+--> DisposeWait -> DisposeDone
//! ```
//!
//! `AcquireIdle` is set only by the owner; `AcquireLock` only by another
//! thread that wants the owner to hold still while it inspects the token.
//! `Dispose*` marks the token for deletion once the queue has drained past
//! it.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize};

use crossbeam_utils::Backoff;
use portable_atomic::AtomicU128;

use crate::ordering::{CAS_FAILURE, READ_ORD, RELAXED, STAT_ORD, TOKEN_ORD, WRITE_ORD};
use crate::tracing_helpers::log_event;

/// Sentinel stored in a detached token's next link so a racing enqueue
/// re-reads the tail instead of appending to dead memory. Odd value: real
/// token pointers are at least 8-aligned.
const DETACHED: u64 = 1;

/// Upper bound on pops per dequeue pass.
const DEQUEUE_BATCH: usize = 32;

/// `value_pos` marker for "no value published".
pub(crate) const NO_VALUE: usize = usize::MAX;

/// Token lifecycle states. See the module docs for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TokenState {
    ReleaseDone = 0,
    AcquireDone = 1,
    AcquireIdle = 2,
    AcquireLock = 3,
    ReleaseWait = 4,
    DisposeWait = 5,
    DisposeDone = 6,
}

impl TokenState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::ReleaseDone,
            1 => Self::AcquireDone,
            2 => Self::AcquireIdle,
            3 => Self::AcquireLock,
            4 => Self::ReleaseWait,
            5 => Self::DisposeWait,
            _ => Self::DisposeDone,
        }
    }
}

/// `{state, is_head}` packed into one atomic u16: the pair must change as a
/// unit, or a token could re-enter the queue while still serving as its
/// dummy node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TokenFlags {
    pub(crate) state: TokenState,
    pub(crate) is_head: bool,
}

impl TokenFlags {
    #[inline(always)]
    fn pack(self) -> u16 {
        self.state as u16 | u16::from(self.is_head) << 8
    }

    #[inline(always)]
    fn unpack(v: u16) -> Self {
        Self {
            state: TokenState::from_u8((v & 0xFF) as u8),
            is_head: v >> 8 != 0,
        }
    }
}

#[inline(always)]
fn pack128(ptr: u64, seq: u64) -> u128 {
    (u128::from(seq) << 64) | u128::from(ptr)
}

#[inline(always)]
fn unpack128(v: u128) -> (u64, u64) {
    (v as u64, (v >> 64) as u64)
}

// ----------------------------------------------------------------------
//  TokenCore
// ----------------------------------------------------------------------

/// Queue-resident part of a token. Heap-allocated with a stable address;
/// freed only by [`dispose_core`] or the queue's dispose pass.
pub(crate) struct TokenCore {
    /// `{next, verseq}`: successor pointer and the verseq tag this token was
    /// enqueued at. Double-width so enqueue CAS cannot ABA.
    link: AtomicU128,

    flags: AtomicU16,

    /// Trie verseq observed at acquire.
    pub(crate) live_verseq: AtomicU64,

    /// Reclamation watermark at acquire; `is_valid` compares against it.
    pub(crate) min_age: AtomicU64,

    /// Byte offset of the value slot published by the last operation.
    pub(crate) value_pos: AtomicUsize,

    /// Identity of the trie this token belongs to.
    pub(crate) trie_id: u64,
}

impl TokenCore {
    pub(crate) fn new(trie_id: u64) -> Self {
        Self {
            link: AtomicU128::new(0),
            flags: AtomicU16::new(
                TokenFlags {
                    state: TokenState::ReleaseDone,
                    is_head: false,
                }
                .pack(),
            ),
            live_verseq: AtomicU64::new(0),
            min_age: AtomicU64::new(0),
            value_pos: AtomicUsize::new(NO_VALUE),
            trie_id,
        }
    }

    fn new_stub() -> Self {
        let core = Self::new(0);
        core.flags.store(
            TokenFlags {
                state: TokenState::ReleaseDone,
                is_head: true,
            }
            .pack(),
            RELAXED,
        );
        core
    }

    #[inline(always)]
    pub(crate) fn flags(&self) -> TokenFlags {
        TokenFlags::unpack(self.flags.load(READ_ORD))
    }

    #[inline(always)]
    pub(crate) fn state(&self) -> TokenState {
        self.flags().state
    }

    fn cas_flags(&self, from: TokenFlags, to: TokenFlags) -> bool {
        self.flags
            .compare_exchange(from.pack(), to.pack(), TOKEN_ORD, CAS_FAILURE)
            .is_ok()
    }

    /// True while nothing the token may have observed has been reclaimed.
    pub(crate) fn is_valid(&self) -> bool {
        debug_assert!(matches!(
            self.state(),
            TokenState::AcquireDone | TokenState::AcquireIdle | TokenState::AcquireLock
        ));
        self.min_age.load(READ_ORD) < self.live_verseq.load(READ_ORD)
    }

    /// Owner marks itself inactive between operations without giving up the
    /// queue slot.
    pub(crate) fn idle(&self) {
        let _ = self.cas_flags(
            TokenFlags {
                state: TokenState::AcquireDone,
                is_head: false,
            },
            TokenFlags {
                state: TokenState::AcquireIdle,
                is_head: false,
            },
        );
    }

    /// An observer pins an idle token while inspecting it; the owner cannot
    /// transition away until [`Self::unpin`].
    pub(crate) fn pin_idle(&self) -> bool {
        self.cas_flags(
            TokenFlags {
                state: TokenState::AcquireIdle,
                is_head: false,
            },
            TokenFlags {
                state: TokenState::AcquireLock,
                is_head: false,
            },
        )
    }

    pub(crate) fn unpin(&self) {
        let _ = self.cas_flags(
            TokenFlags {
                state: TokenState::AcquireLock,
                is_head: false,
            },
            TokenFlags {
                state: TokenState::AcquireIdle,
                is_head: false,
            },
        );
    }

    /// Owner resumes from idle.
    pub(crate) fn unidle(&self) {
        let backoff = Backoff::new();
        loop {
            let f = self.flags();
            match f.state {
                TokenState::AcquireIdle => {
                    if self.cas_flags(
                        f,
                        TokenFlags {
                            state: TokenState::AcquireDone,
                            is_head: f.is_head,
                        },
                    ) {
                        return;
                    }
                }
                // An observer holds the token pinned; wait it out.
                TokenState::AcquireLock => backoff.snooze(),
                _ => return,
            }
        }
    }
}

// ----------------------------------------------------------------------
//  TokenQueue
// ----------------------------------------------------------------------

/// The intrusive token FIFO plus its exclusive dequeue side.
pub(crate) struct TokenQueue {
    /// `{dummy ptr, generation}`.
    head: AtomicU128,

    /// `{tail ptr, generation}`.
    tail: AtomicU128,

    /// Permanent stand-in dummy, swapped in whenever a real token needs to
    /// leave the dummy position.
    stub: Box<TokenCore>,

    /// Exclusive dequeue side. Enqueue stays lock-free.
    dequeue_lock: AtomicBool,

    /// Enqueues in flight. Detached tokens are only freed once this drains
    /// to zero, so a stale tail pointer can never be dereferenced after the
    /// free.
    enq_active: AtomicUsize,

    qlen: AtomicUsize,
}

// SAFETY: all queue mutation goes through atomics; the raw token pointers
// are owned by the protocol described in the module docs.
unsafe impl Send for TokenQueue {}
unsafe impl Sync for TokenQueue {}

impl TokenQueue {
    pub(crate) fn new() -> Self {
        let stub = Box::new(TokenCore::new_stub());
        let stub_ptr = &*stub as *const TokenCore as u64;
        Self {
            head: AtomicU128::new(pack128(stub_ptr, 0)),
            tail: AtomicU128::new(pack128(stub_ptr, 0)),
            stub,
            dequeue_lock: AtomicBool::new(false),
            enq_active: AtomicUsize::new(0),
            qlen: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    fn stub_ptr(&self) -> *mut TokenCore {
        &*self.stub as *const TokenCore as *mut TokenCore
    }

    #[inline(always)]
    pub(crate) fn qlen(&self) -> usize {
        self.qlen.load(STAT_ORD)
    }

    /// Append an acquired token. Its `live_verseq` must already be set; the
    /// link tag records it.
    ///
    /// # Safety
    /// `token` must be a live `TokenCore` not currently queued.
    pub(crate) unsafe fn enqueue(&self, token: *mut TokenCore) {
        self.enq_active.fetch_add(1, TOKEN_ORD);
        // SAFETY: forwarded contract.
        unsafe { self.enqueue_inner(token) };
        self.enq_active.fetch_sub(1, TOKEN_ORD);
    }

    unsafe fn enqueue_inner(&self, token: *mut TokenCore) {
        // SAFETY: token is live per the caller contract.
        let t = unsafe { &*token };
        let tag = t.live_verseq.load(RELAXED);
        t.link.store(pack128(0, tag), WRITE_ORD);
        let backoff = Backoff::new();
        loop {
            let tail = self.tail.load(READ_ORD);
            let (tp, tgen) = unpack128(tail);
            // SAFETY: the tail pointer is either the stub or a queued token,
            // both alive until detached under the dequeue lock.
            let tail_node = unsafe { &*(tp as *const TokenCore) };
            let link = tail_node.link.load(READ_ORD);
            let (next, lseq) = unpack128(link);
            if tail != self.tail.load(READ_ORD) {
                backoff.spin();
                continue;
            }
            if next == 0 {
                if tail_node
                    .link
                    .compare_exchange_weak(
                        link,
                        pack128(token as u64, lseq),
                        TOKEN_ORD,
                        CAS_FAILURE,
                    )
                    .is_ok()
                {
                    let _ = self.tail.compare_exchange(
                        tail,
                        pack128(token as u64, tgen.wrapping_add(1)),
                        TOKEN_ORD,
                        CAS_FAILURE,
                    );
                    self.qlen.fetch_add(1, STAT_ORD);
                    return;
                }
            } else if next == DETACHED {
                // A detach is swinging the tail to the stub; wait for it.
                backoff.snooze();
                continue;
            } else {
                // Help a stalled enqueue move the tail forward.
                let _ = self.tail.compare_exchange(
                    tail,
                    pack128(next, tgen.wrapping_add(1)),
                    TOKEN_ORD,
                    CAS_FAILURE,
                );
            }
            backoff.spin();
        }
    }

    /// Compute the minimum live verseq, opportunistically draining released
    /// tokens from the front. `current` is the trie's verseq now; an empty
    /// queue reclaims everything below it. Returns `None` when another
    /// thread holds the dequeue side; the caller simply makes no
    /// reclamation progress this round.
    pub(crate) fn reclaim_min(&self, current: u64) -> Option<u64> {
        if !self.try_lock() {
            return None;
        }
        let mut delptrs: Vec<*mut TokenCore> = Vec::new();
        let min = self.drain_front(current, &mut delptrs);
        self.unlock();
        if !delptrs.is_empty() {
            // Free disposed tokens outside the critical section, once no
            // in-flight enqueue can still hold a stale pointer to them.
            self.wait_enqueue_quiesce();
            // SAFETY: each pointer was detached under the lock with state
            // DisposeDone; nothing else references it.
            unsafe { del_tokens(&delptrs) };
        }
        Some(min)
    }

    /// Free a token that [`dispose_core`] reported as caller-owned.
    ///
    /// # Safety
    /// `token` must be detached and `DisposeDone`, with no other owner.
    pub(crate) unsafe fn free_detached(&self, token: *mut TokenCore) {
        self.wait_enqueue_quiesce();
        // SAFETY: forwarded contract.
        unsafe { del_tokens(&[token]) };
    }

    fn wait_enqueue_quiesce(&self) {
        let backoff = Backoff::new();
        while self.enq_active.load(READ_ORD) != 0 {
            backoff.snooze();
        }
    }

    /// Swing the shared tail off `node` (whose successor is `next`) so no
    /// future enqueue can pick up a pointer to it. Must hold the dequeue
    /// lock; `node` must already be unreachable from the head chain or about
    /// to be detached.
    fn help_tail_past(&self, node: *mut TokenCore, next: u64) {
        let backoff = Backoff::new();
        loop {
            let tail = self.tail.load(READ_ORD);
            let (tp, tgen) = unpack128(tail);
            if tp != node as u64 {
                return;
            }
            let _ = self.tail.compare_exchange(
                tail,
                pack128(next, tgen.wrapping_add(1)),
                TOKEN_ORD,
                CAS_FAILURE,
            );
            backoff.spin();
        }
    }

    fn try_lock(&self) -> bool {
        self.dequeue_lock
            .compare_exchange(false, true, TOKEN_ORD, CAS_FAILURE)
            .is_ok()
    }

    fn unlock(&self) {
        self.dequeue_lock.store(false, WRITE_ORD);
    }

    /// Pop released tokens off the front, then compute the minimum live
    /// verseq over everything still queued. Must hold the dequeue lock.
    ///
    /// The scan covers the whole queue rather than trusting the front: two
    /// tokens that acquired concurrently may sit in the queue out of
    /// `live_verseq` order. Tokens that enqueue during the scan are missed,
    /// which is safe: their authoritative `live_verseq` is read after their
    /// enqueue, hence after this pass started, hence not below anything this
    /// pass may free.
    fn drain_front(&self, current: u64, delptrs: &mut Vec<*mut TokenCore>) -> u64 {
        let mut popped = 0usize;
        loop {
            let (dp, dgen) = unpack128(self.head.load(READ_ORD));
            let dummy_ptr = dp as *mut TokenCore;
            // SAFETY: the dummy stays alive until we detach it below.
            let dummy = unsafe { &*dummy_ptr };

            // A real token stuck in the dummy slot whose owner finished with
            // it: swap the stub back in so the owner can reuse or free it.
            if dummy_ptr != self.stub_ptr() {
                let df = dummy.flags();
                if matches!(df.state, TokenState::ReleaseDone | TokenState::DisposeDone)
                    && self.swap_stub_in(dummy_ptr, dgen)
                {
                    self.finish_detach(dummy_ptr, delptrs);
                    continue;
                }
            }

            let (next, _) = unpack128(dummy.link.load(READ_ORD));
            if next == 0 || next == DETACHED {
                break;
            }
            let front_ptr = next as *mut TokenCore;
            // SAFETY: a linked successor is alive until detached.
            let front = unsafe { &*front_ptr };
            let ff = front.flags();
            match ff.state {
                TokenState::ReleaseWait | TokenState::DisposeWait if popped < DEQUEUE_BATCH => {
                    let done = if ff.state == TokenState::ReleaseWait {
                        TokenState::ReleaseDone
                    } else {
                        TokenState::DisposeDone
                    };
                    // The popped token becomes the new dummy: state and
                    // is_head flip together.
                    if !front.cas_flags(
                        ff,
                        TokenFlags {
                            state: done,
                            is_head: true,
                        },
                    ) {
                        continue;
                    }
                    self.head
                        .store(pack128(front_ptr as u64, dgen.wrapping_add(1)), WRITE_ORD);
                    self.qlen.fetch_sub(1, STAT_ORD);
                    popped += 1;
                    log_event!(trace, ?done, "token popped from retirement queue");
                    if dummy_ptr != self.stub_ptr() {
                        self.help_tail_past(dummy_ptr, front_ptr as u64);
                    }
                    self.finish_detach(dummy_ptr, delptrs);
                }
                _ => break,
            }
        }

        // Min over the remaining queue. Released stragglers only lower the
        // bound, which is the safe direction. Idle tokens are pinned to
        // `AcquireLock` for the read so the owner cannot transition under
        // the inspection.
        let mut min = current;
        let (dp, _) = unpack128(self.head.load(READ_ORD));
        // SAFETY: dummy alive; we hold the lock, so nothing detaches.
        let mut next = unpack128(unsafe { &*(dp as *const TokenCore) }.link.load(READ_ORD)).0;
        while next != 0 && next != DETACHED {
            // SAFETY: queued tokens stay alive while the lock is held.
            let node = unsafe { &*(next as *const TokenCore) };
            let pinned = node.pin_idle();
            min = min.min(node.live_verseq.load(READ_ORD));
            if pinned {
                node.unpin();
            }
            next = unpack128(node.link.load(READ_ORD)).0;
        }
        min
    }

    /// Replace a finished dummy token with the stub. Handles the racy
    /// "dummy is also the tail" case by poisoning the dummy's link first.
    /// Must hold the dequeue lock.
    fn swap_stub_in(&self, dummy_ptr: *mut TokenCore, dgen: u64) -> bool {
        // SAFETY: dummy is alive until we detach it.
        let dummy = unsafe { &*dummy_ptr };
        let link = dummy.link.load(READ_ORD);
        let (next, lseq) = unpack128(link);
        if next == 0 {
            // Sole node: block late enqueues onto it, then swing the tail.
            self.stub.link.store(pack128(0, lseq.wrapping_add(1)), WRITE_ORD);
            if dummy
                .link
                .compare_exchange(
                    link,
                    pack128(DETACHED, lseq.wrapping_add(1)),
                    TOKEN_ORD,
                    CAS_FAILURE,
                )
                .is_err()
            {
                // An enqueue slipped in; retry via the successor path.
                return false;
            }
            let backoff = Backoff::new();
            loop {
                let tail = self.tail.load(READ_ORD);
                let (tp, tgen) = unpack128(tail);
                if tp != dummy_ptr as u64 {
                    break;
                }
                if self
                    .tail
                    .compare_exchange(
                        tail,
                        pack128(self.stub_ptr() as u64, tgen.wrapping_add(1)),
                        TOKEN_ORD,
                        CAS_FAILURE,
                    )
                    .is_ok()
                {
                    break;
                }
                backoff.spin();
            }
        } else if next != DETACHED {
            // Interior dummy: the stub adopts its successor. Make sure the
            // shared tail no longer references the outgoing dummy first.
            self.stub.link.store(pack128(next, lseq), WRITE_ORD);
            self.help_tail_past(dummy_ptr, next);
        } else {
            return false;
        }
        self.head.store(
            pack128(self.stub_ptr() as u64, dgen.wrapping_add(1)),
            WRITE_ORD,
        );
        true
    }

    /// Clear `is_head` on a detached token and stage disposed ones for
    /// freeing. Must hold the dequeue lock; last queue-side touch of the
    /// token.
    fn finish_detach(&self, token_ptr: *mut TokenCore, delptrs: &mut Vec<*mut TokenCore>) {
        if token_ptr == self.stub_ptr() {
            return;
        }
        // SAFETY: detached token, still alive; we are its only toucher.
        let token = unsafe { &*token_ptr };
        let backoff = Backoff::new();
        loop {
            let f = token.flags();
            if f.state == TokenState::DisposeDone {
                delptrs.push(token_ptr);
                return;
            }
            if token.cas_flags(
                f,
                TokenFlags {
                    state: f.state,
                    is_head: false,
                },
            ) {
                return;
            }
            backoff.spin();
        }
    }

    /// Trie teardown: pop everything. No concurrent access may remain.
    pub(crate) fn drain_all(&self) {
        loop {
            assert!(self.try_lock(), "token queue locked during trie teardown");
            let mut delptrs: Vec<*mut TokenCore> = Vec::new();
            let _ = self.drain_front(u64::MAX, &mut delptrs);
            self.unlock();
            self.wait_enqueue_quiesce();
            // SAFETY: detached under the lock, state DisposeDone.
            unsafe { del_tokens(&delptrs) };
            if self.qlen() == 0 {
                // Make sure no finished token is still parked as the dummy.
                let (dp, dgen) = unpack128(self.head.load(READ_ORD));
                if dp == self.stub_ptr() as u64 {
                    return;
                }
                assert!(self.try_lock(), "token queue locked during trie teardown");
                let mut delptrs: Vec<*mut TokenCore> = Vec::new();
                if self.swap_stub_in(dp as *mut TokenCore, dgen) {
                    self.finish_detach(dp as *mut TokenCore, &mut delptrs);
                }
                self.unlock();
                self.wait_enqueue_quiesce();
                // SAFETY: as above.
                unsafe { del_tokens(&delptrs) };
                let (dp, _) = unpack128(self.head.load(READ_ORD));
                if dp == self.stub_ptr() as u64 {
                    return;
                }
            }
        }
    }
}

/// Free a batch of disposed tokens. Runs outside the dequeue critical
/// section.
///
/// # Safety
/// Every pointer must be a detached `TokenCore` in `DisposeDone` state that
/// no other thread references.
pub(crate) unsafe fn del_tokens(ptrs: &[*mut TokenCore]) {
    for &p in ptrs {
        debug_assert!(!p.is_null());
        // SAFETY: ownership transferred per the function contract.
        drop(unsafe { Box::from_raw(p) });
    }
}

// ----------------------------------------------------------------------
//  Acquire / release / dispose protocol helpers
// ----------------------------------------------------------------------

/// Acquire `token` against a trie whose verseq counter is `verseq`,
/// enqueueing it when `queued` (levels with shared readers). `watermark` is
/// the trie's freed-below counter.
///
/// The token's `live_verseq` is written twice: a pre-enqueue placeholder
/// (always a lower bound, so a racing reclaim pass can only under-free) and
/// the authoritative value re-read after the enqueue, whose ordering
/// guarantees no reclaim pass that missed the token frees anything it can
/// observe.
///
/// # Safety
/// `token` must be live and owned by the calling thread.
pub(crate) unsafe fn acquire_core(
    queue: &TokenQueue,
    token: *mut TokenCore,
    verseq: &AtomicU64,
    watermark: u64,
    queued: bool,
) {
    // SAFETY: live per contract.
    let t = unsafe { &*token };
    let backoff = Backoff::new();
    loop {
        let f = t.flags();
        match f.state {
            TokenState::ReleaseDone if !f.is_head => {
                if t.cas_flags(
                    f,
                    TokenFlags {
                        state: TokenState::AcquireDone,
                        is_head: false,
                    },
                ) {
                    break;
                }
            }
            // Still parked as the queue dummy or awaiting a pop: help the
            // queue along until it lets go of us.
            TokenState::ReleaseDone | TokenState::ReleaseWait => {
                let _ = queue.reclaim_min(verseq.load(READ_ORD));
                backoff.snooze();
            }
            other => unreachable!("acquire on token in state {other:?}"),
        }
    }
    t.live_verseq.store(verseq.load(READ_ORD), WRITE_ORD);
    t.min_age.store(watermark.saturating_sub(1), WRITE_ORD);
    t.value_pos.store(NO_VALUE, RELAXED);
    if queued {
        // SAFETY: token is ours and now out of the queue.
        unsafe { queue.enqueue(token) };
        t.live_verseq.store(verseq.load(READ_ORD), WRITE_ORD);
    }
}

/// Release `token`. For queued levels it parks as `ReleaseWait` until the
/// dequeue pass moves it on.
///
/// # Safety
/// `token` must be live and owned by the calling thread.
pub(crate) unsafe fn release_core(
    queue: &TokenQueue,
    token: *mut TokenCore,
    current: u64,
    queued: bool,
) {
    // SAFETY: live per contract.
    let t = unsafe { &*token };
    let backoff = Backoff::new();
    loop {
        let f = t.flags();
        match f.state {
            TokenState::AcquireDone | TokenState::AcquireIdle => {
                let to = if queued {
                    TokenState::ReleaseWait
                } else {
                    TokenState::ReleaseDone
                };
                if t.cas_flags(
                    f,
                    TokenFlags {
                        state: to,
                        is_head: f.is_head,
                    },
                ) {
                    break;
                }
            }
            // Pinned by an observer; it will unpin shortly.
            TokenState::AcquireLock => backoff.snooze(),
            // Already released.
            _ => return,
        }
    }
    if queued {
        let _ = queue.reclaim_min(current);
    }
}

/// Mark `token` for deletion. Returns `true` when the caller must free the
/// core itself (it is fully out of the queue); `false` when the queue owns
/// the deletion.
///
/// # Safety
/// `token` must be live; the caller gives up its reference either way.
pub(crate) unsafe fn dispose_core(queue: &TokenQueue, token: *mut TokenCore, current: u64) -> bool {
    // SAFETY: live per contract.
    let t = unsafe { &*token };
    let backoff = Backoff::new();
    loop {
        let f = t.flags();
        match (f.state, f.is_head) {
            // Fully detached: caller frees.
            (TokenState::ReleaseDone, false) => {
                if t.cas_flags(
                    f,
                    TokenFlags {
                        state: TokenState::DisposeDone,
                        is_head: false,
                    },
                ) {
                    return true;
                }
            }
            // Parked as dummy: the queue will collect it.
            (TokenState::ReleaseDone, true) => {
                if t.cas_flags(
                    f,
                    TokenFlags {
                        state: TokenState::DisposeDone,
                        is_head: true,
                    },
                ) {
                    let _ = queue.reclaim_min(current);
                    return false;
                }
            }
            // Still queued: flip the wait flavor.
            (TokenState::ReleaseWait, _) => {
                if t.cas_flags(
                    f,
                    TokenFlags {
                        state: TokenState::DisposeWait,
                        is_head: f.is_head,
                    },
                ) {
                    let _ = queue.reclaim_min(current);
                    return false;
                }
            }
            other => unreachable!("dispose on token in state {other:?}"),
        }
        backoff.spin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_token(trie_id: u64, live: u64) -> *mut TokenCore {
        let core = Box::new(TokenCore::new(trie_id));
        core.live_verseq.store(live, RELAXED);
        Box::into_raw(core)
    }

    unsafe fn set_state(t: *mut TokenCore, state: TokenState) {
        let tok = unsafe { &*t };
        let f = tok.flags();
        tok.flags.store(
            TokenFlags {
                state,
                is_head: f.is_head,
            }
            .pack(),
            WRITE_ORD,
        );
    }

    #[test]
    fn flags_pack_roundtrip() {
        for state in [
            TokenState::ReleaseDone,
            TokenState::AcquireDone,
            TokenState::AcquireIdle,
            TokenState::AcquireLock,
            TokenState::ReleaseWait,
            TokenState::DisposeWait,
            TokenState::DisposeDone,
        ] {
            for is_head in [false, true] {
                let f = TokenFlags { state, is_head };
                assert_eq!(TokenFlags::unpack(f.pack()), f);
            }
        }
    }

    #[test]
    fn empty_queue_reclaims_everything() {
        let q = TokenQueue::new();
        assert_eq!(q.reclaim_min(42), Some(42));
        assert_eq!(q.qlen(), 0);
    }

    #[test]
    fn front_acquired_token_bounds_reclaim() {
        let q = TokenQueue::new();
        let a = mk_token(1, 5);
        let b = mk_token(1, 9);
        unsafe {
            set_state(a, TokenState::AcquireDone);
            set_state(b, TokenState::AcquireDone);
            q.enqueue(a);
            q.enqueue(b);
        }
        assert_eq!(q.qlen(), 2);
        assert_eq!(q.reclaim_min(20), Some(5));

        // Releasing the front advances the minimum to the next holder.
        unsafe { set_state(a, TokenState::ReleaseWait) };
        assert_eq!(q.reclaim_min(20), Some(9));
        assert_eq!(q.qlen(), 1);
        unsafe {
            // a is now the dummy in ReleaseDone.
            assert_eq!((*a).state(), TokenState::ReleaseDone);
            assert!((*a).flags().is_head);
        }

        // Release b too: queue drains to empty.
        unsafe { set_state(b, TokenState::ReleaseWait) };
        assert_eq!(q.reclaim_min(20), Some(20));
        assert_eq!(q.qlen(), 0);
        q.drain_all();
        unsafe {
            // Both tokens detached; free them by hand.
            assert!(!(*a).flags().is_head);
            set_state(a, TokenState::DisposeDone);
            set_state(b, TokenState::DisposeDone);
            del_tokens(&[a, b]);
        }
    }

    #[test]
    fn acquire_release_cycle_via_protocol() {
        let q = TokenQueue::new();
        let vs = AtomicU64::new(10);
        let t = mk_token(7, 0);
        unsafe {
            acquire_core(&q, t, &vs, 3, true);
            assert_eq!((*t).state(), TokenState::AcquireDone);
            assert_eq!((*t).live_verseq.load(RELAXED), 10);
            assert!((*t).is_valid());
            assert_eq!(q.qlen(), 1);

            // While held, reclaim cannot pass the token's verseq.
            vs.store(25, RELAXED);
            assert_eq!(q.reclaim_min(25), Some(10));

            release_core(&q, t, 25, true);
            assert_eq!(q.reclaim_min(25), Some(25));

            // Re-acquire reuses the same core.
            vs.store(30, RELAXED);
            acquire_core(&q, t, &vs, 20, true);
            assert_eq!((*t).state(), TokenState::AcquireDone);
            vs.store(40, RELAXED);
            assert_eq!(q.reclaim_min(40), Some(30));
            release_core(&q, t, 40, true);
            let _ = q.reclaim_min(40);

            if dispose_core(&q, t, 40) {
                q.free_detached(t);
            } else {
                // The queue owns it now; draining must free it.
                q.drain_all();
            }
        }
        assert_eq!(q.qlen(), 0);
    }

    #[test]
    fn idle_pin_unpin() {
        let q = TokenQueue::new();
        let vs = AtomicU64::new(5);
        let t = mk_token(3, 0);
        unsafe {
            acquire_core(&q, t, &vs, 0, true);
            (*t).idle();
            assert_eq!((*t).state(), TokenState::AcquireIdle);

            // Idle tokens still hold the reclaim line.
            vs.store(9, RELAXED);
            assert_eq!(q.reclaim_min(9), Some(5));

            assert!((*t).pin_idle());
            assert_eq!((*t).state(), TokenState::AcquireLock);
            assert_eq!(q.reclaim_min(9), Some(5));
            (*t).unpin();

            (*t).unidle();
            assert_eq!((*t).state(), TokenState::AcquireDone);

            release_core(&q, t, 9, true);
            let _ = q.reclaim_min(9);
            if dispose_core(&q, t, 9) {
                q.free_detached(t);
            } else {
                q.drain_all();
            }
        }
    }

    #[test]
    fn concurrent_acquire_release_storm() {
        use std::sync::Arc;
        let q = Arc::new(TokenQueue::new());
        let seq = Arc::new(AtomicU64::new(1));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&q);
            let seq = Arc::clone(&seq);
            handles.push(std::thread::spawn(move || {
                let t = mk_token(1, 0);
                for _ in 0..200 {
                    let _ = seq.fetch_add(1, RELAXED);
                    unsafe {
                        acquire_core(&q, t, &seq, 0, true);
                        let live = (*t).live_verseq.load(RELAXED);
                        if let Some(min) = q.reclaim_min(seq.load(RELAXED)) {
                            assert!(min <= live, "min {min} ran past live token at {live}");
                        }
                        release_core(&q, t, seq.load(RELAXED), true);
                    }
                }
                unsafe {
                    if dispose_core(&q, t, seq.load(RELAXED)) {
                        q.free_detached(t);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        q.drain_all();
        assert_eq!(q.qlen(), 0);
    }
}
