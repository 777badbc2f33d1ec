//! Standard memory orderings for concurrent arena and trie access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::Ordering;

/// Ordering for reading node headers and child slots during traversal.
/// Pairs with the writer's Release publication.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing fully-initialised nodes.
/// Pairs with the reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for CAS success (child-slot swap, root swap, chunk growth).
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Ordering for CAS failure.
/// Only need to see the current value.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Ordering for statistics counters (fragment size, trie stat).
/// These are statistics, not synchronisation.
pub const STAT_ORD: Ordering = Ordering::Relaxed;

/// Ordering for reads within a region already synchronised by other means
/// (the thread-cache owner thread, a held dequeue lock).
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Ordering for token flag transitions.
/// Must be visible to the retirement pass on other threads.
pub const TOKEN_ORD: Ordering = Ordering::AcqRel;
