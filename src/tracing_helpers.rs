//! Structured logging shim.
//!
//! The crate logs through a single level-dispatching macro so the `tracing`
//! dependency stays optional: with the `tracing` feature enabled the macro
//! forwards to the matching `tracing` level, without it every call site
//! compiles to nothing and costs nothing.
//!
//! ```rust,ignore
//! log_event!(debug, pool = id, index, "registered thread cache");
//! log_event!(trace, ?kind, "publication raced a parent rebuild");
//! ```
//!
//! Enable output with e.g. `RUST_LOG=patrie::trie=trace` on a build with the
//! feature on.

#[cfg(feature = "tracing")]
macro_rules! log_event {
    (trace, $($arg:tt)*) => { tracing::trace!($($arg)*) };
    (debug, $($arg:tt)*) => { tracing::debug!($($arg)*) };
    (warn,  $($arg:tt)*) => { tracing::warn!($($arg)*) };
    (error, $($arg:tt)*) => { tracing::error!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! log_event {
    ($level:ident, $($arg:tt)*) => {};
}

pub(crate) use log_event;
