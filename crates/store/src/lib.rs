//! Lumen store: the reactive query cache.
//!
//! Identical queries share one cached result set keyed by fingerprint. The
//! change feed drives reconciliation: field updates are patched in place,
//! everything else re-runs the query and reports the first positional
//! divergence to subscribers.

#![forbid(unsafe_code)]

pub mod debounce;
pub mod entry;
pub mod reconcile;
pub mod registry;

pub use debounce::Debouncer;
pub use entry::{CachedResultSet, Callback, EntryState, Subscriber, SubscriptionId};
pub use reconcile::{diff, reconcile, Outcome, ReconcilePath};
pub use registry::{CacheFault, DispatchSummary, Registry};
