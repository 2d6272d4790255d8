// ABOUTME: Reconciliation of upstream records into the shared proxy objects
// ABOUTME: Cache and diff, per-record synchronization, and the polling loop

pub mod cache;
pub mod daemon;
pub mod synchronizer;

pub use cache::{diff, CacheEntry, ChangeKind, DiffPlan, PlannedChange, RecordCache};
pub use daemon::{CycleStats, Reconciler};
pub use synchronizer::{ResourceAction, SyncOutcome, Synchronizer};
