//! Per-user monthly bandwidth accounting.
//!
//! Counters survive restarts through a JSON usage file rewritten atomically
//! on a five-minute cadence and at shutdown. Accounting is best-effort by
//! design: a failed write is logged and ignored, never surfaced to a
//! session.

mod tracker;

pub use tracker::{Tracker, UserUsage};
