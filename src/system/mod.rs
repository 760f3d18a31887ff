//! System utilities: the per-container mutual-exclusion primitive shared
//! by the Update Engine (spec §4.5 "at most one in-flight update per
//! container id").

mod locker;

pub use locker::{Locker, LockerGuard};
