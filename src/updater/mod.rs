//! Update Engine (C5): drives the per-container update state machine
//! (spec §4.5) and bounds concurrent apply procedures across the fleet.

mod engine;
pub mod fingerprint;

pub use engine::*;
