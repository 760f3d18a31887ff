//! Agent Configuration (spec §3, §6).

mod agent;

pub use agent::*;
