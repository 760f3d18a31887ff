//! Runtime Adapter (C1): the sole path to the container daemon. Every
//! other component consumes only the `RuntimeAdapter` trait, never
//! `bollard` directly — polymorphic over {real daemon, in-memory fake}
//! per spec §4.1.

mod docker;
mod fake;
mod traits;

pub use docker::DockerRuntime;
pub use fake::FakeRuntime;
pub use traits::*;
