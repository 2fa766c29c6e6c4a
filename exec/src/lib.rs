//! Execution engine - the host/guest boundary (trampolines and
//! helpers) and the execute loop driving lookup → translate →
//! dispatch.

pub mod dispatch;
pub mod execute;

pub use execute::{execute, JitRuntime};
