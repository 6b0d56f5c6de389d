//! In-process fixtures: a full in-memory log, a loopback transport that
//! routes RPCs between clusters in the same process, and a multi-node
//! harness. Compiled for tests and behind the `test-utils` feature.

mod harness;
mod in_memory_log;
mod loopback;
mod mock;

pub use harness::*;
pub use in_memory_log::*;
pub use loopback::*;
pub use mock::*;
