mod raft_log;

pub use raft_log::*;
