mod queue;
mod replicator;

pub use queue::*;
pub use replicator::*;

#[cfg(test)]
mod queue_test;
#[cfg(test)]
mod replicator_test;
