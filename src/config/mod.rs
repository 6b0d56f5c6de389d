mod node;
mod raft;

pub use node::*;
pub use raft::*;

#[cfg(test)]
mod config_test;

use config::ConfigError;

use crate::Error;
use crate::Result;

pub(crate) fn invalid(message: impl Into<String>) -> Error {
    Error::Config(ConfigError::Message(message.into()))
}

/// Bounds check shared by the validators.
pub(crate) fn ensure(
    condition: bool,
    message: &str,
) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(invalid(message))
    }
}
