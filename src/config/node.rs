//! Node-level settings: identity, initial membership and role mode.

use std::path::Path;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use super::RaftConfig;
use super::ensure;
use crate::ClusterConfiguration;
use crate::Result;

/// Complete settings bundle for one node.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub cluster: ClusterSettings,

    #[serde(default)]
    pub raft: RaftConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClusterSettings {
    /// Stable id of the local member
    #[serde(default = "default_node_id")]
    pub node_id: u32,

    /// Endpoint the local member advertises
    #[serde(default)]
    pub address: String,

    /// Seed member table used when the configuration storage is empty
    #[serde(default)]
    pub initial_members: Vec<MemberEntry>,

    /// Start in standby mode: replicate but never campaign
    #[serde(default)]
    pub standby: bool,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            address: String::new(),
            initial_members: Vec::new(),
            standby: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemberEntry {
    pub id: u32,
    pub address: String,
}

fn default_node_id() -> u32 {
    1
}

impl NodeConfig {
    /// Loads settings from a TOML file with `QUORAFT_`-prefixed
    /// environment overrides, then validates.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings: NodeConfig = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("QUORAFT").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        ensure(self.cluster.node_id != 0, "node_id must be non-zero")?;

        let mut seen = std::collections::HashSet::new();
        for member in &self.cluster.initial_members {
            ensure(member.id != 0, "member ids must be non-zero")?;
            ensure(
                seen.insert(member.id),
                "initial_members contains duplicate ids",
            )?;
        }

        self.raft.validate()
    }

    /// Seed configuration derived from `initial_members`.
    pub fn initial_configuration(&self) -> ClusterConfiguration {
        self.cluster
            .initial_members
            .iter()
            .map(|member| (member.id, member.address.clone()))
            .collect()
    }
}
