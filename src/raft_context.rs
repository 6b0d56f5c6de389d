//! Shared collaborator handles threaded through the role logic.

use std::fmt::Debug;
use std::sync::Arc;

use crate::NodeConfig;
use crate::TypeConfig;
use crate::alias::CSOF;
use crate::alias::ROF;
use crate::alias::TROF;

pub struct RaftContext<T>
where
    T: TypeConfig,
{
    pub node_id: u32,

    /// Persistent log and term/vote storage
    pub log: Arc<ROF<T>>,

    /// Per-member RPC capabilities
    pub transport: Arc<TROF<T>>,

    /// Active/proposed configuration slots
    pub config_storage: Arc<CSOF<T>>,

    pub node_config: Arc<NodeConfig>,
}

impl<T> RaftContext<T>
where
    T: TypeConfig,
{
    pub fn log(&self) -> &Arc<ROF<T>> {
        &self.log
    }

    pub fn transport(&self) -> &Arc<TROF<T>> {
        &self.transport
    }

    pub fn config_storage(&self) -> &Arc<CSOF<T>> {
        &self.config_storage
    }

    pub fn node_config(&self) -> &Arc<NodeConfig> {
        &self.node_config
    }
}

impl<T> Debug for RaftContext<T>
where
    T: TypeConfig,
{
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RaftContext").field("node_id", &self.node_id).finish()
    }
}
