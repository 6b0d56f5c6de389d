//! Static wiring of the adapter types a cluster is built from.
//!
//! Embedders pick one implementation per seam (log, transport,
//! configuration storage, failure detector) and bundle them in a zero-size
//! marker type. Generics stay readable through the alias module.

use std::fmt::Debug;

use crate::ConfigurationStorage;
use crate::FailureDetector;
use crate::PersistentLog;
use crate::Transport;

/// Compile-time bundle of the four adapter seams.
pub trait TypeConfig: Sized + Clone + Debug + Send + Sync + 'static {
    /// Persistent log and term/vote storage
    type Log: PersistentLog;

    /// Per-member RPC capability set
    type Transport: Transport;

    /// Active/proposed configuration slots
    type ConfigStorage: ConfigurationStorage;

    /// Per-follower liveness estimator
    type Detector: FailureDetector;
}

pub mod alias {
    //! Short alias of type config

    use super::TypeConfig;

    pub type ROF<T> = <T as TypeConfig>::Log;
    pub type TROF<T> = <T as TypeConfig>::Transport;
    pub type CSOF<T> = <T as TypeConfig>::ConfigStorage;
    pub type FDOF<T> = <T as TypeConfig>::Detector;
}
