//! Cluster membership model: peers, configurations and the configuration
//! storage seam.
//!
//! A configuration is an ordered map from member id to endpoint with a
//! stable fingerprint. Two slots exist at any time: the `active`
//! configuration and an optional `proposed` one. Promotion of `proposed`
//! to `active` follows one-at-a-time joint-consensus propagation.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
#[cfg(any(test, feature = "test-utils"))]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// A cluster member as seen by the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: u32,
    pub address: String,
    /// False for the local node itself
    pub is_remote: bool,
}

impl Peer {
    pub fn new(
        id: u32,
        address: impl Into<String>,
        is_remote: bool,
    ) -> Self {
        Self {
            id,
            address: address.into(),
            is_remote,
        }
    }
}

/// Ordered member table with a stable fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    members: BTreeMap<u32, String>,
}

impl ClusterConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member(
        mut self,
        id: u32,
        address: impl Into<String>,
    ) -> Self {
        self.members.insert(id, address.into());
        self
    }

    pub fn insert(
        &mut self,
        id: u32,
        address: impl Into<String>,
    ) {
        self.members.insert(id, address.into());
    }

    pub fn remove(
        &mut self,
        id: u32,
    ) -> Option<String> {
        self.members.remove(&id)
    }

    pub fn contains(
        &self,
        id: u32,
    ) -> bool {
        self.members.contains_key(&id)
    }

    pub fn endpoint_of(
        &self,
        id: u32,
    ) -> Option<&str> {
        self.members.get(&id).map(String::as_str)
    }

    pub fn member_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.members.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        self.members.iter().map(|(id, addr)| (*id, addr.as_str()))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Materialize the member table as [`Peer`]s relative to `local_id`.
    pub fn peers(
        &self,
        local_id: u32,
    ) -> Vec<Peer> {
        self.members
            .iter()
            .map(|(id, addr)| Peer::new(*id, addr.clone(), *id != local_id))
            .collect()
    }

    /// Stable content hash over sorted (id, endpoint) pairs.
    ///
    /// BTreeMap iteration makes the digest independent of insertion order.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = crc32fast::Hasher::new();
        for (id, addr) in &self.members {
            hasher.update(&id.to_be_bytes());
            hasher.update(addr.as_bytes());
            hasher.update(&[0]);
        }
        let crc = hasher.finalize();
        ((self.members.len() as u64) << 32) | crc as u64
    }

    /// Strict majority size of this configuration.
    pub fn majority(&self) -> usize {
        majority_count(self.members.len())
    }

    /// True when `acks` forms a strict majority of this configuration.
    ///
    /// Ids outside the configuration are ignored, so an acknowledgement
    /// from an evicted member never tips a quorum.
    pub fn is_quorum(
        &self,
        acks: &HashSet<u32>,
    ) -> bool {
        if self.members.is_empty() {
            return false;
        }
        let counted = acks.iter().filter(|id| self.members.contains_key(id)).count();
        counted >= self.majority()
    }
}

impl FromIterator<(u32, String)> for ClusterConfiguration {
    fn from_iter<I: IntoIterator<Item = (u32, String)>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

/// Strict majority of `total` members.
pub(crate) fn majority_count(total: usize) -> usize {
    total / 2 + 1
}

/// Joint quorum rule: a majority of the active configuration, and of the
/// proposed one when present.
pub(crate) fn has_joint_quorum(
    acks: &HashSet<u32>,
    active: &ClusterConfiguration,
    proposed: Option<&ClusterConfiguration>,
) -> bool {
    active.is_quorum(acks) && proposed.map(|cfg| cfg.is_quorum(acks)).unwrap_or(true)
}

/// Storage seam for the active/proposed configuration slots.
///
/// Durability of the slots is the implementer's concern. `apply` promotes
/// the proposed configuration to active and clears the proposal.
#[cfg_attr(any(test, feature = "test-utils"), automock)]
#[async_trait]
pub trait ConfigurationStorage: Send + Sync + 'static {
    fn active_configuration(&self) -> ClusterConfiguration;

    fn proposed_configuration(&self) -> Option<ClusterConfiguration>;

    async fn propose(
        &self,
        configuration: ClusterConfiguration,
    ) -> Result<()>;

    async fn apply(&self) -> Result<()>;
}

/// Volatile configuration store backed by swap slots.
///
/// Default for embedders whose configuration is derived from the
/// replicated state machine, and for tests.
pub struct InMemoryConfigurationStore {
    active: ArcSwap<ClusterConfiguration>,
    proposed: ArcSwapOption<ClusterConfiguration>,
}

impl InMemoryConfigurationStore {
    pub fn new(initial: ClusterConfiguration) -> Self {
        Self {
            active: ArcSwap::from_pointee(initial),
            proposed: ArcSwapOption::const_empty(),
        }
    }
}

#[async_trait]
impl ConfigurationStorage for InMemoryConfigurationStore {
    fn active_configuration(&self) -> ClusterConfiguration {
        self.active.load().as_ref().clone()
    }

    fn proposed_configuration(&self) -> Option<ClusterConfiguration> {
        self.proposed.load_full().map(|cfg| cfg.as_ref().clone())
    }

    async fn propose(
        &self,
        configuration: ClusterConfiguration,
    ) -> Result<()> {
        self.proposed.store(Some(Arc::new(configuration)));
        Ok(())
    }

    async fn apply(&self) -> Result<()> {
        if let Some(proposed) = self.proposed.swap(None) {
            self.active.store(proposed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod membership_test {
    use std::collections::HashSet;

    use super::*;

    fn three_members() -> ClusterConfiguration {
        ClusterConfiguration::new()
            .with_member(1, "127.0.0.1:9001")
            .with_member(2, "127.0.0.1:9002")
            .with_member(3, "127.0.0.1:9003")
    }

    /// Fingerprints ignore insertion order and change with content.
    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = ClusterConfiguration::new()
            .with_member(2, "b")
            .with_member(1, "a");
        let b = ClusterConfiguration::new()
            .with_member(1, "a")
            .with_member(2, "b");
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = b.clone().with_member(3, "c");
        assert_ne!(b.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_quorum_ignores_unknown_members() {
        let cfg = three_members();
        let mut acks = HashSet::from([1, 99, 98]);
        assert!(
            !cfg.is_quorum(&acks),
            "one known ack is not a majority of three"
        );

        acks.insert(2);
        assert!(cfg.is_quorum(&acks));
    }

    #[test]
    fn test_joint_quorum_requires_both_sets() {
        let active = three_members();
        let proposed = ClusterConfiguration::new()
            .with_member(3, "127.0.0.1:9003")
            .with_member(4, "127.0.0.1:9004")
            .with_member(5, "127.0.0.1:9005");

        let acks = HashSet::from([1, 2]);
        assert!(active.is_quorum(&acks));
        assert!(
            !has_joint_quorum(&acks, &active, Some(&proposed)),
            "majority of active only must not satisfy the joint rule"
        );

        let acks = HashSet::from([1, 3, 4]);
        assert!(has_joint_quorum(&acks, &active, Some(&proposed)));
    }

    #[tokio::test]
    async fn test_apply_promotes_proposed_configuration() {
        let store = InMemoryConfigurationStore::new(three_members());
        let next = three_members().with_member(4, "127.0.0.1:9004");

        store.propose(next.clone()).await.expect("propose");
        assert_eq!(store.proposed_configuration(), Some(next.clone()));

        store.apply().await.expect("apply");
        assert_eq!(store.active_configuration(), next);
        assert!(store.proposed_configuration().is_none());
    }

    #[tokio::test]
    async fn test_apply_without_proposal_is_noop() {
        let store = InMemoryConfigurationStore::new(three_members());
        store.apply().await.expect("apply");
        assert_eq!(store.active_configuration(), three_members());
    }
}
