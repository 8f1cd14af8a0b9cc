//! Topology-aware ownership of keys
//!
//! Members are placed on a consistent hash ring with a fixed number of
//! virtual positions each. The owners of a key are collected by walking the
//! ring clockwise from the key's position, preferring members whose site,
//! then rack, then machine is not yet represented. Everything here is a pure
//! function of the key and the view's member set, so every node computes the
//! same owner list, and adding or removing a member only moves the keys whose
//! ring segment changed hands.

use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, RwLock};

use crate::topology::{DomainLevel, NodeDescriptor, NodeId};
use crate::view::ClusterView;

/// Default number of ring positions per member
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Stable 64-bit hash shared by every node regardless of platform
pub fn stable_hash(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Ordered owners of one key under one view. The first entry is the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerList {
    view_id: u64,
    owners: Vec<NodeDescriptor>,
}

impl OwnerList {
    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    pub fn owners(&self) -> &[NodeDescriptor] {
        &self.owners
    }

    pub fn primary(&self) -> Option<&NodeDescriptor> {
        self.owners.first()
    }

    pub fn is_primary(&self, id: &NodeId) -> bool {
        self.primary().map(|p| &p.id == id).unwrap_or(false)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.owners.iter().any(|o| &o.id == id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.owners.iter().map(|o| o.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Ring built from one view's member set
#[derive(Debug)]
pub struct HashRing {
    view_id: u64,
    positions: BTreeSet<(u64, NodeId)>,
    members: Vec<NodeDescriptor>,
}

impl HashRing {
    pub fn build(view: &ClusterView, virtual_nodes: usize) -> Self {
        let mut positions = BTreeSet::new();
        for member in view.members() {
            for vnode in 0..virtual_nodes.max(1) {
                let label = format!("{}#{}", member.id, vnode);
                positions.insert((stable_hash(label.as_bytes()), member.id.clone()));
            }
        }
        Self {
            view_id: view.view_id(),
            positions,
            members: view.members().to_vec(),
        }
    }

    /// Distinct members in clockwise order from the key's position. Equal
    /// positions resolve to the smaller node id because the set is ordered
    /// by (position, id).
    fn walk(&self, key: &str) -> Vec<&NodeDescriptor> {
        let start = (stable_hash(key.as_bytes()), NodeId::new(""));
        let mut seen: HashSet<&NodeId> = HashSet::new();
        let mut order = Vec::with_capacity(self.members.len());

        for (_, id) in self.positions.range(start..).chain(self.positions.iter()) {
            if order.len() == self.members.len() {
                break;
            }
            if seen.insert(id) {
                if let Some(member) = self.members.iter().find(|m| &m.id == id) {
                    order.push(member);
                }
            }
        }
        order
    }

    pub fn owners_for(&self, key: &str, owner_count: Option<usize>) -> OwnerList {
        let walk = self.walk(key);
        let target = owner_count.unwrap_or(walk.len()).min(walk.len());
        let mut chosen: Vec<&NodeDescriptor> = Vec::with_capacity(target);

        // One pass per domain level, coarsest first. A member is taken only if
        // its domain at that level is not represented yet.
        for level in DomainLevel::ALL {
            if chosen.len() == target {
                break;
            }
            let mut used: HashSet<_> = chosen.iter().map(|&m| m.topology.domain(level)).collect();
            for &member in &walk {
                if chosen.len() == target {
                    break;
                }
                if chosen.iter().any(|c| c.id == member.id) {
                    continue;
                }
                if used.insert(member.topology.domain(level)) {
                    chosen.push(member);
                }
            }
        }

        // Not enough distinct domains left: relax and take members in ring order
        for &member in &walk {
            if chosen.len() == target {
                break;
            }
            if !chosen.iter().any(|c| c.id == member.id) {
                chosen.push(member);
            }
        }

        OwnerList {
            view_id: self.view_id,
            owners: chosen.into_iter().cloned().collect(),
        }
    }
}

/// Computes owner lists, caching the ring of the most recent view
#[derive(Debug)]
pub struct Placement {
    virtual_nodes: usize,
    owner_count: Option<usize>,
    ring: RwLock<Option<Arc<HashRing>>>,
}

impl Placement {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes,
            owner_count: None,
            ring: RwLock::new(None),
        }
    }

    /// Limit each key to `count` owners. `None` replicates to every member.
    pub fn with_owner_count(mut self, count: Option<usize>) -> Self {
        self.owner_count = count.filter(|c| *c > 0);
        self
    }

    pub fn owner_count(&self) -> Option<usize> {
        self.owner_count
    }

    pub fn owners_for(&self, key: &str, view: &ClusterView) -> OwnerList {
        self.ring_for(view).owners_for(key, self.owner_count)
    }

    fn ring_for(&self, view: &ClusterView) -> Arc<HashRing> {
        {
            let cached = self.ring.read().unwrap_or_else(|e| e.into_inner());
            if let Some(ring) = cached.as_ref() {
                if ring.view_id == view.view_id() && ring.members == view.members() {
                    return Arc::clone(ring);
                }
            }
        }

        let ring = Arc::new(HashRing::build(view, self.virtual_nodes));
        let mut cached = self.ring.write().unwrap_or_else(|e| e.into_inner());
        let newer = cached.as_ref().map(|r| view.view_id() >= r.view_id).unwrap_or(true);
        if newer {
            *cached = Some(Arc::clone(&ring));
        }
        ring
    }
}

impl Default for Placement {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyInfo;

    fn node(id: &str, site: &str, rack: &str) -> NodeDescriptor {
        NodeDescriptor::new(
            id,
            TopologyInfo::new().with_site(site).with_rack(rack).with_machine(id),
            format!("{}:0", id),
        )
    }

    #[test]
    fn test_full_replication_by_default() {
        let view = ClusterView::new(1, vec![node("a", "s1", "r1"), node("b", "s1", "r1"), node("c", "s2", "r1")]);
        let placement = Placement::default();
        let owners = placement.owners_for("user:1", &view);
        assert_eq!(owners.len(), 3);
        assert_eq!(owners.view_id(), 1);
    }

    #[test]
    fn test_owner_list_is_deterministic() {
        let members = vec![node("a", "s1", "r1"), node("b", "s2", "r1"), node("c", "s3", "r2")];
        let view = ClusterView::new(7, members.clone());
        let mut reversed = members;
        reversed.reverse();
        let reordered = ClusterView::new(7, reversed);

        let first = Placement::default().with_owner_count(Some(2));
        let second = Placement::default().with_owner_count(Some(2));
        for i in 0..200 {
            let key = format!("key-{}", i);
            assert_eq!(first.owners_for(&key, &view).ids(), second.owners_for(&key, &reordered).ids());
        }
    }

    #[test]
    fn test_racks_preferred_before_machines() {
        let view = ClusterView::new(
            1,
            vec![
                node("a", "s1", "r1"),
                node("b", "s1", "r1"),
                node("c", "s1", "r2"),
                node("d", "s1", "r2"),
            ],
        );
        let placement = Placement::default().with_owner_count(Some(2));
        for i in 0..100 {
            let owners = placement.owners_for(&format!("k{}", i), &view);
            let racks: HashSet<_> = owners
                .owners()
                .iter()
                .map(|o| o.topology.rack_id.clone())
                .collect();
            assert_eq!(racks.len(), 2, "owners {:?} share a rack", owners.ids());
        }
    }

    #[test]
    fn test_relaxes_when_domains_run_out() {
        let view = ClusterView::new(1, vec![node("a", "s1", "r1"), node("b", "s1", "r1"), node("c", "s2", "r1")]);
        let placement = Placement::default().with_owner_count(Some(3));
        let owners = placement.owners_for("x", &view);
        assert_eq!(owners.len(), 3);

        // The two site-diverse owners come first
        let first_two: HashSet<_> = owners.owners()[..2]
            .iter()
            .map(|o| o.topology.site_id.clone())
            .collect();
        assert_eq!(first_two.len(), 2);
    }

    #[test]
    fn test_owner_count_larger_than_cluster() {
        let view = ClusterView::new(1, vec![node("a", "s1", "r1")]);
        let placement = Placement::default().with_owner_count(Some(4));
        assert_eq!(placement.owners_for("x", &view).ids(), vec![NodeId::from("a")]);
    }

    #[test]
    fn test_ring_cache_follows_view() {
        let placement = Placement::default();
        let one = ClusterView::new(1, vec![node("a", "s1", "r1")]);
        let two = one.with_member(node("b", "s2", "r1"));

        assert_eq!(placement.owners_for("k", &one).len(), 1);
        assert_eq!(placement.owners_for("k", &two).len(), 2);
        // An older view still gets its own ring
        assert_eq!(placement.owners_for("k", &one).len(), 1);
    }

    #[test]
    fn test_stable_hash_is_fixed() {
        assert_eq!(stable_hash(b"abc"), stable_hash(b"abc"));
        assert_ne!(stable_hash(b"abc"), stable_hash(b"abd"));
    }
}
