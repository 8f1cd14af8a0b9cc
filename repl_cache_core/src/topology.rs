//! Node identity and physical placement
//!
//! A node is described by its id, its failure domains (machine, rack, site)
//! and the address its cluster transport listens on. Descriptors compare and
//! order by id only.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Globally unique, totally ordered node identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Physical placement of a node. A missing level is "unknown" and all
/// unknowns share one domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopologyInfo {
    pub machine_id: Option<String>,
    pub rack_id: Option<String>,
    pub site_id: Option<String>,
}

impl TopologyInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site_id = Some(site.into());
        self
    }

    pub fn with_rack(mut self, rack: impl Into<String>) -> Self {
        self.rack_id = Some(rack.into());
        self
    }

    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine_id = Some(machine.into());
        self
    }

    /// Domain key at the given level. Coarser levels are part of the key, so
    /// rack "r1" in two different sites are two different domains.
    pub fn domain(&self, level: DomainLevel) -> FailureDomain<'_> {
        let site = self.site_id.as_deref();
        let rack = self.rack_id.as_deref();
        let machine = self.machine_id.as_deref();
        match level {
            DomainLevel::Site => FailureDomain(site, None, None),
            DomainLevel::Rack => FailureDomain(site, rack, None),
            DomainLevel::Machine => FailureDomain(site, rack, machine),
        }
    }
}

impl fmt::Display for TopologyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "site={} rack={} machine={}",
            self.site_id.as_deref().unwrap_or("?"),
            self.rack_id.as_deref().unwrap_or("?"),
            self.machine_id.as_deref().unwrap_or("?"),
        )
    }
}

/// Failure domain granularity, coarsest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainLevel {
    Site,
    Rack,
    Machine,
}

impl DomainLevel {
    pub const ALL: [DomainLevel; 3] = [DomainLevel::Site, DomainLevel::Rack, DomainLevel::Machine];
}

/// (site, rack, machine) with the levels finer than the requested one blanked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FailureDomain<'a>(Option<&'a str>, Option<&'a str>, Option<&'a str>);

/// A cluster participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub topology: TopologyInfo,
    /// Address of the node's cluster transport listener
    pub address: String,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<NodeId>, topology: TopologyInfo, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topology,
            address: address.into(),
        }
    }
}

impl PartialEq for NodeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeDescriptor {}

impl Hash for NodeDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for NodeDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.id, self.address, self.topology)
    }
}
