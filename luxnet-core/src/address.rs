//! Node identity on the bus: 5-bit node addresses and the set of known peers.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest address representable in the 5-bit address field.
pub const MAX_ADDRESS: u8 = 0x1F;

/// Bus address of one desk node. Fits the 5-bit address field of the CAN identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct NodeAddress(u8);

impl NodeAddress {
    /// Validated constructor. Returns `None` above [`MAX_ADDRESS`].
    pub fn new(raw: u8) -> Option<Self> {
        (raw <= MAX_ADDRESS).then_some(NodeAddress(raw))
    }

    /// Build from an identifier or payload byte, keeping the low 5 bits.
    pub fn from_wire(raw: u8) -> Self {
        NodeAddress(raw & MAX_ADDRESS)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for NodeAddress {
    type Error = InvalidAddress;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        NodeAddress::new(raw).ok_or(InvalidAddress(raw))
    }
}

impl From<NodeAddress> for u8 {
    fn from(addr: NodeAddress) -> u8 {
        addr.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("node address {0} does not fit in 5 bits")]
pub struct InvalidAddress(pub u8);

/// Addresses known to be on the bus, self included. Iteration is sorted, which fixes the
/// calibration turn order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSet {
    members: BTreeSet<NodeAddress>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set containing only `me`.
    pub fn with_self(me: NodeAddress) -> Self {
        let mut set = Self::new();
        set.insert(me);
        set
    }

    /// Returns true if the address was not already present.
    pub fn insert(&mut self, addr: NodeAddress) -> bool {
        self.members.insert(addr)
    }

    pub fn contains(&self, addr: NodeAddress) -> bool {
        self.members.contains(&addr)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = NodeAddress> + '_ {
        self.members.iter().copied()
    }

    /// Position of `addr` in sorted order.
    pub fn position(&self, addr: NodeAddress) -> Option<usize> {
        self.members.iter().position(|a| *a == addr)
    }

    pub fn to_vec(&self) -> Vec<NodeAddress> {
        self.iter().collect()
    }
}

impl FromIterator<NodeAddress> for PeerSet {
    fn from_iter<I: IntoIterator<Item = NodeAddress>>(iter: I) -> Self {
        PeerSet {
            members: iter.into_iter().collect(),
        }
    }
}
