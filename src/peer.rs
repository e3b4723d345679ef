//! Logical peer identity: fabric index + operational node id.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MIN_OPERATIONAL_NODE_ID: u64 = 0x0000_0000_0000_0001;
pub const MAX_OPERATIONAL_NODE_ID: u64 = 0xFFFF_FFEF_FFFF_FFFF;

/// Index of a fabric in the local fabric table. 0 is "undefined", 255 is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FabricIndex(pub u8);

impl FabricIndex {
    pub const UNDEFINED: FabricIndex = FabricIndex(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0 && self.0 != 0xff
    }
}

impl fmt::Display for FabricIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn is_operational_node_id(node_id: u64) -> bool {
    (MIN_OPERATIONAL_NODE_ID..=MAX_OPERATIONAL_NODE_ID).contains(&node_id)
}

/// Identity of a remote node which stays stable across address changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId {
    pub fabric_index: FabricIndex,
    pub node_id: u64,
}

impl PeerId {
    pub fn new(fabric_index: u8, node_id: u64) -> Self {
        Self {
            fabric_index: FabricIndex(fabric_index),
            node_id,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.fabric_index.is_valid() && is_operational_node_id(self.node_id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:016X}", self.fabric_index, self.node_id)
    }
}
