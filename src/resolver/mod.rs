//! Operational node address resolution.
//!
//! A [AddressResolver] turns a [NodeLookupRequest] into an asynchronous lookup identified by a
//! [LookupHandle]. The result comes back later through the owner of the session setup
//! ([manager::SetupManager](crate::manager::SetupManager) or the async
//! [driver](crate::driver)), tagged with the same handle so late results of cancelled lookups
//! can be told apart.
//!
//! [mdns::MdnsResolver] implements the lookup with DNS-SD over multicast DNS.

pub mod dns;
pub mod mdns;

use crate::{error::SetupError, peer::PeerId};

/// Opaque token of one outstanding lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LookupHandle(pub u64);

/// Whether cancelling a lookup still reports it as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCallback {
    Call,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLookupRequest {
    /// logical peer the result is reported for
    pub peer: PeerId,
    pub compressed_fabric_id: u64,
}

impl NodeLookupRequest {
    pub fn new(peer: PeerId, compressed_fabric_id: u64) -> Self {
        Self {
            peer,
            compressed_fabric_id,
        }
    }

    pub fn node_id(&self) -> u64 {
        self.peer.node_id
    }

    /// DNS-SD instance name of the operational node: `<CFID>-<NODEID>`.
    pub fn instance_name(&self) -> String {
        format!("{:016X}-{:016X}", self.compressed_fabric_id, self.peer.node_id)
    }
}

pub trait AddressResolver: Send {
    /// Start a lookup. The result must never be reported from inside this call.
    fn lookup_node(&mut self, request: NodeLookupRequest) -> Result<LookupHandle, SetupError>;

    fn cancel_lookup(
        &mut self,
        handle: LookupHandle,
        failure_callback: FailureCallback,
    ) -> Result<(), SetupError>;
}
