//! CASE handshake client seam.
//!
//! The handshake itself (sigma messages, certificates, key derivation) is done by a
//! [HandshakeClient]. A session setup allocates one client from a [HandshakeClientPool] per
//! attempt and hands it back when it leaves the connecting state. Every allocation comes with
//! a fresh [HandshakeHandle], passed to the client in [HandshakeParams]. The client reports the
//! outcome asynchronously, tagged with that handle, to the owner of the setup, either by posting
//! [SetupEvent::SessionEstablished](crate::driver::SetupEvent::SessionEstablished) /
//! [SetupEvent::SessionEstablishmentError](crate::driver::SetupEvent::SessionEstablishmentError)
//! or by calling the matching [SetupManager](crate::manager::SetupManager) methods.

use crate::{
    address::{MrpConfig, PeerAddress},
    error::SetupError,
    peer::PeerId,
};

/// Identifies one handshake attempt. Completions carrying a handle the setup no longer holds
/// are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandshakeHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeParams {
    pub handle: HandshakeHandle,
    pub peer: PeerId,
    pub address: PeerAddress,
    pub mrp: MrpConfig,
}

pub trait HandshakeClient: Send {
    /// Send sigma1 and return; the outcome arrives later. Must not report synchronously.
    fn establish_session(&mut self, params: &HandshakeParams) -> Result<(), SetupError>;

    /// Fresher MRP parameters learnt while the handshake is running.
    fn set_remote_mrp_intervals(&mut self, mrp: MrpConfig);
}

pub trait HandshakeClientPool: Send {
    /// None when no client can be allocated. Handles are never reused.
    fn allocate(&mut self) -> Option<(HandshakeHandle, Box<dyn HandshakeClient>)>;

    fn release(&mut self, client: Box<dyn HandshakeClient>);
}

/// Pool handing out at most `capacity` live clients built by a factory.
pub struct BoundedClientPool<F> {
    factory: F,
    capacity: usize,
    live: usize,
    next_handle: u64,
}

impl<F> BoundedClientPool<F>
where
    F: FnMut() -> Box<dyn HandshakeClient> + Send,
{
    pub fn new(capacity: usize, factory: F) -> Self {
        Self {
            factory,
            capacity,
            live: 0,
            next_handle: 0,
        }
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<F> HandshakeClientPool for BoundedClientPool<F>
where
    F: FnMut() -> Box<dyn HandshakeClient> + Send,
{
    fn allocate(&mut self) -> Option<(HandshakeHandle, Box<dyn HandshakeClient>)> {
        if self.live >= self.capacity {
            log::debug!("handshake client pool exhausted ({} live)", self.live);
            return None;
        }
        self.live += 1;
        self.next_handle += 1;
        Some((HandshakeHandle(self.next_handle), (self.factory)()))
    }

    fn release(&mut self, client: Box<dyn HandshakeClient>) {
        drop(client);
        self.live = self.live.saturating_sub(1);
    }
}
