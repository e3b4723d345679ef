//! Matter operational session setup
//!
//! This library gets a controller from a peer identity (fabric index and node id) to a CASE
//! secure session. It reuses a live session when one exists, otherwise resolves the node
//! address and runs the handshake, and reports the outcome to every caller waiting for that peer.
//! Following are main parts of api:
//! - [SessionSetup](setup::SessionSetup) - state machine of one setup attempt towards one peer.
//!                             Transitions are computed by the pure [step](setup::fsm::step) function.
//! - [SetupManager](manager::SetupManager) - pool of session setups keyed by peer. Owns the
//!                             collaborators: [FabricTable](fabric::FabricTable),
//!                             [SessionStore](session::SessionStore),
//!                             [AddressResolver](resolver::AddressResolver) and
//!                             [HandshakeClientPool](handshake::HandshakeClientPool).
//! - [SetupDriver](driver::SetupDriver) - runs a manager on a tokio task and offers async `connect`.
//! - [MdnsResolver](resolver::mdns::MdnsResolver) - operational node discovery over mDNS.
//!
//! The CASE handshake itself is not part of this crate. It is plugged in through
//! [HandshakeClient](handshake::HandshakeClient).
//!
//! Example how to resolve operational address of commissioned node:
//! ```no_run
//! # use anyhow::Result;
//! # use std::time::Duration;
//! # use matc_case::{address::MrpConfig, driver, fabric::Fabric, peer::{FabricIndex, PeerId}};
//! # use matc_case::resolver::{mdns::MdnsResolver, NodeLookupRequest};
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! # let root_public_key = [4u8; 65];
//! let fabric = Fabric::new(FabricIndex(1), 1000, &root_public_key)?;
//! let request = NodeLookupRequest::new(PeerId::new(1, 300), fabric.compressed_fabric_id());
//! let (sink, _queue) = driver::channel();
//! let resolver = MdnsResolver::new(sink, Duration::from_secs(5), MrpConfig::default());
//! let result = resolver.resolve(request).await?;
//! println!("{} {:?}", result.address, result.mrp);
//! # Ok(())
//! # }
//! ```
//!
//! Example how to drive session setup by hand:
//! ```
//! # use matc_case::{address::MrpConfig, error::SetupError, exchange::RandomExchangeIds};
//! # use matc_case::peer::{FabricIndex, PeerId};
//! # use matc_case::setup::{fsm::State, Outcome, SessionSetup, SetupContext};
//! # use matc_case::{fabric::FabricList, session::SecureSessionTable};
//! # use matc_case::handshake::{BoundedClientPool, HandshakeClient, HandshakeParams};
//! # use matc_case::resolver::{AddressResolver, FailureCallback, LookupHandle, NodeLookupRequest};
//! # struct NoResolver;
//! # impl AddressResolver for NoResolver {
//! #     fn lookup_node(&mut self, _r: NodeLookupRequest) -> Result<LookupHandle, SetupError> { Err(SetupError::NoMemory) }
//! #     fn cancel_lookup(&mut self, _h: LookupHandle, _f: FailureCallback) -> Result<(), SetupError> { Ok(()) }
//! # }
//! # struct Client;
//! # impl HandshakeClient for Client {
//! #     fn establish_session(&mut self, _p: &HandshakeParams) -> Result<(), SetupError> { Ok(()) }
//! #     fn set_remote_mrp_intervals(&mut self, _m: MrpConfig) {}
//! # }
//! let fabrics = FabricList::new();
//! let mut sessions = SecureSessionTable::new();
//! let mut resolver = NoResolver;
//! let mut clients = BoundedClientPool::new(1, || Box::new(Client) as Box<dyn HandshakeClient>);
//! let mut ctx = SetupContext {
//!     fabrics: &fabrics,
//!     sessions: &mut sessions,
//!     resolver: &mut resolver,
//!     clients: &mut clients,
//! };
//! let mut setup = SessionSetup::new(PeerId::new(1, 300), MrpConfig::default());
//! // fabric 1 is unknown, so the lookup can not start
//! let disposition = setup.connect(
//!     None,
//!     Some(Box::new(|peer: PeerId, error: &SetupError| println!("{} failed: {}", peer, error))),
//!     &mut ctx,
//! );
//! let completion = disposition.into_completion().unwrap();
//! assert_eq!(
//!     completion.outcome(),
//!     &Outcome::Failed(SetupError::InvalidFabricIndex(FabricIndex(1)))
//! );
//! assert_eq!(setup.state(), State::NeedsAddress);
//! completion.notify(&RandomExchangeIds);
//! setup.teardown(&mut ctx);
//! ```

pub mod address;
pub mod config;
pub mod driver;
pub mod error;
pub mod exchange;
pub mod fabric;
pub mod handshake;
pub mod manager;
pub mod peer;
pub mod resolver;
pub mod session;
pub mod setup;

#[cfg(test)]
mod test_support;
