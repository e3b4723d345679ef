//! Recording fakes for the session setup collaborators.

use std::sync::{Arc, Mutex};

use crate::{
    address::{MrpConfig, PeerAddress},
    error::SetupError,
    exchange::ExchangeManager,
    fabric::{Fabric, FabricList},
    handshake::{HandshakeClient, HandshakeClientPool, HandshakeHandle, HandshakeParams},
    peer::{FabricIndex, PeerId},
    resolver::{AddressResolver, FailureCallback, LookupHandle, NodeLookupRequest},
    session::{SecureSessionTable, SessionHandle, SessionType},
    setup::{OnConnected, OnFailure, SetupContext},
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub const FABRIC_ID: u64 = 1000;

pub fn root_public_key() -> Vec<u8> {
    let mut key = vec![0x04];
    key.extend((1..=64u8).map(|b| b.wrapping_mul(37)));
    key
}

pub fn peer() -> PeerId {
    PeerId::new(1, 300)
}

pub fn addr(s: &str) -> PeerAddress {
    PeerAddress(s.parse().unwrap())
}

pub fn fabrics() -> FabricList {
    let list = FabricList::new();
    list.add(Fabric::new(FabricIndex(1), FABRIC_ID, &root_public_key()).unwrap());
    list
}

#[derive(Default)]
pub struct ResolverLog {
    pub lookups: Vec<(LookupHandle, NodeLookupRequest)>,
    pub cancels: Vec<(LookupHandle, FailureCallback)>,
    pub fail_next: Option<SetupError>,
    next_handle: u64,
}

#[derive(Clone, Default)]
pub struct FakeResolver(pub Arc<Mutex<ResolverLog>>);

impl FakeResolver {
    pub fn lookups(&self) -> usize {
        self.0.lock().unwrap().lookups.len()
    }

    pub fn last_handle(&self) -> LookupHandle {
        self.0.lock().unwrap().lookups.last().unwrap().0
    }

    pub fn last_request(&self) -> NodeLookupRequest {
        self.0.lock().unwrap().lookups.last().unwrap().1
    }

    pub fn cancels(&self) -> Vec<(LookupHandle, FailureCallback)> {
        self.0.lock().unwrap().cancels.clone()
    }

    pub fn fail_next(&self, error: SetupError) {
        self.0.lock().unwrap().fail_next = Some(error);
    }
}

impl AddressResolver for FakeResolver {
    fn lookup_node(&mut self, request: NodeLookupRequest) -> Result<LookupHandle, SetupError> {
        let mut log = self.0.lock().unwrap();
        if let Some(e) = log.fail_next.take() {
            return Err(e);
        }
        log.next_handle += 1;
        let handle = LookupHandle(log.next_handle);
        log.lookups.push((handle, request));
        Ok(handle)
    }

    fn cancel_lookup(
        &mut self,
        handle: LookupHandle,
        failure_callback: FailureCallback,
    ) -> Result<(), SetupError> {
        self.0.lock().unwrap().cancels.push((handle, failure_callback));
        Ok(())
    }
}

#[derive(Default)]
pub struct ClientLog {
    pub allocated: usize,
    pub released: usize,
    pub established: Vec<HandshakeParams>,
    pub mrp_updates: Vec<MrpConfig>,
    pub fail_allocate: bool,
    pub fail_establish: Option<SetupError>,
}

#[derive(Clone, Default)]
pub struct FakeClientPool(pub Arc<Mutex<ClientLog>>);

impl FakeClientPool {
    pub fn allocated(&self) -> usize {
        self.0.lock().unwrap().allocated
    }

    pub fn live(&self) -> usize {
        let log = self.0.lock().unwrap();
        log.allocated - log.released
    }

    /// Handle of the most recent allocation.
    pub fn last_handle(&self) -> HandshakeHandle {
        HandshakeHandle(self.allocated() as u64)
    }

    pub fn established(&self) -> Vec<HandshakeParams> {
        self.0.lock().unwrap().established.clone()
    }

    pub fn mrp_updates(&self) -> Vec<MrpConfig> {
        self.0.lock().unwrap().mrp_updates.clone()
    }

    pub fn fail_allocate(&self, fail: bool) {
        self.0.lock().unwrap().fail_allocate = fail;
    }

    pub fn fail_establish(&self, error: SetupError) {
        self.0.lock().unwrap().fail_establish = Some(error);
    }
}

struct FakeClient(Arc<Mutex<ClientLog>>);

impl HandshakeClient for FakeClient {
    fn establish_session(&mut self, params: &HandshakeParams) -> Result<(), SetupError> {
        let mut log = self.0.lock().unwrap();
        if let Some(e) = log.fail_establish.take() {
            return Err(e);
        }
        log.established.push(*params);
        Ok(())
    }

    fn set_remote_mrp_intervals(&mut self, mrp: MrpConfig) {
        self.0.lock().unwrap().mrp_updates.push(mrp);
    }
}

impl HandshakeClientPool for FakeClientPool {
    fn allocate(&mut self) -> Option<(HandshakeHandle, Box<dyn HandshakeClient>)> {
        let mut log = self.0.lock().unwrap();
        if log.fail_allocate {
            return None;
        }
        log.allocated += 1;
        let handle = HandshakeHandle(log.allocated as u64);
        Some((handle, Box::new(FakeClient(self.0.clone()))))
    }

    fn release(&mut self, _client: Box<dyn HandshakeClient>) {
        self.0.lock().unwrap().released += 1;
    }
}

pub const EXCHANGE_ID: u16 = 0x4242;

pub struct FixedExchange;

impl ExchangeManager for FixedExchange {
    fn new_exchange_id(&self, _session: &SessionHandle) -> u16 {
        EXCHANGE_ID
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connected { tag: u32, session: u16, exchange: u16 },
    Failed { tag: u32, peer: PeerId, error: SetupError },
}

/// Records callback invocations in firing order.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Call>>>);

impl Recorder {
    pub fn on_connected(&self, tag: u32) -> OnConnected {
        let calls = self.0.clone();
        Box::new(move |exchange: &dyn ExchangeManager, session: &SessionHandle| {
            calls.lock().unwrap().push(Call::Connected {
                tag,
                session: session.local_session_id(),
                exchange: exchange.new_exchange_id(session),
            });
        })
    }

    pub fn on_failure(&self, tag: u32) -> OnFailure {
        let calls = self.0.clone();
        Box::new(move |peer: PeerId, error: &SetupError| {
            calls.lock().unwrap().push(Call::Failed {
                tag,
                peer,
                error: error.clone(),
            });
        })
    }

    pub fn pair(&self, tag: u32) -> (Option<OnConnected>, Option<OnFailure>) {
        (Some(self.on_connected(tag)), Some(self.on_failure(tag)))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().unwrap().clone()
    }
}

/// Collaborators for driving a single session setup by hand.
pub struct Harness {
    pub fabrics: FabricList,
    pub sessions: SecureSessionTable,
    pub resolver: FakeResolver,
    pub clients: FakeClientPool,
}

impl Harness {
    pub fn new() -> Self {
        init_logging();
        Self {
            fabrics: fabrics(),
            sessions: SecureSessionTable::new(),
            resolver: FakeResolver::default(),
            clients: FakeClientPool::default(),
        }
    }

    pub fn ctx(&mut self) -> SetupContext<'_> {
        SetupContext {
            fabrics: &self.fabrics,
            sessions: &mut self.sessions,
            resolver: &mut self.resolver,
            clients: &mut self.clients,
        }
    }

    pub fn established_session(&self, peer: PeerId, address: PeerAddress) -> SessionHandle {
        self.sessions
            .create_session(peer, SessionType::Case, 0x77, address)
            .unwrap()
    }
}
