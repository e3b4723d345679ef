//! Operational session setup towards one peer.
//!
//! A [SessionSetup] gets a CASE session to a peer known only by its [PeerId]:
//! - reuse a secure session already present in the session store
//! - otherwise resolve the peer address (unless one is cached) and run a handshake
//! - queue every caller and notify all of them once an outcome is known
//!
//! Entry points which can reach an outcome return a [Disposition]. `Released` means the setup
//! is done: its owner must take it out of its pool, [notify](Completion::notify) the waiters
//! and [teardown](SessionSetup::teardown) the setup. Waiters are never notified while the
//! setup is still borrowed, so a callback can not reach back into it.
//!
//! Collaborators are passed in through [SetupContext] on every call.

pub mod fsm;

use std::{collections::VecDeque, fmt, mem};

use crate::{
    address::{MrpConfig, PeerAddress, ResolveResult},
    error::SetupError,
    exchange::ExchangeManager,
    fabric::FabricTable,
    handshake::{HandshakeClient, HandshakeClientPool, HandshakeHandle, HandshakeParams},
    peer::PeerId,
    resolver::{AddressResolver, FailureCallback, LookupHandle, NodeLookupRequest},
    session::{SessionHandle, SessionStore, SessionType},
};
use fsm::{Effect, Event, State, Verdict};

pub type OnConnected = Box<dyn FnOnce(&dyn ExchangeManager, &SessionHandle) + Send>;
pub type OnFailure = Box<dyn FnOnce(PeerId, &SetupError) + Send>;

pub struct SetupContext<'a> {
    pub fabrics: &'a dyn FabricTable,
    pub sessions: &'a mut dyn SessionStore,
    pub resolver: &'a mut dyn AddressResolver,
    pub clients: &'a mut dyn HandshakeClientPool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Connected(SessionHandle),
    /// address refresh finished, no session involved
    AddressUpdated,
    Failed(SetupError),
}

/// Everything needed to notify the waiters, detached from the setup.
pub struct Completion {
    peer: PeerId,
    outcome: Outcome,
    on_connected: Vec<OnConnected>,
    on_failure: Vec<OnFailure>,
}

impl Completion {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// Fire the callbacks of the outcome's class in the order they were queued.
    /// Callbacks of the other class are dropped unfired.
    pub fn notify(self, exchange: &dyn ExchangeManager) {
        let Completion {
            peer,
            outcome,
            on_connected,
            on_failure,
        } = self;
        match outcome {
            Outcome::Connected(session) => {
                drop(on_failure);
                for callback in on_connected {
                    callback(exchange, &session);
                }
            }
            Outcome::Failed(error) => {
                drop(on_connected);
                for callback in on_failure {
                    callback(peer, &error);
                }
            }
            Outcome::AddressUpdated => {
                if !on_connected.is_empty() {
                    log::warn!(
                        "address update for {} finished with {} connect waiters",
                        peer,
                        on_connected.len()
                    );
                }
            }
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("peer", &self.peer)
            .field("outcome", &self.outcome)
            .field("on_connected", &self.on_connected.len())
            .field("on_failure", &self.on_failure.len())
            .finish()
    }
}

#[must_use = "a released session setup has to be removed and its waiters notified"]
#[derive(Debug)]
pub enum Disposition {
    /// waiting for a resolver or handshake completion
    Pending,
    Released(Completion),
}

impl Disposition {
    pub fn is_released(&self) -> bool {
        matches!(self, Disposition::Released(_))
    }

    pub fn into_completion(self) -> Option<Completion> {
        match self {
            Disposition::Pending => None,
            Disposition::Released(c) => Some(c),
        }
    }
}

pub struct SessionSetup {
    peer: PeerId,
    state: State,
    address: Option<PeerAddress>,
    mrp: MrpConfig,
    on_connected: Vec<OnConnected>,
    on_failure: Vec<OnFailure>,
    /// Some exactly while Connecting
    client: Option<(HandshakeHandle, Box<dyn HandshakeClient>)>,
    lookup: Option<LookupHandle>,
    performing_address_update: bool,
    session: Option<SessionHandle>,
}

impl SessionSetup {
    pub fn new(peer: PeerId, default_mrp: MrpConfig) -> Self {
        let state = if peer.is_valid() {
            State::NeedsAddress
        } else {
            log::error!("SessionSetup[{}]: invalid peer id", peer);
            State::Uninitialized
        };
        Self {
            peer,
            state,
            address: None,
            mrp: default_mrp,
            on_connected: Vec::new(),
            on_failure: Vec::new(),
            client: None,
            lookup: None,
            performing_address_update: false,
            session: None,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_resolving_address(&self) -> bool {
        self.state == State::ResolvingAddress
    }

    pub fn is_performing_address_update(&self) -> bool {
        self.performing_address_update
    }

    pub fn lookup_handle(&self) -> Option<LookupHandle> {
        self.lookup
    }

    pub fn address(&self) -> Option<PeerAddress> {
        self.address
    }

    pub fn mrp(&self) -> MrpConfig {
        self.mrp
    }

    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    pub fn has_handshake_client(&self) -> bool {
        self.client.is_some()
    }

    /// Handle of the running handshake; only its completions are accepted.
    pub fn handshake_handle(&self) -> Option<HandshakeHandle> {
        self.client.as_ref().map(|(handle, _)| *handle)
    }

    pub fn waiters(&self) -> usize {
        self.on_connected.len().max(self.on_failure.len())
    }

    /// Queue the callbacks and move towards a session. The outcome is only ever reported
    /// through the callbacks.
    pub fn connect(
        &mut self,
        on_connected: Option<OnConnected>,
        on_failure: Option<OnFailure>,
        ctx: &mut SetupContext<'_>,
    ) -> Disposition {
        // queue first: no path below may lose a caller
        if let Some(callback) = on_connected {
            self.on_connected.push(callback);
        }
        if let Some(callback) = on_failure {
            self.on_failure.push(callback);
        }
        self.run(Event::Connect, ctx)
    }

    /// Push a known address, superseding any outstanding lookup.
    pub fn update_device_data(
        &mut self,
        address: PeerAddress,
        mrp: MrpConfig,
        ctx: &mut SetupContext<'_>,
    ) -> Disposition {
        if let Some(handle) = self.lookup.take() {
            if let Err(e) = ctx.resolver.cancel_lookup(handle, FailureCallback::Skip) {
                log::debug!("SessionSetup[{}]: cancel lookup: {}", self.peer, e);
            }
        }
        self.apply_device_data(address, mrp, ctx)
    }

    pub fn on_node_address_resolved(
        &mut self,
        handle: LookupHandle,
        result: ResolveResult,
        ctx: &mut SetupContext<'_>,
    ) -> Disposition {
        if self.lookup != Some(handle) {
            log::debug!(
                "SessionSetup[{}]: ignoring result of inactive lookup {:?}",
                self.peer,
                handle
            );
            return Disposition::Pending;
        }
        self.lookup = None;
        log::debug!("SessionSetup[{}]: resolved to {}", self.peer, result.address);
        self.apply_device_data(result.address, result.mrp, ctx)
    }

    pub fn on_node_address_resolution_failed(
        &mut self,
        handle: LookupHandle,
        error: SetupError,
        ctx: &mut SetupContext<'_>,
    ) -> Disposition {
        if self.lookup != Some(handle) {
            log::debug!(
                "SessionSetup[{}]: ignoring failure of inactive lookup {:?}",
                self.peer,
                handle
            );
            return Disposition::Pending;
        }
        self.lookup = None;
        log::error!("SessionSetup[{}]: address resolution failed: {}", self.peer, error);
        self.run(Event::ResolutionFailed(error), ctx)
    }

    /// Refresh the peer address without connecting. Only valid on a fresh setup; repeated
    /// calls while a refresh runs are ignored.
    pub fn perform_address_update(
        &mut self,
        ctx: &mut SetupContext<'_>,
    ) -> Result<Disposition, SetupError> {
        if self.performing_address_update {
            log::debug!("SessionSetup[{}]: address update already running", self.peer);
            return Ok(Disposition::Pending);
        }
        self.performing_address_update = true;
        let result = self.dispatch(Event::AddressUpdateRequested, ctx);
        if result.is_err() {
            self.performing_address_update = false;
        }
        result
    }

    /// Soft teardown of the connected session; the address is kept.
    pub fn disconnect(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), SetupError> {
        self.dispatch(Event::Disconnect, ctx).map(|_| ())
    }

    pub fn on_session_established(
        &mut self,
        handle: HandshakeHandle,
        session: &SessionHandle,
        ctx: &mut SetupContext<'_>,
    ) -> Disposition {
        if self.handshake_handle() != Some(handle) {
            log::debug!(
                "SessionSetup[{}]: ignoring session from inactive handshake {:?}",
                self.peer,
                handle
            );
            return Disposition::Pending;
        }
        let grabbed = match session.grab() {
            Some(session) => {
                self.session = Some(session);
                true
            }
            None => {
                log::warn!(
                    "SessionSetup[{}]: established session {} already gone, ignoring",
                    self.peer,
                    session.local_session_id()
                );
                false
            }
        };
        self.run(Event::SessionEstablished { grabbed }, ctx)
    }

    pub fn on_session_establishment_error(
        &mut self,
        handle: HandshakeHandle,
        error: SetupError,
        ctx: &mut SetupContext<'_>,
    ) -> Disposition {
        if self.handshake_handle() != Some(handle) {
            log::debug!(
                "SessionSetup[{}]: ignoring error {} of inactive handshake {:?}",
                self.peer,
                error,
                handle
            );
            return Disposition::Pending;
        }
        self.run(Event::SessionEstablishmentError(error), ctx)
    }

    /// Return everything borrowed from the collaborators. Queued waiters are dropped unfired.
    pub fn teardown(mut self, ctx: &mut SetupContext<'_>) {
        if let Some(handle) = self.lookup.take() {
            // no failure report: there is nobody left to receive it
            if let Err(e) = ctx.resolver.cancel_lookup(handle, FailureCallback::Skip) {
                log::debug!("SessionSetup[{}]: cancel lookup: {}", self.peer, e);
            }
        }
        self.release_client(ctx);
        if self.waiters() > 0 {
            log::debug!(
                "SessionSetup[{}]: dropping {} waiters",
                self.peer,
                self.waiters()
            );
        }
    }

    fn apply_device_data(
        &mut self,
        address: PeerAddress,
        mrp: MrpConfig,
        ctx: &mut SetupContext<'_>,
    ) -> Disposition {
        if self.state == State::Uninitialized {
            return Disposition::Pending;
        }
        self.address = Some(address);
        self.mrp = mrp;
        if let Some((_, client)) = self.client.as_mut() {
            client.set_remote_mrp_intervals(mrp);
        }
        let mut refresh_only = self.performing_address_update;
        if refresh_only && self.waiters() > 0 {
            log::debug!(
                "SessionSetup[{}]: callers joined the address update, connecting",
                self.peer
            );
            self.performing_address_update = false;
            refresh_only = false;
        }
        self.run(Event::AddressResolved { refresh_only }, ctx)
    }

    fn run(&mut self, event: Event, ctx: &mut SetupContext<'_>) -> Disposition {
        match self.dispatch(event, ctx) {
            Ok(disposition) => disposition,
            Err(e) => self.complete(Verdict::Failure(e)),
        }
    }

    fn dispatch(&mut self, event: Event, ctx: &mut SetupContext<'_>) -> Result<Disposition, SetupError> {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            let transition = fsm::step(self.state, &event);
            log::trace!("SessionSetup[{}]: {:?} in {:?}", self.peer, event, self.state);
            self.move_to_state(transition.next);
            for effect in transition.effects {
                match effect {
                    Effect::ReleaseHandshakeClient => self.release_client(ctx),
                    Effect::TryReuse => {
                        let found = self.attach_to_existing_secure_session(ctx);
                        events.push_back(Event::ReuseAttempted { found });
                    }
                    Effect::StartLookup => {
                        if let Err(e) = self.lookup_peer_address(ctx) {
                            events.push_back(Event::LookupStartFailed(e));
                        }
                    }
                    Effect::StartHandshake => match self.establish_connection(ctx) {
                        Ok(()) => events.push_back(Event::HandshakeStarted),
                        Err(e) => events.push_back(Event::HandshakeStartFailed(e)),
                    },
                    Effect::PropagateAddress => {
                        if let Some(address) = self.address {
                            ctx.sessions.update_all_sessions_peer_address(self.peer, address);
                        }
                    }
                    Effect::MarkSessionDefunct => {
                        if let Some(session) = self.session.take() {
                            session.mark_defunct();
                        }
                    }
                    Effect::Reject(e) => {
                        log::error!(
                            "SessionSetup[{}]: {:?} refused in {:?}",
                            self.peer,
                            event,
                            self.state
                        );
                        return Err(e);
                    }
                    Effect::Flush(verdict) => return Ok(self.complete(verdict)),
                }
            }
        }
        debug_assert_eq!(self.client.is_some(), self.state == State::Connecting);
        Ok(Disposition::Pending)
    }

    fn move_to_state(&mut self, next: State) {
        if self.state != next {
            log::debug!(
                "SessionSetup[{}]: state change {:?} --> {:?}",
                self.peer,
                self.state,
                next
            );
            self.state = next;
        }
    }

    /// Detach the waiters together with the outcome.
    fn complete(&mut self, verdict: Verdict) -> Disposition {
        let outcome = match verdict {
            Verdict::Success => match &self.session {
                Some(session) => Outcome::Connected(session.clone()),
                None => Outcome::AddressUpdated,
            },
            Verdict::Failure(e) => Outcome::Failed(e),
        };
        self.performing_address_update = false;
        log::debug!(
            "SessionSetup[{}]: {:?} for {} waiters",
            self.peer,
            outcome,
            self.waiters()
        );
        Disposition::Released(Completion {
            peer: self.peer,
            outcome,
            on_connected: mem::take(&mut self.on_connected),
            on_failure: mem::take(&mut self.on_failure),
        })
    }

    fn attach_to_existing_secure_session(&mut self, ctx: &mut SetupContext<'_>) -> bool {
        if !matches!(
            self.state,
            State::NeedsAddress | State::ResolvingAddress | State::HasAddress
        ) {
            return false;
        }
        let Some(session) = ctx
            .sessions
            .find_secure_session_for_node(self.peer, SessionType::Case)
        else {
            return false;
        };
        log::debug!(
            "SessionSetup[{}]: reusing session {}",
            self.peer,
            session.local_session_id()
        );
        self.address = Some(session.peer_address());
        match session.grab() {
            Some(session) => {
                self.session = Some(session);
                true
            }
            None => false,
        }
    }

    fn lookup_peer_address(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), SetupError> {
        if self.lookup.is_some() {
            log::debug!("SessionSetup[{}]: lookup already in progress", self.peer);
            return Ok(());
        }
        let index = self.peer.fabric_index;
        let compressed_fabric_id = ctx
            .fabrics
            .compressed_fabric_id(index)
            .ok_or(SetupError::InvalidFabricIndex(index))?;
        let request = NodeLookupRequest::new(self.peer, compressed_fabric_id);
        log::debug!(
            "SessionSetup[{}]: looking up {}",
            self.peer,
            request.instance_name()
        );
        self.lookup = Some(ctx.resolver.lookup_node(request)?);
        Ok(())
    }

    fn establish_connection(&mut self, ctx: &mut SetupContext<'_>) -> Result<(), SetupError> {
        let address = self.address.ok_or(SetupError::IncorrectState)?;
        let (handle, mut client) = ctx.clients.allocate().ok_or(SetupError::NoMemory)?;
        let params = HandshakeParams {
            handle,
            peer: self.peer,
            address,
            mrp: self.mrp,
        };
        if let Err(e) = client.establish_session(&params) {
            ctx.clients.release(client);
            return Err(e);
        }
        log::debug!("SessionSetup[{}]: handshake {:?} started", self.peer, handle);
        self.client = Some((handle, client));
        Ok(())
    }

    fn release_client(&mut self, ctx: &mut SetupContext<'_>) {
        if let Some((_, client)) = self.client.take() {
            ctx.clients.release(client);
        }
    }
}

impl Drop for SessionSetup {
    fn drop(&mut self) {
        if self.lookup.is_some() || self.client.is_some() {
            log::warn!(
                "SessionSetup[{}]: dropped without teardown in {:?}",
                self.peer,
                self.state
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        peer::FabricIndex,
        session::SessionState,
        test_support::{addr, peer, Call, FixedExchange, Harness, Recorder, EXCHANGE_ID},
    };

    fn resolved(address: &str) -> ResolveResult {
        ResolveResult {
            address: addr(address),
            mrp: MrpConfig {
                idle_interval_ms: 800,
                active_interval_ms: 350,
                active_threshold_ms: 4000,
            },
        }
    }

    fn notify(disposition: Disposition) -> Outcome {
        let completion = disposition.into_completion().expect("setup not released");
        let outcome = completion.outcome().clone();
        completion.notify(&FixedExchange);
        outcome
    }

    fn connected(tag: u32, session: &SessionHandle) -> Call {
        Call::Connected {
            tag,
            session: session.local_session_id(),
            exchange: EXCHANGE_ID,
        }
    }

    fn failed(tag: u32, error: SetupError) -> Call {
        Call::Failed {
            tag,
            peer: peer(),
            error,
        }
    }

    #[test]
    fn resolve_then_handshake_then_connected() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());

        let (s, f) = rec.pair(1);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());
        assert_eq!(setup.state(), State::ResolvingAddress);
        assert!(setup.is_resolving_address());
        assert_eq!(h.resolver.lookups(), 1);
        let cfid = h.fabrics.compressed_fabric_id(FabricIndex(1)).unwrap();
        assert_eq!(h.resolver.last_request().compressed_fabric_id, cfid);
        assert_eq!(h.resolver.last_request().peer, peer());

        let result = resolved("[fd00::10]:5540");
        let handle = h.resolver.last_handle();
        assert!(!setup
            .on_node_address_resolved(handle, result, &mut h.ctx())
            .is_released());
        assert_eq!(setup.state(), State::Connecting);
        assert!(setup.has_handshake_client());
        assert_eq!(h.clients.allocated(), 1);
        let params = h.clients.established();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].peer, peer());
        assert_eq!(params[0].address, result.address);
        assert_eq!(params[0].mrp, result.mrp);
        assert!(rec.calls().is_empty());

        let session = h.established_session(peer(), result.address);
        let handshake = setup.handshake_handle().unwrap();
        assert_eq!(params[0].handle, handshake);
        let outcome = notify(setup.on_session_established(handshake, &session, &mut h.ctx()));
        assert_eq!(outcome, Outcome::Connected(session.clone()));
        assert_eq!(setup.state(), State::SecureConnected);
        assert!(!setup.has_handshake_client());
        assert_eq!(h.clients.live(), 0);
        assert_eq!(rec.calls(), vec![connected(1, &session)]);

        setup.teardown(&mut h.ctx());
        assert!(h.resolver.cancels().is_empty());
    }

    #[test]
    fn resolution_failure_rolls_back_to_needs_address() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(1);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());

        let handle = h.resolver.last_handle();
        let outcome = notify(setup.on_node_address_resolution_failed(
            handle,
            SetupError::Timeout,
            &mut h.ctx(),
        ));
        assert_eq!(outcome, Outcome::Failed(SetupError::Timeout));
        assert_eq!(rec.calls(), vec![failed(1, SetupError::Timeout)]);
        assert_eq!(setup.state(), State::NeedsAddress);
        assert_eq!(setup.lookup_handle(), None);
        setup.teardown(&mut h.ctx());
        assert!(h.resolver.cancels().is_empty());

        // a fresh setup starts over with a new lookup
        let mut again = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(2);
        assert!(!again.connect(s, f, &mut h.ctx()).is_released());
        assert_eq!(h.resolver.lookups(), 2);
        assert_eq!(again.state(), State::ResolvingAddress);
        again.teardown(&mut h.ctx());
    }

    #[test]
    fn existing_session_is_reused_without_lookup_or_handshake() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let session = h.established_session(peer(), addr("10.0.0.7:5540"));
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());

        let (s, f) = rec.pair(1);
        let outcome = notify(setup.connect(s, f, &mut h.ctx()));
        assert_eq!(outcome, Outcome::Connected(session.clone()));
        assert_eq!(rec.calls(), vec![connected(1, &session)]);
        assert_eq!(h.resolver.lookups(), 0);
        assert_eq!(h.clients.allocated(), 0);
        assert_eq!(setup.state(), State::SecureConnected);
        assert_eq!(setup.address(), Some(addr("10.0.0.7:5540")));
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn concurrent_connects_share_one_lookup_and_succeed_in_order() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());

        for tag in 1..=3 {
            let (s, f) = rec.pair(tag);
            assert!(!setup.connect(s, f, &mut h.ctx()).is_released());
        }
        assert_eq!(h.resolver.lookups(), 1);
        assert_eq!(setup.waiters(), 3);

        let handle = h.resolver.last_handle();
        let result = resolved("10.0.0.8:5540");
        assert!(!setup
            .on_node_address_resolved(handle, result, &mut h.ctx())
            .is_released());
        // joining while connecting adds a waiter only
        let (s, f) = rec.pair(4);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());
        assert_eq!(h.clients.allocated(), 1);

        let session = h.established_session(peer(), result.address);
        notify(setup.on_session_established(h.clients.last_handle(), &session, &mut h.ctx()));
        assert_eq!(
            rec.calls(),
            (1..=4).map(|tag| connected(tag, &session)).collect::<Vec<_>>()
        );
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn concurrent_connects_all_fail_alike() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        for tag in 1..=2 {
            let (s, f) = rec.pair(tag);
            assert!(!setup.connect(s, f, &mut h.ctx()).is_released());
        }
        let handle = h.resolver.last_handle();
        assert!(!setup
            .on_node_address_resolved(handle, resolved("10.0.0.8:5540"), &mut h.ctx())
            .is_released());

        let error = SetupError::Handshake("sigma2 rejected".into());
        notify(setup.on_session_establishment_error(
            h.clients.last_handle(),
            error.clone(),
            &mut h.ctx(),
        ));
        assert_eq!(
            rec.calls(),
            vec![failed(1, error.clone()), failed(2, error)]
        );
        // the address is kept, only the handshake client goes away
        assert_eq!(setup.state(), State::HasAddress);
        assert_eq!(setup.address(), Some(addr("10.0.0.8:5540")));
        assert_eq!(h.clients.live(), 0);

        // next attempt goes straight to a handshake
        let (s, f) = rec.pair(3);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());
        assert_eq!(setup.state(), State::Connecting);
        assert_eq!(h.resolver.lookups(), 1);
        assert_eq!(h.clients.allocated(), 2);
        setup.teardown(&mut h.ctx());
        assert_eq!(h.clients.live(), 0);
    }

    #[test]
    fn session_appearing_while_resolving_is_reused() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(1);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());
        let handle = h.resolver.last_handle();

        // e.g. the peer connected to us meanwhile
        let session = h.established_session(peer(), addr("10.0.0.9:5540"));
        let (s, f) = rec.pair(2);
        notify(setup.connect(s, f, &mut h.ctx()));
        assert_eq!(rec.calls(), vec![connected(1, &session), connected(2, &session)]);
        assert_eq!(h.resolver.lookups(), 1);

        setup.teardown(&mut h.ctx());
        assert_eq!(h.resolver.cancels(), vec![(handle, FailureCallback::Skip)]);
    }

    #[test]
    fn synchronous_lookup_failure_rolls_back() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        h.resolver.fail_next(SetupError::NoMemory);
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(1);
        let outcome = notify(setup.connect(s, f, &mut h.ctx()));
        assert_eq!(outcome, Outcome::Failed(SetupError::NoMemory));
        assert_eq!(rec.calls(), vec![failed(1, SetupError::NoMemory)]);
        assert_eq!(setup.state(), State::NeedsAddress);
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn removed_fabric_fails_lookup() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        h.fabrics.remove(FabricIndex(1));
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(1);
        notify(setup.connect(s, f, &mut h.ctx()));
        let error = SetupError::InvalidFabricIndex(FabricIndex(1));
        assert_eq!(rec.calls(), vec![failed(1, error)]);
        assert_eq!(h.resolver.lookups(), 0);
        assert_eq!(setup.state(), State::NeedsAddress);
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn pushed_address_starts_handshake_and_updates_sessions() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let stale = h.established_session(peer(), addr("10.0.0.1:5540"));
        stale.mark_defunct();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(1);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());
        let handle = h.resolver.last_handle();

        let result = resolved("[fd00::20]:5540");
        assert!(!setup
            .update_device_data(result.address, result.mrp, &mut h.ctx())
            .is_released());
        assert_eq!(setup.state(), State::Connecting);
        assert_eq!(h.clients.established().len(), 1);
        assert_eq!(stale.peer_address(), result.address);
        // the outstanding lookup is superseded
        assert_eq!(h.resolver.cancels(), vec![(handle, FailureCallback::Skip)]);
        assert_eq!(setup.lookup_handle(), None);

        // its late result is ignored
        assert!(!setup
            .on_node_address_resolved(handle, resolved("10.9.9.9:5540"), &mut h.ctx())
            .is_released());
        assert_eq!(setup.address(), Some(result.address));
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn address_update_does_not_handshake() {
        let mut h = Harness::new();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        assert!(!setup.perform_address_update(&mut h.ctx()).unwrap().is_released());
        assert!(setup.is_performing_address_update());
        assert_eq!(setup.state(), State::ResolvingAddress);

        // repeated request is ignored
        assert!(!setup.perform_address_update(&mut h.ctx()).unwrap().is_released());
        assert_eq!(h.resolver.lookups(), 1);

        let other = h.established_session(peer(), addr("10.0.0.1:5540"));
        let handle = h.resolver.last_handle();
        let result = resolved("10.0.0.2:5540");
        let outcome = notify(setup.on_node_address_resolved(handle, result, &mut h.ctx()));
        assert_eq!(outcome, Outcome::AddressUpdated);
        assert_eq!(setup.state(), State::HasAddress);
        assert!(!setup.is_performing_address_update());
        assert_eq!(h.clients.allocated(), 0);
        assert_eq!(other.peer_address(), result.address);
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn address_update_requires_fresh_setup() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(1);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());
        let handle = h.resolver.last_handle();
        assert!(!setup
            .on_node_address_resolved(handle, resolved("10.0.0.2:5540"), &mut h.ctx())
            .is_released());

        assert_eq!(
            setup.perform_address_update(&mut h.ctx()).unwrap_err(),
            SetupError::IncorrectState
        );
        assert!(!setup.is_performing_address_update());
        assert_eq!(setup.state(), State::Connecting);
        assert!(rec.calls().is_empty());
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn synchronous_address_update_failure_flushes() {
        let mut h = Harness::new();
        h.resolver.fail_next(SetupError::NoMemory);
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        let outcome = notify(setup.perform_address_update(&mut h.ctx()).unwrap());
        assert_eq!(outcome, Outcome::Failed(SetupError::NoMemory));
        assert!(!setup.is_performing_address_update());
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn connect_joining_an_address_update_gets_a_session() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        assert!(!setup.perform_address_update(&mut h.ctx()).unwrap().is_released());
        let (s, f) = rec.pair(1);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());
        assert_eq!(h.resolver.lookups(), 1);

        let handle = h.resolver.last_handle();
        assert!(!setup
            .on_node_address_resolved(handle, resolved("10.0.0.2:5540"), &mut h.ctx())
            .is_released());
        assert_eq!(setup.state(), State::Connecting);
        assert!(!setup.is_performing_address_update());

        let session = h.established_session(peer(), addr("10.0.0.2:5540"));
        notify(setup.on_session_established(h.clients.last_handle(), &session, &mut h.ctx()));
        assert_eq!(rec.calls(), vec![connected(1, &session)]);
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn handshake_allocation_failure() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(1);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());

        h.clients.fail_allocate(true);
        let handle = h.resolver.last_handle();
        notify(setup.on_node_address_resolved(handle, resolved("10.0.0.2:5540"), &mut h.ctx()));
        assert_eq!(rec.calls(), vec![failed(1, SetupError::NoMemory)]);
        assert_eq!(setup.state(), State::HasAddress);
        assert!(!setup.has_handshake_client());
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn handshake_start_failure_returns_client() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(1);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());

        let error = SetupError::Handshake("no route".into());
        h.clients.fail_establish(error.clone());
        let handle = h.resolver.last_handle();
        notify(setup.on_node_address_resolved(handle, resolved("10.0.0.2:5540"), &mut h.ctx()));
        assert_eq!(rec.calls(), vec![failed(1, error)]);
        assert_eq!(h.clients.allocated(), 1);
        assert_eq!(h.clients.live(), 0);
        assert_eq!(setup.state(), State::HasAddress);
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn uninitialized_setup_fails_immediately() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let bad = PeerId::new(0, 300);
        let mut setup = SessionSetup::new(bad, MrpConfig::default());
        assert_eq!(setup.state(), State::Uninitialized);

        assert!(!setup
            .update_device_data(addr("10.0.0.2:5540"), MrpConfig::default(), &mut h.ctx())
            .is_released());
        assert_eq!(setup.address(), None);

        let (s, f) = rec.pair(1);
        notify(setup.connect(s, f, &mut h.ctx()));
        assert_eq!(
            rec.calls(),
            vec![Call::Failed {
                tag: 1,
                peer: bad,
                error: SetupError::IncorrectState
            }]
        );
        assert_eq!(h.resolver.lookups(), 0);
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn invalid_session_grab_is_ignored() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(1);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());
        let handle = h.resolver.last_handle();
        assert!(!setup
            .on_node_address_resolved(handle, resolved("10.0.0.2:5540"), &mut h.ctx())
            .is_released());

        let gone = h.established_session(peer(), addr("10.0.0.2:5540"));
        gone.expire();
        let handshake = h.clients.last_handle();
        assert!(!setup
            .on_session_established(handshake, &gone, &mut h.ctx())
            .is_released());
        assert_eq!(setup.state(), State::Connecting);
        assert!(setup.has_handshake_client());
        assert!(rec.calls().is_empty());

        let session = h.established_session(peer(), addr("10.0.0.2:5540"));
        notify(setup.on_session_established(h.clients.last_handle(), &session, &mut h.ctx()));
        assert_eq!(rec.calls(), vec![connected(1, &session)]);
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn late_address_data_is_an_error() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(1);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());
        let handle = h.resolver.last_handle();
        assert!(!setup
            .on_node_address_resolved(handle, resolved("10.0.0.2:5540"), &mut h.ctx())
            .is_released());

        let fresher = resolved("10.0.0.3:5540");
        notify(setup.update_device_data(fresher.address, fresher.mrp, &mut h.ctx()));
        assert_eq!(rec.calls(), vec![failed(1, SetupError::IncorrectState)]);
        // the running handshake still learnt the new timing
        assert_eq!(h.clients.mrp_updates(), vec![fresher.mrp]);
        assert_eq!(setup.address(), Some(fresher.address));

        setup.teardown(&mut h.ctx());
        assert_eq!(h.clients.live(), 0);
    }

    #[test]
    fn disconnect_marks_session_defunct_and_keeps_address() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let session = h.established_session(peer(), addr("10.0.0.7:5540"));
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(1);
        notify(setup.connect(s, f, &mut h.ctx()));

        // already connected: success right away
        let (s, f) = rec.pair(2);
        notify(setup.connect(s, f, &mut h.ctx()));
        assert_eq!(rec.calls(), vec![connected(1, &session), connected(2, &session)]);

        setup.disconnect(&mut h.ctx()).unwrap();
        assert_eq!(setup.state(), State::HasAddress);
        assert_eq!(session.state(), SessionState::Defunct);
        assert!(setup.session().is_none());
        assert_eq!(setup.address(), Some(addr("10.0.0.7:5540")));
        assert_eq!(setup.disconnect(&mut h.ctx()), Err(SetupError::IncorrectState));

        // defunct sessions are not reused, the cached address is
        let (s, f) = rec.pair(3);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());
        assert_eq!(setup.state(), State::Connecting);
        assert_eq!(h.resolver.lookups(), 0);
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn teardown_returns_borrowed_resources() {
        let mut h = Harness::new();
        let mut resolving = SessionSetup::new(peer(), MrpConfig::default());
        assert!(!resolving.connect(None, None, &mut h.ctx()).is_released());
        let handle = h.resolver.last_handle();
        resolving.teardown(&mut h.ctx());
        assert_eq!(h.resolver.cancels(), vec![(handle, FailureCallback::Skip)]);

        let mut connecting = SessionSetup::new(PeerId::new(1, 301), MrpConfig::default());
        assert!(!connecting.connect(None, None, &mut h.ctx()).is_released());
        let handle = h.resolver.last_handle();
        assert!(!connecting
            .on_node_address_resolved(handle, resolved("10.0.0.2:5540"), &mut h.ctx())
            .is_released());
        assert_eq!(h.clients.live(), 1);
        connecting.teardown(&mut h.ctx());
        assert_eq!(h.clients.live(), 0);
    }

    #[test]
    fn establishment_error_before_resolution_is_ignored() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let mut setup = SessionSetup::new(peer(), MrpConfig::default());
        assert!(!setup
            .on_session_establishment_error(HandshakeHandle(1), SetupError::Timeout, &mut h.ctx())
            .is_released());
        assert_eq!(setup.state(), State::NeedsAddress);

        let (s, f) = rec.pair(1);
        assert!(!setup.connect(s, f, &mut h.ctx()).is_released());
        assert!(!setup
            .on_node_address_resolution_failed(LookupHandle(999), SetupError::Timeout, &mut h.ctx())
            .is_released());
        assert_eq!(setup.state(), State::ResolvingAddress);
        assert!(rec.calls().is_empty());
        setup.teardown(&mut h.ctx());
    }

    #[test]
    fn completions_of_a_released_handshake_are_ignored() {
        let mut h = Harness::new();
        let rec = Recorder::default();
        let mut first = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(1);
        assert!(!first.connect(s, f, &mut h.ctx()).is_released());
        let handle = h.resolver.last_handle();
        assert!(!first
            .on_node_address_resolved(handle, resolved("10.0.0.2:5540"), &mut h.ctx())
            .is_released());
        let stale = first.handshake_handle().unwrap();
        first.teardown(&mut h.ctx());
        assert_eq!(h.clients.live(), 0);

        // the client handed back may still report for its old attempt
        let mut second = SessionSetup::new(peer(), MrpConfig::default());
        let (s, f) = rec.pair(2);
        assert!(!second.connect(s, f, &mut h.ctx()).is_released());
        assert_eq!(second.state(), State::ResolvingAddress);
        let error = SetupError::Handshake("sigma2 timeout".into());
        assert!(!second
            .on_session_establishment_error(stale, error, &mut h.ctx())
            .is_released());
        let session = h.established_session(peer(), addr("10.0.0.2:5540"));
        session.mark_defunct();
        assert!(!second
            .on_session_established(stale, &session, &mut h.ctx())
            .is_released());
        assert_eq!(second.state(), State::ResolvingAddress);
        assert!(second.session().is_none());
        assert!(rec.calls().is_empty());

        // its own handshake still completes it
        let handle = h.resolver.last_handle();
        assert!(!second
            .on_node_address_resolved(handle, resolved("10.0.0.2:5540"), &mut h.ctx())
            .is_released());
        let current = second.handshake_handle().unwrap();
        assert_ne!(current, stale);
        assert!(!second
            .on_session_establishment_error(stale, SetupError::Timeout, &mut h.ctx())
            .is_released());
        assert_eq!(second.state(), State::Connecting);
        let session = h.established_session(peer(), addr("10.0.0.2:5540"));
        notify(second.on_session_established(current, &session, &mut h.ctx()));
        assert_eq!(rec.calls(), vec![connected(2, &session)]);
        second.teardown(&mut h.ctx());
    }
}
