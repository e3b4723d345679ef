//! Pool of session setups keyed by peer.
//!
//! [SetupManager] owns every [SessionSetup] together with the collaborators they run against.
//! It creates an instance on the first request for a peer and removes it as soon as the
//! instance reports an outcome, before any waiter is notified.

use std::{collections::HashMap, sync::Arc};

use crate::{
    address::ResolveResult,
    config::SetupConfig,
    driver::SetupEvent,
    error::SetupError,
    exchange::ExchangeManager,
    fabric::FabricTable,
    handshake::{BoundedClientPool, HandshakeClient, HandshakeClientPool, HandshakeHandle},
    peer::PeerId,
    resolver::{AddressResolver, LookupHandle},
    session::{SessionHandle, SessionStore, SessionType},
    setup::{fsm::State, Completion, Disposition, OnConnected, OnFailure, SessionSetup, SetupContext},
};

/// Why an instance exists. Address refreshes never serve connect callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Connect,
    AddressUpdate,
}

type SetupKey = (PeerId, Purpose);

pub struct SetupManager {
    config: SetupConfig,
    fabrics: Box<dyn FabricTable>,
    sessions: Box<dyn SessionStore>,
    resolver: Box<dyn AddressResolver>,
    clients: Box<dyn HandshakeClientPool>,
    exchange: Arc<dyn ExchangeManager>,
    setups: HashMap<SetupKey, SessionSetup>,
}

impl SetupManager {
    pub fn new(
        config: SetupConfig,
        fabrics: Box<dyn FabricTable>,
        sessions: Box<dyn SessionStore>,
        resolver: Box<dyn AddressResolver>,
        clients: Box<dyn HandshakeClientPool>,
        exchange: Arc<dyn ExchangeManager>,
    ) -> Self {
        Self {
            config,
            fabrics,
            sessions,
            resolver,
            clients,
            exchange,
            setups: HashMap::new(),
        }
    }

    /// Like [new](Self::new), with a [BoundedClientPool] of `max_handshake_clients` clients.
    pub fn with_client_factory<F>(
        config: SetupConfig,
        fabrics: Box<dyn FabricTable>,
        sessions: Box<dyn SessionStore>,
        resolver: Box<dyn AddressResolver>,
        factory: F,
        exchange: Arc<dyn ExchangeManager>,
    ) -> Self
    where
        F: FnMut() -> Box<dyn HandshakeClient> + Send + 'static,
    {
        let clients = BoundedClientPool::new(config.max_handshake_clients, factory);
        Self::new(config, fabrics, sessions, resolver, Box::new(clients), exchange)
    }

    pub fn config(&self) -> &SetupConfig {
        &self.config
    }

    pub fn active_setups(&self) -> usize {
        self.setups.len()
    }

    /// State of the connect instance for `peer`, if one is pooled.
    pub fn state(&self, peer: PeerId) -> Option<State> {
        self.setups.get(&(peer, Purpose::Connect)).map(|s| s.state())
    }

    pub fn is_updating_address(&self, peer: PeerId) -> bool {
        self.setups.contains_key(&(peer, Purpose::AddressUpdate))
    }

    pub fn connect(
        &mut self,
        peer: PeerId,
        on_connected: Option<OnConnected>,
        on_failure: Option<OnFailure>,
    ) {
        let key = (peer, Purpose::Connect);
        if !self.setups.contains_key(&key) {
            if self.setups.len() >= self.config.max_session_setups {
                log::error!(
                    "no room for session setup to {} ({} in use)",
                    peer,
                    self.setups.len()
                );
                if let Some(callback) = on_failure {
                    callback(peer, &SetupError::NoMemory);
                }
                return;
            }
            log::debug!("new session setup for {}", peer);
            self.setups
                .insert(key, SessionSetup::new(peer, self.config.default_mrp));
        }
        self.dispatch(key, |setup, ctx| setup.connect(on_connected, on_failure, ctx));
    }

    /// Refresh the address of `peer` in the session store without connecting.
    pub fn update_peer_address(&mut self, peer: PeerId) -> Result<(), SetupError> {
        let key = (peer, Purpose::AddressUpdate);
        if self.setups.contains_key(&key) {
            log::debug!("address update for {} already running", peer);
            return Ok(());
        }
        if self.setups.len() >= self.config.max_session_setups {
            return Err(SetupError::NoMemory);
        }
        self.setups
            .insert(key, SessionSetup::new(peer, self.config.default_mrp));
        self.apply(key, |setup, ctx| setup.perform_address_update(ctx))
    }

    /// Push an address learnt elsewhere into the pending connect of `peer`.
    pub fn update_device_data(&mut self, peer: PeerId, result: ResolveResult) {
        self.dispatch((peer, Purpose::Connect), |setup, ctx| {
            setup.update_device_data(result.address, result.mrp, ctx)
        });
    }

    pub fn on_node_address_resolved(
        &mut self,
        peer: PeerId,
        handle: LookupHandle,
        result: ResolveResult,
    ) {
        match self.lookup_owner(peer, handle) {
            Some(key) => {
                self.dispatch(key, |setup, ctx| {
                    setup.on_node_address_resolved(handle, result, ctx)
                });
            }
            None => log::debug!("no setup of {} waits for lookup {:?}", peer, handle),
        }
    }

    pub fn on_node_address_resolution_failed(
        &mut self,
        peer: PeerId,
        handle: LookupHandle,
        error: SetupError,
    ) {
        match self.lookup_owner(peer, handle) {
            Some(key) => {
                self.dispatch(key, |setup, ctx| {
                    setup.on_node_address_resolution_failed(handle, error, ctx)
                });
            }
            None => log::debug!("no setup of {} waits for lookup {:?}", peer, handle),
        }
    }

    pub fn on_session_established(&mut self, handle: HandshakeHandle, session: &SessionHandle) {
        let peer = session.peer();
        match self.handshake_owner(peer, handle) {
            Some(key) => {
                self.dispatch(key, |setup, ctx| {
                    setup.on_session_established(handle, session, ctx)
                });
            }
            None => log::debug!("no setup of {} runs handshake {:?}", peer, handle),
        }
    }

    pub fn on_session_establishment_error(
        &mut self,
        peer: PeerId,
        handle: HandshakeHandle,
        error: SetupError,
    ) {
        match self.handshake_owner(peer, handle) {
            Some(key) => {
                self.dispatch(key, |setup, ctx| {
                    setup.on_session_establishment_error(handle, error, ctx)
                });
            }
            None => log::debug!(
                "no setup of {} runs handshake {:?}, dropping {}",
                peer,
                handle,
                error
            ),
        }
    }

    pub fn handle_event(&mut self, event: SetupEvent) {
        match event {
            SetupEvent::AddressResolved {
                peer,
                handle,
                result,
            } => self.on_node_address_resolved(peer, handle, result),
            SetupEvent::AddressResolutionFailed {
                peer,
                handle,
                error,
            } => self.on_node_address_resolution_failed(peer, handle, error),
            SetupEvent::SessionEstablished { handle, session } => {
                self.on_session_established(handle, &session)
            }
            SetupEvent::SessionEstablishmentError {
                peer,
                handle,
                error,
            } => self.on_session_establishment_error(peer, handle, error),
        }
    }

    pub fn find_existing_session(&self, peer: PeerId) -> Option<SessionHandle> {
        self.sessions
            .find_secure_session_for_node(peer, SessionType::Case)
            .and_then(|s| s.grab())
    }

    /// Mark the current CASE session of `peer` defunct.
    pub fn disconnect(&mut self, peer: PeerId) -> Result<(), SetupError> {
        let session = self
            .sessions
            .find_secure_session_for_node(peer, SessionType::Case)
            .ok_or(SetupError::IncorrectState)?;
        log::debug!(
            "marking session {} to {} defunct",
            session.local_session_id(),
            peer
        );
        session.mark_defunct();
        Ok(())
    }

    /// Drop every setup of `peer` without notifying its waiters.
    pub fn release_session_setup(&mut self, peer: PeerId) {
        for purpose in [Purpose::Connect, Purpose::AddressUpdate] {
            if let Some(setup) = self.setups.remove(&(peer, purpose)) {
                log::debug!("releasing {:?} setup for {}", purpose, peer);
                let mut ctx = SetupContext {
                    fabrics: self.fabrics.as_ref(),
                    sessions: self.sessions.as_mut(),
                    resolver: self.resolver.as_mut(),
                    clients: self.clients.as_mut(),
                };
                setup.teardown(&mut ctx);
            }
        }
    }

    pub fn shutdown(&mut self) {
        if !self.setups.is_empty() {
            log::debug!("shutting down {} session setups", self.setups.len());
        }
        let mut ctx = SetupContext {
            fabrics: self.fabrics.as_ref(),
            sessions: self.sessions.as_mut(),
            resolver: self.resolver.as_mut(),
            clients: self.clients.as_mut(),
        };
        for (_, setup) in self.setups.drain() {
            setup.teardown(&mut ctx);
        }
    }

    fn lookup_owner(&self, peer: PeerId, handle: LookupHandle) -> Option<SetupKey> {
        [Purpose::Connect, Purpose::AddressUpdate]
            .into_iter()
            .map(|purpose| (peer, purpose))
            .find(|key| {
                self.setups
                    .get(key)
                    .is_some_and(|s| s.lookup_handle() == Some(handle))
            })
    }

    fn handshake_owner(&self, peer: PeerId, handle: HandshakeHandle) -> Option<SetupKey> {
        [Purpose::Connect, Purpose::AddressUpdate]
            .into_iter()
            .map(|purpose| (peer, purpose))
            .find(|key| {
                self.setups
                    .get(key)
                    .is_some_and(|s| s.handshake_handle() == Some(handle))
            })
    }

    fn dispatch<F>(&mut self, key: SetupKey, f: F)
    where
        F: FnOnce(&mut SessionSetup, &mut SetupContext<'_>) -> Disposition,
    {
        if let Err(e) = self.apply(key, |setup, ctx| Ok(f(setup, ctx))) {
            log::error!("{:?} setup for {}: {}", key.1, key.0, e);
        }
    }

    /// Run `f` on the pooled setup and release it if it reports an outcome.
    fn apply<F>(&mut self, key: SetupKey, f: F) -> Result<(), SetupError>
    where
        F: FnOnce(&mut SessionSetup, &mut SetupContext<'_>) -> Result<Disposition, SetupError>,
    {
        let Some(setup) = self.setups.get_mut(&key) else {
            log::debug!("no {:?} setup for {}", key.1, key.0);
            return Ok(());
        };
        let mut ctx = SetupContext {
            fabrics: self.fabrics.as_ref(),
            sessions: self.sessions.as_mut(),
            resolver: self.resolver.as_mut(),
            clients: self.clients.as_mut(),
        };
        match f(setup, &mut ctx) {
            Ok(Disposition::Pending) => Ok(()),
            Ok(Disposition::Released(completion)) => {
                self.release(key, completion);
                Ok(())
            }
            Err(e) => {
                if let Some(setup) = self.setups.remove(&key) {
                    setup.teardown(&mut ctx);
                }
                Err(e)
            }
        }
    }

    fn release(&mut self, key: SetupKey, completion: Completion) {
        let setup = self.setups.remove(&key);
        completion.notify(self.exchange.as_ref());
        if let Some(setup) = setup {
            let mut ctx = SetupContext {
                fabrics: self.fabrics.as_ref(),
                sessions: self.sessions.as_mut(),
                resolver: self.resolver.as_mut(),
                clients: self.clients.as_mut(),
            };
            setup.teardown(&mut ctx);
        }
    }
}

impl Drop for SetupManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
