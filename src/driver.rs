//! Async front end of the session setup pool.
//!
//! [SetupDriver] moves a [SetupManager] onto its own tokio task. Caller requests and
//! collaborator completions are queued on one channel and handled one at a time, so no
//! session setup is ever entered concurrently.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use matc_case::{config::SetupConfig, driver, exchange::RandomExchangeIds, fabric::FabricList,
//! #     handshake::HandshakeClient, manager::SetupManager, peer::PeerId,
//! #     resolver::mdns::MdnsResolver, session::SecureSessionTable};
//! # async fn f(fabrics: FabricList, new_client: fn() -> Box<dyn HandshakeClient>) -> anyhow::Result<()> {
//! let config = SetupConfig::default();
//! let (sink, queue) = driver::channel();
//! let resolver = MdnsResolver::new(sink.clone(), config.lookup_timeout(), config.default_mrp);
//! let manager = SetupManager::with_client_factory(
//!     config,
//!     Box::new(fabrics),
//!     Box::new(SecureSessionTable::new()),
//!     Box::new(resolver),
//!     new_client,
//!     Arc::new(RandomExchangeIds),
//! );
//! let driver = driver::SetupDriver::spawn(manager, queue);
//! let session = driver.connect(PeerId::new(1, 300)).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    address::ResolveResult,
    error::SetupError,
    exchange::ExchangeManager,
    handshake::HandshakeHandle,
    manager::SetupManager,
    peer::PeerId,
    resolver::LookupHandle,
    session::SessionHandle,
};

/// Completion reported by a resolver or a handshake client.
#[derive(Debug, Clone)]
pub enum SetupEvent {
    AddressResolved {
        peer: PeerId,
        handle: LookupHandle,
        result: ResolveResult,
    },
    AddressResolutionFailed {
        peer: PeerId,
        handle: LookupHandle,
        error: SetupError,
    },
    /// `handle` is the one the client got in its [HandshakeParams](crate::handshake::HandshakeParams)
    SessionEstablished {
        handle: HandshakeHandle,
        session: SessionHandle,
    },
    SessionEstablishmentError {
        peer: PeerId,
        handle: HandshakeHandle,
        error: SetupError,
    },
}

type Reply<T> = oneshot::Sender<Result<T, SetupError>>;

enum Request {
    Connect {
        peer: PeerId,
        reply: Reply<SessionHandle>,
    },
    Disconnect {
        peer: PeerId,
        reply: Reply<()>,
    },
    UpdatePeerAddress {
        peer: PeerId,
        reply: Reply<()>,
    },
    UpdateDeviceData {
        peer: PeerId,
        result: ResolveResult,
    },
    Event(SetupEvent),
}

/// Where collaborators post their completions.
#[derive(Clone)]
pub struct EventSink(mpsc::UnboundedSender<Request>);

impl EventSink {
    pub fn post(&self, event: SetupEvent) {
        if let Err(e) = self.0.send(Request::Event(event)) {
            if let Request::Event(event) = e.0 {
                log::debug!("driver stopped, dropping {:?}", event);
            }
        }
    }
}

pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Request>,
    rx: mpsc::UnboundedReceiver<Request>,
}

impl RequestQueue {
    #[cfg(test)]
    pub(crate) async fn recv_event(&mut self) -> Option<SetupEvent> {
        while let Some(request) = self.rx.recv().await {
            if let Request::Event(event) = request {
                return Some(event);
            }
        }
        None
    }
}

pub fn channel() -> (EventSink, RequestQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink(tx.clone()), RequestQueue { tx, rx })
}

pub struct SetupDriver {
    requests: mpsc::UnboundedSender<Request>,
    cancel: CancellationToken,
}

impl SetupDriver {
    pub fn spawn(manager: SetupManager, queue: RequestQueue) -> Self {
        let cancel = CancellationToken::new();
        let RequestQueue { tx, rx } = queue;
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            run(manager, rx, loop_cancel).await;
        });
        Self {
            requests: tx,
            cancel,
        }
    }

    /// Resolves once every waiter of the peer has been told the outcome.
    pub async fn connect(&self, peer: PeerId) -> Result<SessionHandle, SetupError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Connect { peer, reply })?;
        rx.await.map_err(|_| SetupError::DriverStopped)?
    }

    pub async fn disconnect(&self, peer: PeerId) -> Result<(), SetupError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Disconnect { peer, reply })?;
        rx.await.map_err(|_| SetupError::DriverStopped)?
    }

    /// Starts an address refresh; resolves once the lookup is under way.
    pub async fn update_peer_address(&self, peer: PeerId) -> Result<(), SetupError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::UpdatePeerAddress { peer, reply })?;
        rx.await.map_err(|_| SetupError::DriverStopped)?
    }

    pub fn update_device_data(&self, peer: PeerId, result: ResolveResult) -> Result<(), SetupError> {
        self.send(Request::UpdateDeviceData { peer, result })
    }

    pub fn event_sink(&self) -> EventSink {
        EventSink(self.requests.clone())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn send(&self, request: Request) -> Result<(), SetupError> {
        self.requests
            .send(request)
            .map_err(|_| SetupError::DriverStopped)
    }
}

impl Drop for SetupDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    mut manager: SetupManager,
    mut requests: mpsc::UnboundedReceiver<Request>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            request = requests.recv() => {
                match request {
                    Some(request) => handle_request(&mut manager, request),
                    None => break,
                }
            }
        }
    }
    // pending replies are dropped with their setups
    manager.shutdown();
    log::debug!("session setup driver stopped");
}

fn handle_request(manager: &mut SetupManager, request: Request) {
    match request {
        Request::Connect { peer, reply } => {
            let slot = Arc::new(Mutex::new(Some(reply)));
            let failure_slot = slot.clone();
            manager.connect(
                peer,
                Some(Box::new(
                    move |_exchange: &dyn ExchangeManager, session: &SessionHandle| {
                        send_reply(&slot, Ok(session.clone()));
                    },
                )),
                Some(Box::new(move |_peer: PeerId, error: &SetupError| {
                    send_reply(&failure_slot, Err(error.clone()));
                })),
            );
        }
        Request::Disconnect { peer, reply } => {
            let _ = reply.send(manager.disconnect(peer));
        }
        Request::UpdatePeerAddress { peer, reply } => {
            let _ = reply.send(manager.update_peer_address(peer));
        }
        Request::UpdateDeviceData { peer, result } => manager.update_device_data(peer, result),
        Request::Event(event) => manager.handle_event(event),
    }
}

fn send_reply<T>(slot: &Mutex<Option<Reply<T>>>, result: Result<T, SetupError>) {
    let reply = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(reply) = reply {
        if reply.send(result).is_err() {
            log::debug!("connect caller went away");
        }
    }
}
