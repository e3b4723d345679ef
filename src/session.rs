//! Secure session table shared by every session setup and the rest of the stack.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{address::PeerAddress, peer::PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    /// certificate authenticated (operational)
    Case,
    /// passcode authenticated (commissioning)
    Pase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// no longer preferred for new exchanges; traffic from the peer revives it
    Defunct,
    /// released; handles to it can not be grabbed anymore
    Expired,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Active,
            1 => SessionState::Defunct,
            _ => SessionState::Expired,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionState::Active => 0,
            SessionState::Defunct => 1,
            SessionState::Expired => 2,
        }
    }
}

pub struct SecureSession {
    local_session_id: u16,
    peer_session_id: u16,
    peer: PeerId,
    kind: SessionType,
    state: AtomicU8,
    peer_address: Mutex<PeerAddress>,
}

/// Reference counted handle to a secure session.
#[derive(Clone)]
pub struct SessionHandle(Arc<SecureSession>);

impl SessionHandle {
    fn new(
        local_session_id: u16,
        peer_session_id: u16,
        peer: PeerId,
        kind: SessionType,
        address: PeerAddress,
    ) -> Self {
        Self(Arc::new(SecureSession {
            local_session_id,
            peer_session_id,
            peer,
            kind,
            state: AtomicU8::new(SessionState::Active.as_u8()),
            peer_address: Mutex::new(address),
        }))
    }

    pub fn local_session_id(&self) -> u16 {
        self.0.local_session_id
    }

    pub fn peer_session_id(&self) -> u16 {
        self.0.peer_session_id
    }

    pub fn peer(&self) -> PeerId {
        self.0.peer
    }

    pub fn kind(&self) -> SessionType {
        self.0.kind
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub fn peer_address(&self) -> PeerAddress {
        *self.0.peer_address.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_peer_address(&self, address: PeerAddress) {
        *self.0.peer_address.lock().unwrap_or_else(PoisonError::into_inner) = address;
    }

    /// Take an additional reference. Fails once the session expired.
    pub fn grab(&self) -> Option<SessionHandle> {
        if self.state() == SessionState::Expired {
            return None;
        }
        Some(self.clone())
    }

    pub fn mark_defunct(&self) {
        self.transition(SessionState::Active, SessionState::Defunct);
    }

    pub fn mark_active(&self) {
        self.transition(SessionState::Defunct, SessionState::Active);
    }

    pub fn expire(&self) {
        self.0
            .state
            .store(SessionState::Expired.as_u8(), Ordering::Release);
    }

    fn transition(&self, from: SessionState, to: SessionState) {
        _ = self.0.state.compare_exchange(
            from.as_u8(),
            to.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

impl PartialEq for SessionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SessionHandle {}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("local_session_id", &self.local_session_id())
            .field("peer", &self.peer())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

/// Queries and updates a session setup needs from the secure session table.
pub trait SessionStore: Send {
    fn find_secure_session_for_node(&self, peer: PeerId, kind: SessionType) -> Option<SessionHandle>;

    fn update_all_sessions_peer_address(&mut self, peer: PeerId, address: PeerAddress);
}

struct TableInner {
    sessions: Vec<SessionHandle>,
    next_session_id: u16,
}

/// In-memory session table. Clones share the same sessions.
#[derive(Clone)]
pub struct SecureSessionTable {
    inner: Arc<Mutex<TableInner>>,
}

impl SecureSessionTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableInner {
                sessions: Vec::new(),
                next_session_id: rand::random(),
            })),
        }
    }

    /// Register a freshly established session. None when all local session ids are taken.
    pub fn create_session(
        &self,
        peer: PeerId,
        kind: SessionType,
        peer_session_id: u16,
        address: PeerAddress,
    ) -> Option<SessionHandle> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .sessions
            .retain(|s| s.state() != SessionState::Expired);
        let local_session_id = allocate_session_id(&mut inner)?;
        let handle = SessionHandle::new(local_session_id, peer_session_id, peer, kind, address);
        log::debug!(
            "new {:?} session {} with {} at {}",
            kind,
            local_session_id,
            peer,
            address
        );
        inner.sessions.push(handle.clone());
        Some(handle)
    }

    /// Drop expired sessions from the table; returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = inner.sessions.len();
        inner
            .sessions
            .retain(|s| s.state() != SessionState::Expired);
        before - inner.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sessions
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SecureSessionTable {
    fn default() -> Self {
        Self::new()
    }
}

fn allocate_session_id(inner: &mut TableInner) -> Option<u16> {
    for _ in 0..=u16::MAX {
        let candidate = inner.next_session_id;
        inner.next_session_id = inner.next_session_id.wrapping_add(1);
        if candidate == 0 {
            continue;
        }
        if inner
            .sessions
            .iter()
            .all(|s| s.local_session_id() != candidate)
        {
            return Some(candidate);
        }
    }
    None
}

impl SessionStore for SecureSessionTable {
    fn find_secure_session_for_node(&self, peer: PeerId, kind: SessionType) -> Option<SessionHandle> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        // newest first
        inner
            .sessions
            .iter()
            .rev()
            .find(|s| s.peer() == peer && s.kind() == kind && s.state() == SessionState::Active)
            .cloned()
    }

    fn update_all_sessions_peer_address(&mut self, peer: PeerId, address: PeerAddress) {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for session in inner.sessions.iter().filter(|s| {
            s.peer() == peer && s.kind() == SessionType::Case && s.state() != SessionState::Expired
        }) {
            log::trace!(
                "session {} with {} moves to {}",
                session.local_session_id(),
                peer,
                address
            );
            session.set_peer_address(address);
        }
    }
}
