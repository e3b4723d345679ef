//! Transition table of the session setup state machine.
//!
//! [step] is pure: it maps the current [State] and an [Event] to the next state plus the
//! [Effect]s the setup has to carry out against its collaborators, in order. Effects which
//! query collaborators (reuse check, lookup start, handshake start) report back by feeding a
//! follow-up event into [step].
//!
//! Two rules hold for every transition:
//! - leaving [State::Connecting] emits [Effect::ReleaseHandshakeClient] first
//! - [Effect::Flush] and [Effect::Reject] are always the last effect

use crate::error::SetupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// construction parameters were invalid; every request fails
    Uninitialized,
    NeedsAddress,
    ResolvingAddress,
    HasAddress,
    /// a handshake client is live
    Connecting,
    SecureConnected,
}

impl State {
    pub const ALL: [State; 6] = [
        State::Uninitialized,
        State::NeedsAddress,
        State::ResolvingAddress,
        State::HasAddress,
        State::Connecting,
        State::SecureConnected,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect,
    ReuseAttempted { found: bool },
    LookupStartFailed(SetupError),
    HandshakeStarted,
    HandshakeStartFailed(SetupError),
    /// new address data; `refresh_only` when nobody waits for a session
    AddressResolved { refresh_only: bool },
    ResolutionFailed(SetupError),
    AddressUpdateRequested,
    /// `grabbed` is false when the reported session was already gone
    SessionEstablished { grabbed: bool },
    SessionEstablishmentError(SetupError),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure(SetupError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    ReleaseHandshakeClient,
    TryReuse,
    StartLookup,
    StartHandshake,
    /// push the cached address into every session with this peer
    PropagateAddress,
    MarkSessionDefunct,
    /// refuse the request; waiters are not touched
    Reject(SetupError),
    /// drain all waiters with the verdict; the setup is done afterwards
    Flush(Verdict),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: State,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: State, effects: Vec<Effect>) -> Self {
        Self {
            next: state,
            effects,
        }
    }

    fn to(from: State, next: State, mut effects: Vec<Effect>) -> Self {
        if from == State::Connecting && next != State::Connecting {
            effects.insert(0, Effect::ReleaseHandshakeClient);
        }
        Self { next, effects }
    }
}

fn fail(error: SetupError) -> Effect {
    Effect::Flush(Verdict::Failure(error))
}

fn succeed() -> Effect {
    Effect::Flush(Verdict::Success)
}

pub fn step(state: State, event: &Event) -> Transition {
    use State::*;
    match event {
        Event::Connect => match state {
            Uninitialized => Transition::stay(state, vec![fail(SetupError::IncorrectState)]),
            NeedsAddress | ResolvingAddress | HasAddress => {
                Transition::stay(state, vec![Effect::TryReuse])
            }
            // the running handshake flushes everybody
            Connecting => Transition::stay(state, vec![]),
            SecureConnected => Transition::stay(state, vec![succeed()]),
        },

        Event::ReuseAttempted { found: true } => match state {
            NeedsAddress | ResolvingAddress | HasAddress => {
                Transition::to(state, SecureConnected, vec![succeed()])
            }
            _ => Transition::stay(state, vec![]),
        },

        Event::ReuseAttempted { found: false } => match state {
            // state first, so whatever the lookup start reports sees ResolvingAddress
            NeedsAddress => Transition::to(state, ResolvingAddress, vec![Effect::StartLookup]),
            HasAddress => Transition::stay(state, vec![Effect::StartHandshake]),
            _ => Transition::stay(state, vec![]),
        },

        Event::LookupStartFailed(e) => match state {
            ResolvingAddress => Transition::to(state, NeedsAddress, vec![fail(e.clone())]),
            _ => Transition::stay(state, vec![fail(e.clone())]),
        },

        Event::HandshakeStarted => match state {
            HasAddress => Transition::to(state, Connecting, vec![]),
            _ => Transition::stay(state, vec![]),
        },

        Event::HandshakeStartFailed(e) => Transition::stay(state, vec![fail(e.clone())]),

        Event::AddressResolved { refresh_only } => match state {
            Uninitialized => Transition::stay(state, vec![]),
            ResolvingAddress => {
                let last = if *refresh_only {
                    succeed()
                } else {
                    Effect::StartHandshake
                };
                Transition::to(state, HasAddress, vec![Effect::PropagateAddress, last])
            }
            _ => Transition::stay(state, vec![fail(SetupError::IncorrectState)]),
        },

        Event::ResolutionFailed(e) => match state {
            ResolvingAddress => Transition::to(state, NeedsAddress, vec![fail(e.clone())]),
            _ => Transition::stay(state, vec![fail(e.clone())]),
        },

        Event::AddressUpdateRequested => match state {
            NeedsAddress => Transition::to(state, ResolvingAddress, vec![Effect::StartLookup]),
            _ => Transition::stay(state, vec![Effect::Reject(SetupError::IncorrectState)]),
        },

        Event::SessionEstablished { grabbed } => match state {
            Uninitialized => Transition::stay(state, vec![]),
            _ if !grabbed => Transition::stay(state, vec![]),
            _ => Transition::to(state, SecureConnected, vec![succeed()]),
        },

        Event::SessionEstablishmentError(e) => match state {
            Uninitialized | NeedsAddress => Transition::stay(state, vec![]),
            // the address is still believed good, only the handshake failed
            _ => Transition::to(state, HasAddress, vec![fail(e.clone())]),
        },

        Event::Disconnect => match state {
            SecureConnected => Transition::to(state, HasAddress, vec![Effect::MarkSessionDefunct]),
            _ => Transition::stay(state, vec![Effect::Reject(SetupError::IncorrectState)]),
        },
    }
}
