//! Errors delivered to session setup waiters.

use thiserror::Error;

use crate::peer::FabricIndex;

/// Every failure a connect waiter can observe. Cloned once per waiter on fan-out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    #[error("operation not valid in current state")]
    IncorrectState,

    #[error("out of resources")]
    NoMemory,

    #[error("fabric {0} not found")]
    InvalidFabricIndex(FabricIndex),

    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    #[error("session establishment failed: {0}")]
    Handshake(String),

    #[error("session setup driver stopped")]
    DriverStopped,
}
