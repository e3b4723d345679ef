use crate::session::SessionHandle;

/// Handed to connect success callbacks so they can start exchanges on the new session.
pub trait ExchangeManager: Send + Sync {
    fn new_exchange_id(&self, session: &SessionHandle) -> u16;
}

/// Random exchange ids, the way the controller picks them for every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomExchangeIds;

impl ExchangeManager for RandomExchangeIds {
    fn new_exchange_id(&self, session: &SessionHandle) -> u16 {
        let exchange = rand::random();
        log::trace!(
            "exchange {} on session {}",
            exchange,
            session.local_session_id()
        );
        exchange
    }
}
