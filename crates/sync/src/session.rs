//! Shared brokerage session.
//!
//! Wraps a [`Brokerage`] so that concurrent components (synchronizer, queue
//! worker, reconciler) share one connection. The underlying client is not
//! safe for concurrent calls, so every call passes through a single async
//! mutex; callers queue rather than interleave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use possync_core::traits::Brokerage;
use possync_core::types::{BrokerPosition, Conid, PositionUpdate};

/// Session-level errors with a typed variant for the attachment guard.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a synchronizer is already attached to this session")]
    SynchronizerAttached,
}

/// One brokerage connection shared by every component.
///
/// The session serializes calls to the client and enforces that at most one
/// [`PositionSynchronizer`](crate::synchronizer::PositionSynchronizer) is
/// attached at a time.
pub struct BrokerageSession {
    brokerage: Arc<dyn Brokerage>,
    /// Serializes every call into the client.
    call_guard: Mutex<()>,
    synchronizer_attached: AtomicBool,
}

impl BrokerageSession {
    /// Wraps a brokerage client in a shared session.
    #[must_use]
    pub fn new(brokerage: Arc<dyn Brokerage>) -> Self {
        Self {
            brokerage,
            call_guard: Mutex::new(()),
            synchronizer_attached: AtomicBool::new(false),
        }
    }

    /// Connects if not already connected. Safe to call repeatedly.
    ///
    /// # Errors
    /// Returns an error if the connect attempt fails.
    pub async fn ensure_connected(&self) -> Result<()> {
        let _guard = self.call_guard.lock().await;
        if self.brokerage.is_connected().await {
            return Ok(());
        }
        info!("connecting brokerage session");
        self.brokerage.connect().await
    }

    /// Current account snapshot, filtered to open (non-zero) positions.
    ///
    /// # Errors
    /// Returns an error if the snapshot fetch fails.
    pub async fn fetch_open_positions(&self) -> Result<Vec<BrokerPosition>> {
        let _guard = self.call_guard.lock().await;
        let positions = self.brokerage.fetch_positions().await?;
        Ok(positions.into_iter().filter(|p| !p.is_flat()).collect())
    }

    /// Requests streaming market data for one contract.
    ///
    /// # Errors
    /// Returns an error if the subscribe request fails.
    pub async fn subscribe_market_data(&self, position: &BrokerPosition) -> Result<()> {
        let _guard = self.call_guard.lock().await;
        self.brokerage.subscribe_market_data(position).await
    }

    /// Cancels streaming market data for one contract.
    ///
    /// # Errors
    /// Returns an error if the unsubscribe request fails.
    pub async fn unsubscribe_market_data(&self, conid: Conid) -> Result<()> {
        let _guard = self.call_guard.lock().await;
        self.brokerage.unsubscribe_market_data(conid).await
    }

    /// Disconnects the underlying client.
    ///
    /// # Errors
    /// Returns an error if the disconnect fails.
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.call_guard.lock().await;
        info!("disconnecting brokerage session");
        self.brokerage.disconnect().await
    }

    /// A fresh receiver on the client's update stream.
    #[must_use]
    pub fn updates(&self) -> broadcast::Receiver<PositionUpdate> {
        self.brokerage.updates()
    }

    /// Whether a synchronizer currently owns this session's stream routing.
    #[must_use]
    pub fn has_synchronizer(&self) -> bool {
        self.synchronizer_attached.load(Ordering::SeqCst)
    }

    /// Claims the session for a synchronizer.
    ///
    /// # Errors
    /// Returns [`SessionError::SynchronizerAttached`] when another
    /// synchronizer already holds the claim.
    pub(crate) fn attach_synchronizer(&self) -> Result<(), SessionError> {
        self.synchronizer_attached
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| SessionError::SynchronizerAttached)
    }

    /// Releases the synchronizer claim.
    pub(crate) fn detach_synchronizer(&self) {
        self.synchronizer_attached.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for BrokerageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerageSession")
            .field("synchronizer_attached", &self.has_synchronizer())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use possync_broker_sim::SimBrokerage;
    use possync_core::types::OptionRight;

    fn position(conid: Conid, quantity: f64) -> BrokerPosition {
        BrokerPosition::new(conid, "NVDA", OptionRight::Call, 140.0, "20260320", quantity)
    }

    #[tokio::test]
    async fn test_fetch_open_positions_filters_flat() {
        let sim = Arc::new(SimBrokerage::new());
        sim.set_positions(vec![position(1, 5.0), position(2, 0.0), position(3, -2.0)]);

        let session = BrokerageSession::new(sim);
        session.ensure_connected().await.unwrap();

        let open = session.fetch_open_positions().await.unwrap();
        let conids: Vec<Conid> = open.iter().map(|p| p.conid).collect();
        assert_eq!(conids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_ensure_connected_is_idempotent() {
        let sim = Arc::new(SimBrokerage::new());
        let session = BrokerageSession::new(Arc::clone(&sim) as Arc<dyn Brokerage>);

        session.ensure_connected().await.unwrap();
        session.ensure_connected().await.unwrap();
        assert!(sim.is_connected().await);
    }

    #[tokio::test]
    async fn test_single_synchronizer_claim() {
        let session = BrokerageSession::new(Arc::new(SimBrokerage::new()));

        assert!(!session.has_synchronizer());
        session.attach_synchronizer().unwrap();
        assert!(session.has_synchronizer());
        assert!(matches!(
            session.attach_synchronizer(),
            Err(SessionError::SynchronizerAttached)
        ));

        session.detach_synchronizer();
        assert!(!session.has_synchronizer());
        session.attach_synchronizer().unwrap();
    }
}
