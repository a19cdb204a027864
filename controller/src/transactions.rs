//! # Tunnel transaction registry
//!
//! A process-wide map from transaction id to a cancel handle plus a
//! per-transaction response channel. `dashmap` gives atomic per-id
//! insert/remove without a table-wide lock, matching the design doc's
//! concurrency model (§5): transactions never contend with each other or
//! with route-table operations.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tunnel_protocol::TunnelControl;

/// One registered transaction: a cancellation token the controller's HTTP
/// handler (or the agent's executor) can trip, and the channel that
/// delivers response frames back to whichever task is waiting on them.
struct Entry {
    cancel: CancellationToken,
    response_tx: mpsc::Sender<TunnelControl>,
}

#[derive(Default)]
pub struct TransactionRegistry {
    entries: DashMap<String, Entry>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh transaction. A duplicate id is a programming-error
    /// invariant violation (§4.5): it is logged and the existing entry is
    /// left untouched rather than silently overwritten.
    pub fn register(
        &self,
        id: String,
        cancel: CancellationToken,
        response_tx: mpsc::Sender<TunnelControl>,
    ) {
        if self.entries.contains_key(&id) {
            error!(transaction_id = %id, "duplicate transaction id; refusing to register");
            return;
        }
        self.entries.insert(id, Entry { cancel, response_tx });
    }

    /// Idempotent removal.
    pub fn unregister(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Invokes the cancel handle if present. Never fails; an unknown id is
    /// a no-op (§8 round-trip property).
    pub fn cancel(&self, id: &str) {
        match self.entries.get(id) {
            Some(entry) => entry.cancel.cancel(),
            None => warn!(transaction_id = id, "cancel: no such transaction"),
        }
    }

    /// Routes one response-side control frame to the transaction's channel.
    pub async fn dispatch_response(&self, id: &str, frame: TunnelControl) {
        let tx = match self.entries.get(id) {
            Some(entry) => entry.response_tx.clone(),
            None => {
                warn!(transaction_id = id, "response for unknown transaction");
                return;
            }
        };
        let _ = tx.send(frame).await;
    }

    pub fn cancellation_token(&self, id: &str) -> Option<CancellationToken> {
        self.entries.get(id).map(|e| e.cancel.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type SharedRegistry = Arc<TransactionRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_unregister_is_idempotent() {
        let registry = TransactionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        registry.register("t1".into(), CancellationToken::new(), tx);
        assert_eq!(registry.len(), 1);
        registry.unregister("t1");
        registry.unregister("t1");
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_unknown_id_is_a_noop() {
        let registry = TransactionRegistry::new();
        registry.cancel("ghost");
    }

    #[tokio::test]
    async fn duplicate_register_keeps_the_first_entry() {
        let registry = TransactionRegistry::new();
        let token_a = CancellationToken::new();
        let (tx_a, _rx_a) = mpsc::channel(1);
        registry.register("t1".into(), token_a.clone(), tx_a);

        let token_b = CancellationToken::new();
        let (tx_b, _rx_b) = mpsc::channel(1);
        registry.register("t1".into(), token_b, tx_b);

        assert_eq!(registry.len(), 1);
        assert!(!token_a.is_cancelled());
        registry.cancel("t1");
        assert!(token_a.is_cancelled());
    }
}
