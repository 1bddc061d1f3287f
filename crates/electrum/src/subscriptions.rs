//! Fan-out of consensus-driven address status updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flume::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crest_types::{ConsensusChange, Explorer, TransactionPool, UnlockHash};

use crate::status;

/// One batch of recomputed address statuses. Built once per consensus
/// change, then shared immutably with every connection.
#[derive(Debug, Clone)]
pub struct Update {
    pub address_states: Arc<HashMap<UnlockHash, String>>,
}

struct Subscriber {
    update_tx: flume::Sender<Update>,
    /// Cancelled when the subscriber falls behind and must go.
    desync: CancellationToken,
}

/// Registry of per-connection update channels.
pub(crate) struct SubscriberHub {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    backlog: usize,
}

impl SubscriberHub {
    pub(crate) fn new(backlog: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            backlog,
        }
    }

    /// Register a connection. Returns its id, its update channel, and
    /// the token that fires if it gets dropped for lagging.
    pub(crate) fn register(&self) -> (u64, flume::Receiver<Update>, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (update_tx, update_rx) = flume::bounded(self.backlog);
        let desync = CancellationToken::new();

        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .insert(
                id,
                Subscriber {
                    update_tx,
                    desync: desync.clone(),
                },
            );

        (id, update_rx, desync)
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .remove(&id);
    }

    /// Deliver an update to every connection. A connection whose channel
    /// is full is desynchronised and gets disconnected instead of
    /// stalling the fan-out.
    pub(crate) fn broadcast(&self, update: &Update) {
        let mut lagging = Vec::new();
        {
            let subscribers = self
                .subscribers
                .lock()
                .expect("subscriber registry poisoned");
            for (id, subscriber) in subscribers.iter() {
                match subscriber.update_tx.try_send(update.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!("subscriber {id} cannot keep up with updates, dropping it");
                        subscriber.desync.cancel();
                        lagging.push(*id);
                    }
                    // The connection is on its way out already.
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }
        }
        for id in lagging {
            self.unregister(id);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .len()
    }
}

/// Consume consensus changes and broadcast the resulting updates. One
/// such task runs per server.
pub(crate) async fn run_consensus_consumer(
    explorer: Arc<dyn Explorer>,
    pool: Arc<dyn TransactionPool>,
    consensus_rx: flume::Receiver<ConsensusChange>,
    hub: Arc<SubscriberHub>,
    cancellation: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = cancellation.cancelled() => return,
            res = consensus_rx.recv_async() => match res {
                Ok(change) => change,
                Err(_) => {
                    trace!("consensus event source went away");
                    return;
                }
            },
        };

        let addresses = change.touched_addresses();
        if addresses.is_empty() {
            continue;
        }
        trace!("consensus change touches {} addresses", addresses.len());

        // Each address is computed once per batch.
        let mut address_states = HashMap::with_capacity(addresses.len());
        for address in addresses {
            match status::address_status(explorer.as_ref(), pool.as_ref(), &address).await {
                Ok(state) => {
                    address_states.insert(address, state);
                }
                Err(err) => {
                    error!("failed to compute status for {address}: {err}");
                }
            }
        }

        hub.broadcast(&Update {
            address_states: Arc::new(address_states),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(addr: UnlockHash, state: &str) -> Update {
        let mut map = HashMap::new();
        map.insert(addr, state.to_owned());
        Update {
            address_states: Arc::new(map),
        }
    }

    #[test]
    fn broadcast_reaches_all_subscribers() {
        let hub = SubscriberHub::new(4);
        let (_, rx_a, _) = hub.register();
        let (_, rx_b, _) = hub.register();

        let addr = UnlockHash::new(crest_types::UnlockType::PublicKey, [1u8; 32]);
        hub.broadcast(&update(addr, "s1"));

        assert_eq!(rx_a.try_recv().unwrap().address_states.len(), 1);
        assert_eq!(rx_b.try_recv().unwrap().address_states.len(), 1);
    }

    #[test]
    fn lagging_subscriber_is_desynchronised_not_blocked() {
        let hub = SubscriberHub::new(1);
        let (_, rx_ok, _) = hub.register();
        let (_, _rx_slow, desync) = hub.register();

        let addr = UnlockHash::new(crest_types::UnlockType::PublicKey, [1u8; 32]);
        // The second broadcast overflows the slow subscriber's backlog
        // of one; the healthy subscriber drains in between.
        hub.broadcast(&update(addr, "s1"));
        rx_ok.try_recv().unwrap();
        hub.broadcast(&update(addr, "s2"));

        assert!(desync.is_cancelled());
        assert_eq!(hub.len(), 1);
        rx_ok.try_recv().unwrap();
    }
}
