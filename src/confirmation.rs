//! Confirmation tracker (§4.7): follows block depth of sent/received
//! messages across every enabled backend until they cross a
//! configured depth threshold, independent of any one chain's RPC
//! client.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::ChainBackend;
use crate::events::{EventSinks, ProcessedReceiver, UpdatedEvent};
use crate::state::{ChainParameters, ChainStateStore, ConfirmationRecord};

pub const DEFAULT_CONFIRMATION_DEPTH: u64 = 8;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// The archival message datastore that owns a Whiteflag message's
/// durable record — an out-of-scope external collaborator per §1. The
/// tracker only ever needs a yes/no answer to "is this transaction
/// hash still known there", per §4.7's closing rule: "a confirmation
/// record exists iff the corresponding message is known in the primary
/// message datastore with a blockNumber set".
pub trait MessageDatastore: Send + Sync {
    fn contains_message(&self, transaction_hash: &str) -> bool;
}

/// Stands in for the real archival datastore when none is wired in
/// (standalone/test use): reports every transaction hash as present, so
/// the tracker's step-6 removal never fires spuriously in a deployment
/// that hasn't connected a real datastore yet.
pub struct AlwaysPresentDatastore;

impl MessageDatastore for AlwaysPresentDatastore {
    fn contains_message(&self, _transaction_hash: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct ConfirmationConfig {
    pub depth: u64,
    pub poll_interval_ms: u64,
    /// Whether to emit `messageUpdated` on every depth change, or only
    /// once a record crosses into `confirmed`.
    pub update_each_block: bool,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_CONFIRMATION_DEPTH,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            update_each_block: false,
        }
    }
}

/// Watches the shared `blockDepths` queue and, every
/// `confirmationInterval`, re-derives each record's depth from its own
/// chain's persisted status (never a direct RPC call — the depth a
/// queued record cares about is "how far behind the chain's own
/// listener has the tip moved", which the chain state store already
/// tracks per §4.2).
pub struct ConfirmationTracker {
    config: ConfirmationConfig,
    store: Arc<dyn ChainStateStore>,
    backends: HashMap<String, Arc<dyn ChainBackend>>,
    events: EventSinks,
    datastore: Arc<dyn MessageDatastore>,
}

impl ConfirmationTracker {
    pub fn new(
        config: ConfirmationConfig,
        store: Arc<dyn ChainStateStore>,
        backends: HashMap<String, Arc<dyn ChainBackend>>,
        events: EventSinks,
    ) -> Self {
        Self::with_datastore(config, store, backends, events, Arc::new(AlwaysPresentDatastore))
    }

    /// As [`Self::new`], but with an explicit [`MessageDatastore`] —
    /// used by deployments that wire in a real archival datastore so
    /// §4.7 step 6's removal actually fires when a message is purged
    /// there.
    pub fn with_datastore(
        config: ConfirmationConfig,
        store: Arc<dyn ChainStateStore>,
        backends: HashMap<String, Arc<dyn ChainBackend>>,
        events: EventSinks,
        datastore: Arc<dyn MessageDatastore>,
    ) -> Self {
        Self {
            config,
            store,
            backends,
            events,
            datastore,
        }
    }

    /// Enqueues a transaction for confirmation tracking. Re-enqueuing an
    /// already-tracked hash simply replaces the record.
    pub fn track(&self, transaction_hash: impl Into<String>, blockchain: impl Into<String>, block_number: u64) {
        self.store.upsert_confirmation(ConfirmationRecord {
            transaction_hash: transaction_hash.into(),
            blockchain: blockchain.into(),
            block_number,
            block_depth: 0,
            confirmed: false,
        });
    }

    /// Runs the periodic depth sweep forever, concurrently draining the
    /// `messageProcessed` stream this tracker subscribes to (§4.7) and
    /// enqueuing a confirmation record for every message that carries a
    /// block number.
    pub async fn run(&self, mut processed: ProcessedReceiver) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(500)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                Some(event) = processed.recv() => {
                    let header = event.metaheader;
                    if header.block_number > 0 {
                        self.track(header.transaction_hash, header.blockchain, header.block_number);
                    }
                }
                else => break,
            }
        }
    }

    fn highest_block_for(&self, chain: &str) -> u64 {
        self.store
            .get_chain(
                chain,
                ChainParameters {
                    chain: crate::state::NetworkKind::Regtest,
                    rpc_url: String::new(),
                },
            )
            .status
            .highest_block
    }

    /// One sweep of the queue, per the five numbered steps in §4.7:
    /// drop queued records for chains that are no longer enabled,
    /// re-derive depth from each record's own chain state, skip
    /// unchanged records, persist depth changes below the threshold,
    /// and re-verify/confirm-and-remove records that cross it.
    pub async fn tick(&self) {
        self.drop_disabled_chains();

        for record in self.store.get_confirmation_queue() {
            if !self.datastore.contains_message(&record.transaction_hash) {
                debug!(txid = %record.transaction_hash, "message no longer in the archival datastore, dropping confirmation record");
                self.store.remove_confirmation(&record.transaction_hash);
                continue;
            }

            let highest = self.highest_block_for(&record.blockchain);
            let depth = confirmation_depth(highest, record.block_number);

            if depth == record.block_depth {
                continue;
            }

            if depth < self.config.depth {
                let updated = ConfirmationRecord {
                    block_depth: depth,
                    ..record.clone()
                };
                self.store.upsert_confirmation(updated);
                if self.config.update_each_block {
                    self.emit_updated(&record.transaction_hash, depth, false).await;
                }
                continue;
            }

            self.resolve_at_threshold(&record, depth).await;
        }
    }

    /// A record's depth has crossed the configured threshold: re-fetch
    /// the transaction from its backend to rule out a reorg that moved
    /// it to a different block before trusting the depth (§4.7 step 5).
    async fn resolve_at_threshold(&self, record: &ConfirmationRecord, depth: u64) {
        let Some(backend) = self.backends.get(&record.blockchain) else {
            // No live backend to re-verify against; trust the chain
            // state's depth and confirm anyway rather than stalling.
            self.confirm_and_remove(record, depth).await;
            return;
        };

        match backend.get_message(&record.transaction_hash).await {
            Ok(refetched) if refetched.block_number != record.block_number => {
                warn!(
                    txid = %record.transaction_hash,
                    old_block = record.block_number,
                    new_block = refetched.block_number,
                    "transaction moved to a different block, reorg suspected"
                );
                self.store.upsert_confirmation(ConfirmationRecord {
                    block_number: refetched.block_number,
                    block_depth: confirmation_depth(self.highest_block_for(&record.blockchain), refetched.block_number),
                    ..record.clone()
                });
            }
            Ok(_) => self.confirm_and_remove(record, depth).await,
            Err(e) => {
                debug!(txid = %record.transaction_hash, error = %e, "could not re-verify transaction before confirming");
                self.confirm_and_remove(record, depth).await;
            }
        }
    }

    async fn confirm_and_remove(&self, record: &ConfirmationRecord, depth: u64) {
        self.store.remove_confirmation(&record.transaction_hash);
        info!(txid = %record.transaction_hash, depth, "transaction confirmed");
        self.emit_updated(&record.transaction_hash, depth, true).await;
    }

    async fn emit_updated(&self, transaction_hash: &str, block_depth: u64, confirmed: bool) {
        let _ = self
            .events
            .updated
            .send(UpdatedEvent {
                transaction_hash: transaction_hash.to_string(),
                block_depth,
                confirmed,
            })
            .await;
    }

    /// Drops every queued record belonging to a chain that is either
    /// unconfigured or currently disabled, per §4.7's "when a chain
    /// becomes disabled, all its queued records are dropped".
    fn drop_disabled_chains(&self) {
        let stale: HashSet<String> = self
            .store
            .get_confirmation_queue()
            .into_iter()
            .map(|r| r.blockchain)
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|chain| {
                !self
                    .backends
                    .get(chain)
                    .map(|b| b.status() == crate::backend::BackendStatus::Enabled)
                    .unwrap_or(false)
            })
            .collect();

        for chain in stale {
            self.store.drop_confirmations_for_chain(&chain);
        }
    }
}

/// `depth = max(0, highest - blockNumber)`, as an unsigned saturating
/// subtraction since block numbers never exceed the node's height.
pub fn confirmation_depth(highest: u64, block_number: u64) -> u64 {
    highest.saturating_sub(block_number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryChainStateStore;

    fn sinks() -> (
        EventSinks,
        tokio::sync::mpsc::Receiver<crate::message::MetaHeader>,
        tokio::sync::mpsc::Receiver<crate::events::ProcessedEvent>,
        tokio::sync::mpsc::Receiver<UpdatedEvent>,
    ) {
        let (receive_tx, receive_rx) = tokio::sync::mpsc::channel(8);
        let (processed_tx, processed_rx) = tokio::sync::mpsc::channel(8);
        let (updated_tx, updated_rx) = tokio::sync::mpsc::channel(8);
        (
            EventSinks { receive: receive_tx, processed: processed_tx, updated: updated_tx },
            receive_rx,
            processed_rx,
            updated_rx,
        )
    }

    #[test]
    fn tracking_enqueues_unconfirmed_record_at_zero_depth() {
        let store: Arc<dyn ChainStateStore> = Arc::new(InMemoryChainStateStore::new());
        let (events, _r, _p, _u) = sinks();
        let tracker = ConfirmationTracker::new(ConfirmationConfig::default(), store.clone(), HashMap::new(), events);
        tracker.track("tx1", "bitcoin", 100);

        let queue = store.get_confirmation_queue();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].block_depth, 0);
        assert!(!queue[0].confirmed);
    }

    #[test]
    fn depth_crosses_threshold_at_exactly_eight_blocks() {
        assert_eq!(confirmation_depth(100, 92), 8);
        assert_eq!(confirmation_depth(100, 95), 5);
        assert_eq!(confirmation_depth(92, 100), 0, "block ahead of tip clamps to zero depth");
    }

    #[tokio::test]
    async fn tick_confirms_and_removes_once_depth_crosses_threshold_with_no_backend() {
        let store: Arc<dyn ChainStateStore> = Arc::new(InMemoryChainStateStore::new());
        let (events, _r, _p, mut updated_rx) = sinks();
        let mut state = store.get_chain(
            "bitcoin",
            ChainParameters { chain: crate::state::NetworkKind::Regtest, rpc_url: String::new() },
        );
        state.status.highest_block = 508;
        store.save("bitcoin", state);

        let tracker = ConfirmationTracker::new(ConfirmationConfig::default(), store.clone(), HashMap::new(), events);
        tracker.track("tx1", "bitcoin", 500);

        tracker.tick().await;

        assert!(store.get_confirmation_queue().is_empty());
        let update = updated_rx.recv().await.unwrap();
        assert!(update.confirmed);
        assert_eq!(update.block_depth, 8);
    }

    #[tokio::test]
    async fn tick_persists_depth_below_threshold_without_confirming() {
        let store: Arc<dyn ChainStateStore> = Arc::new(InMemoryChainStateStore::new());
        let (events, _r, _p, _u) = sinks();
        let mut state = store.get_chain(
            "bitcoin",
            ChainParameters { chain: crate::state::NetworkKind::Regtest, rpc_url: String::new() },
        );
        state.status.highest_block = 503;
        store.save("bitcoin", state);

        let tracker = ConfirmationTracker::new(ConfirmationConfig::default(), store.clone(), HashMap::new(), events);
        tracker.track("tx1", "bitcoin", 500);

        tracker.tick().await;

        let queue = store.get_confirmation_queue();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].block_depth, 3);
        assert!(!queue[0].confirmed);
    }

    struct AbsentDatastore;

    impl MessageDatastore for AbsentDatastore {
        fn contains_message(&self, _transaction_hash: &str) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn tick_drops_a_record_whose_message_left_the_datastore() {
        let store: Arc<dyn ChainStateStore> = Arc::new(InMemoryChainStateStore::new());
        let (events, _r, _p, _u) = sinks();
        let tracker = ConfirmationTracker::with_datastore(
            ConfirmationConfig::default(),
            store.clone(),
            HashMap::new(),
            events,
            Arc::new(AbsentDatastore),
        );
        tracker.track("tx1", "bitcoin", 500);

        tracker.tick().await;

        assert!(store.get_confirmation_queue().is_empty());
    }

    #[tokio::test]
    async fn disabling_a_chain_drops_its_queued_records_on_next_tick() {
        use crate::backend::{BackendStatus, BitcoinBackend};
        use crate::rpc::{RpcClient, RpcClientConfig, RpcTransport};

        let store: Arc<dyn ChainStateStore> = Arc::new(InMemoryChainStateStore::new());
        let rpc: Arc<dyn RpcTransport> = Arc::new(RpcClient::new(RpcClientConfig {
            protocol: "http".into(),
            host: "127.0.0.1".into(),
            port: 1,
            path: "/".into(),
            username: None,
            password: None,
            timeout_ms: 1000,
        }));
        let backend: Arc<dyn ChainBackend> = Arc::new(BitcoinBackend::new(
            "bitcoin",
            bitcoin::Network::Regtest,
            BackendStatus::Disabled,
            store.clone(),
            rpc,
            None,
            false,
        ));
        let mut backends = HashMap::new();
        backends.insert("bitcoin".to_string(), backend);

        let (events, _r, _p, _u) = sinks();
        let tracker = ConfirmationTracker::new(ConfirmationConfig::default(), store.clone(), backends, events);
        tracker.track("tx1", "bitcoin", 500);

        tracker.tick().await;

        assert!(store.get_confirmation_queue().is_empty());
    }
}
