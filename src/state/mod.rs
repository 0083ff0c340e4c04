//! Chain state store (§4.2 of the design spec): a single-owner
//! collaborator for the per-chain mutable record, reached by every
//! other component through request/response operations rather than by
//! mutating shared state in place (per the "shared mutable state"
//! redesign note).

pub mod model;

use std::collections::HashMap;

#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;

pub use model::{
    Account, ChainParameters, ChainState, ChainStatus, ConfirmationRecord, NetworkKind,
    SpentStatus, TransceiveDirection, Utxo,
};

/// Durable storage for per-chain state, the `blockDepths` confirmation
/// queue, and the key store. A real implementation backs this by a
/// datastore; the datastore itself is an external collaborator (out of
/// scope per the design spec), so this crate only defines the contract
/// and an in-memory implementation for tests and standalone use.
#[cfg_attr(test, automock)]
pub trait ChainStateStore: Send + Sync {
    /// Returns the chain's state, creating an empty record (with empty
    /// accounts/status/parameters) if this is the first time the chain
    /// is used, per the lifecycle rules in §3.
    fn get_chain(&self, name: &str, default_parameters: ChainParameters) -> ChainState;

    /// Persists `state` for `name`. Idempotent.
    fn save(&self, name: &str, state: ChainState);

    fn get_confirmation_queue(&self) -> Vec<ConfirmationRecord>;

    fn upsert_confirmation(&self, record: ConfirmationRecord);

    fn remove_confirmation(&self, transaction_hash: &str);

    /// Drops every queued confirmation record belonging to `chain`,
    /// used when a chain transitions to disabled.
    fn drop_confirmations_for_chain(&self, chain: &str);

    fn get_key(&self, key_id: &str) -> Option<Vec<u8>>;

    fn upsert_key(&self, key_id: &str, value: Vec<u8>);

    fn remove_key(&self, key_id: &str);
}

/// In-memory [`ChainStateStore`], safe to share across the listener and
/// dispatcher tasks via an `Arc`. Sequentially consistent per chain: all
/// reads/writes for a given chain go through the same lock.
#[derive(Default)]
pub struct InMemoryChainStateStore {
    chains: RwLock<HashMap<String, ChainState>>,
    confirmations: RwLock<HashMap<String, ConfirmationRecord>>,
    keys: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryChainStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainStateStore for InMemoryChainStateStore {
    fn get_chain(&self, name: &str, default_parameters: ChainParameters) -> ChainState {
        if let Some(state) = self.chains.read().get(name) {
            return state.clone();
        }
        let state = ChainState::empty(default_parameters);
        self.chains.write().insert(name.to_string(), state.clone());
        state
    }

    fn save(&self, name: &str, state: ChainState) {
        self.chains.write().insert(name.to_string(), state);
    }

    fn get_confirmation_queue(&self) -> Vec<ConfirmationRecord> {
        self.confirmations.read().values().cloned().collect()
    }

    fn upsert_confirmation(&self, record: ConfirmationRecord) {
        self.confirmations
            .write()
            .insert(record.transaction_hash.clone(), record);
    }

    fn remove_confirmation(&self, transaction_hash: &str) {
        self.confirmations.write().remove(transaction_hash);
    }

    fn drop_confirmations_for_chain(&self, chain: &str) {
        self.confirmations
            .write()
            .retain(|_, record| record.blockchain != chain);
    }

    fn get_key(&self, key_id: &str) -> Option<Vec<u8>> {
        self.keys.read().get(key_id).cloned()
    }

    fn upsert_key(&self, key_id: &str, value: Vec<u8>) {
        self.keys.write().insert(key_id.to_string(), value);
    }

    fn remove_key(&self, key_id: &str) {
        self.keys.write().remove(key_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ChainParameters {
        ChainParameters {
            chain: NetworkKind::Regtest,
            rpc_url: "http://localhost:18443/".to_string(),
        }
    }

    #[test]
    fn get_chain_creates_empty_record_on_first_use() {
        let store = InMemoryChainStateStore::new();
        let state = store.get_chain("bitcoin", params());
        assert!(state.accounts.is_empty());
        assert_eq!(state.status.current_block, 0);
    }

    #[test]
    fn save_is_idempotent_and_visible_to_subsequent_reads() {
        let store = InMemoryChainStateStore::new();
        let mut state = store.get_chain("bitcoin", params());
        state.status.current_block = 42;
        store.save("bitcoin", state.clone());
        store.save("bitcoin", state.clone());
        let reloaded = store.get_chain("bitcoin", params());
        assert_eq!(reloaded.status.current_block, 42);
    }

    #[test]
    fn disabling_a_chain_drops_its_confirmations_only() {
        let store = InMemoryChainStateStore::new();
        store.upsert_confirmation(ConfirmationRecord {
            transaction_hash: "a".into(),
            blockchain: "bitcoin".into(),
            block_number: 1,
            block_depth: 0,
            confirmed: false,
        });
        store.upsert_confirmation(ConfirmationRecord {
            transaction_hash: "b".into(),
            blockchain: "ethereum".into(),
            block_number: 1,
            block_depth: 0,
            confirmed: false,
        });
        store.drop_confirmations_for_chain("bitcoin");
        let remaining = store.get_confirmation_queue();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].blockchain, "ethereum");
    }
}
