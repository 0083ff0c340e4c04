//! Private-key storage, separate from the account record it backs
//! (§3: "the private key is *never* held in the account after
//! creation"). Key material is zeroized as soon as it is no longer
//! needed.

use zeroize::Zeroizing;

use crate::state::ChainStateStore;

/// A private key on loan from the store, zeroized on drop.
pub type SecretBytes = Zeroizing<Vec<u8>>;

/// Thin façade over [`ChainStateStore`]'s key operations, scoping key
/// ids by chain so two chains never collide on the same derived id.
pub struct KeyStore<'a> {
    store: &'a dyn ChainStateStore,
}

impl<'a> KeyStore<'a> {
    pub fn new(store: &'a dyn ChainStateStore) -> Self {
        Self { store }
    }

    pub fn put(&self, chain_name: &str, address: &str, secret: &[u8]) {
        let id = crate::state::model::key_store_id(chain_name, address);
        self.store.upsert_key(&id, secret.to_vec());
    }

    /// Fetches the private key for `address`, wrapped so it is zeroized
    /// as soon as the caller drops it (after signing).
    pub fn get(&self, chain_name: &str, address: &str) -> Option<SecretBytes> {
        let id = crate::state::model::key_store_id(chain_name, address);
        self.store.get_key(&id).map(Zeroizing::new)
    }

    pub fn delete(&self, chain_name: &str, address: &str) {
        let id = crate::state::model::key_store_id(chain_name, address);
        self.store.remove_key(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryChainStateStore;

    #[test]
    fn round_trips_a_key_by_chain_and_address() {
        let backing = InMemoryChainStateStore::new();
        let store = KeyStore::new(&backing);
        store.put("bitcoin", "mAddrX", b"super-secret-key");
        let fetched = store.get("bitcoin", "mAddrX").unwrap();
        assert_eq!(&fetched[..], b"super-secret-key");
    }

    #[test]
    fn deleting_an_account_deletes_its_key() {
        let backing = InMemoryChainStateStore::new();
        let store = KeyStore::new(&backing);
        store.put("bitcoin", "mAddrX", b"k");
        store.delete("bitcoin", "mAddrX");
        assert!(store.get("bitcoin", "mAddrX").is_none());
    }

    #[test]
    fn keys_are_scoped_per_chain() {
        let backing = InMemoryChainStateStore::new();
        let store = KeyStore::new(&backing);
        store.put("bitcoin", "addr", b"btc-key");
        store.put("ethereum", "addr", b"eth-key");
        assert_eq!(&store.get("bitcoin", "addr").unwrap()[..], b"btc-key");
        assert_eq!(&store.get("ethereum", "addr").unwrap()[..], b"eth-key");
    }
}
