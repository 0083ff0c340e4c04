//! Multi-chain dispatcher: routes named operations to the per-chain
//! backend, validating required fields and chain availability before
//! delegating.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{BackendStatus, ChainBackend};
use crate::error::{GatewayError, GatewayResult};
use crate::message::MetaHeader;
use crate::signature::{FlattenedJws, SignaturePayload};
use crate::state::Account;

pub struct Dispatcher {
    backends: HashMap<String, Arc<dyn ChainBackend>>,
}

impl Dispatcher {
    pub fn new(backends: HashMap<String, Arc<dyn ChainBackend>>) -> Self {
        Self { backends }
    }

    fn backend(&self, chain: &str) -> GatewayResult<&Arc<dyn ChainBackend>> {
        let backend = self
            .backends
            .get(chain)
            .ok_or_else(|| GatewayError::NotImplemented(format!("unknown chain {chain}")))?;
        if backend.status() == BackendStatus::Disabled {
            return Err(GatewayError::NotAvailable(format!("chain {chain} is disabled")));
        }
        Ok(backend)
    }

    pub fn create_account(&self, chain: &str, seed_bytes: Option<&[u8]>) -> GatewayResult<Account> {
        self.backend(chain)?.account_manager().create(seed_bytes)
    }

    pub fn get_account(&self, chain: &str, address: &str) -> GatewayResult<Account> {
        self.backend(chain)?.account_manager().check(address)
    }

    pub fn update_account(&self, chain: &str, account: Account) -> GatewayResult<()> {
        self.backend(chain)?.account_manager().update(account)
    }

    pub fn delete_account(&self, chain: &str, address: &str) -> GatewayResult<()> {
        self.backend(chain)?.account_manager().delete(address)
    }

    /// Sends a Whiteflag-encoded message embedded in an OP_RETURN
    /// output. Fails `MetaHeader` with the missing field names if the
    /// originator address or encoded message are absent.
    pub async fn send_message(
        &self,
        chain: &str,
        originator_address: Option<&str>,
        encoded_message: Option<&[u8]>,
        to_address: &str,
        amount: u64,
    ) -> GatewayResult<String> {
        let mut missing = Vec::new();
        if originator_address.is_none() {
            missing.push("originatorAddress".to_string());
        }
        if encoded_message.is_none() {
            missing.push("encodedMessage".to_string());
        }
        if !missing.is_empty() {
            return Err(GatewayError::MetaHeader(missing));
        }

        let backend = self.backend(chain)?;
        let account = backend.account_manager().check(originator_address.unwrap())?;
        backend
            .send_message(&account, to_address, amount, encoded_message.unwrap())
            .await
    }

    pub async fn transfer_funds(
        &self,
        chain: &str,
        originator_address: &str,
        to_address: &str,
        amount: u64,
    ) -> GatewayResult<String> {
        let backend = self.backend(chain)?;
        let account = backend.account_manager().check(originator_address)?;
        backend.transfer_funds(&account, to_address, amount).await
    }

    /// Signs `{addr, orgname, url, iat}` as a flattened ES256 JWS, using
    /// the private key held in the backend's own key store for
    /// `address` — key material never crosses this call boundary.
    pub fn request_signature(
        &self,
        chain: &str,
        address: &str,
        orgname: &str,
        url: &str,
        iat: u64,
    ) -> GatewayResult<FlattenedJws> {
        let backend = self.backend(chain)?;
        let payload = SignaturePayload {
            addr: address.to_string(),
            orgname: orgname.to_string(),
            url: url.to_string(),
            iat,
        };
        backend.sign(address, &payload)
    }

    /// Returns the hex-encoded public key on file for `address`, the
    /// counterpart callers need to verify a [`Self::request_signature`]
    /// JWS (§4.6's `requestKeys`).
    pub fn request_keys(&self, chain: &str, address: &str) -> GatewayResult<String> {
        Ok(self.backend(chain)?.account_manager().get(address)?.public_key)
    }

    /// Looks a message up by transaction hash directly from the chain
    /// node (§4.6's `getMessage`), independent of whatever the
    /// out-of-scope archival datastore may hold.
    pub async fn get_message(&self, chain: &str, transaction_hash: &str) -> GatewayResult<MetaHeader> {
        self.backend(chain)?.get_message(transaction_hash).await
    }

    /// Returns the raw `scriptPubKey` bytes for `address`, validated
    /// against the backend's configured network.
    pub fn get_binary_address(&self, chain: &str, address: &str) -> GatewayResult<Vec<u8>> {
        let backend = self.backend(chain)?;
        let parsed = address
            .parse::<bitcoin::Address<_>>()
            .map_err(|e| GatewayError::BadRequest(format!("invalid address: {e}")))?
            .require_network(backend.network())
            .map_err(|e| GatewayError::BadRequest(format!("address wrong network: {e}")))?;
        Ok(parsed.script_pubkey().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountManager;
    use crate::backend::BackendStatus;
    use crate::rpc::{RpcClient, RpcClientConfig, RpcTransport};
    use crate::state::InMemoryChainStateStore;
    use async_trait::async_trait;

    fn rpc() -> Arc<dyn RpcTransport> {
        Arc::new(RpcClient::new(RpcClientConfig {
            protocol: "http".into(),
            host: "127.0.0.1".into(),
            port: 1,
            path: "/".into(),
            username: None,
            password: None,
            timeout_ms: 1000,
        }))
    }

    struct StubBackend {
        status: BackendStatus,
        accounts: AccountManager,
    }

    #[async_trait]
    impl ChainBackend for StubBackend {
        fn status(&self) -> BackendStatus {
            self.status
        }

        fn network(&self) -> bitcoin::Network {
            bitcoin::Network::Regtest
        }

        fn account_manager(&self) -> &AccountManager {
            &self.accounts
        }

        async fn send_message(&self, _account: &Account, _to: &str, _amount: u64, _data: &[u8]) -> GatewayResult<String> {
            Ok("txid".to_string())
        }

        async fn transfer_funds(&self, _account: &Account, _to: &str, _amount: u64) -> GatewayResult<String> {
            Ok("txid".to_string())
        }

        async fn get_message(&self, _transaction_hash: &str) -> GatewayResult<crate::message::MetaHeader> {
            unimplemented!("not exercised by these dispatcher tests")
        }

        fn sign(&self, _address: &str, _payload: &SignaturePayload) -> GatewayResult<FlattenedJws> {
            unimplemented!("not exercised by these dispatcher tests")
        }
    }

    fn dispatcher_with(status: BackendStatus) -> Dispatcher {
        let store: Arc<dyn crate::state::ChainStateStore> = Arc::new(InMemoryChainStateStore::new());
        let accounts = AccountManager::new("bitcoin", bitcoin::Network::Regtest, store, rpc());
        let mut backends: HashMap<String, Arc<dyn ChainBackend>> = HashMap::new();
        backends.insert("bitcoin".to_string(), Arc::new(StubBackend { status, accounts }));
        Dispatcher::new(backends)
    }

    #[test]
    fn unknown_chain_is_not_implemented() {
        let dispatcher = dispatcher_with(BackendStatus::Enabled);
        let err = dispatcher.get_account("ethereum", "addr").unwrap_err();
        assert!(matches!(err, GatewayError::NotImplemented(_)));
    }

    #[test]
    fn disabled_chain_is_not_available() {
        let dispatcher = dispatcher_with(BackendStatus::Disabled);
        let err = dispatcher.get_account("bitcoin", "addr").unwrap_err();
        assert!(matches!(err, GatewayError::NotAvailable(_)));
    }

    #[tokio::test]
    async fn send_message_without_originator_fails_meta_header() {
        let dispatcher = dispatcher_with(BackendStatus::Enabled);
        let err = dispatcher
            .send_message("bitcoin", None, Some(b"5746"), "to", 1000)
            .await
            .unwrap_err();
        match err {
            GatewayError::MetaHeader(fields) => assert_eq!(fields, vec!["originatorAddress".to_string()]),
            other => panic!("expected MetaHeader error, got {other:?}"),
        }
    }

    #[test]
    fn request_signature_and_request_keys_round_trip_through_the_key_store() {
        use crate::backend::BitcoinBackend;

        let store: Arc<dyn crate::state::ChainStateStore> = Arc::new(InMemoryChainStateStore::new());
        let backend = Arc::new(BitcoinBackend::new(
            "bitcoin",
            bitcoin::Network::Regtest,
            BackendStatus::Enabled,
            store,
            rpc(),
            None,
            false,
        ));
        let account = backend.account_manager().create(Some(&[3u8; 32])).unwrap();

        let mut backends: HashMap<String, Arc<dyn ChainBackend>> = HashMap::new();
        backends.insert("bitcoin".to_string(), backend as Arc<dyn ChainBackend>);
        let dispatcher = Dispatcher::new(backends);

        let pubkey = dispatcher.request_keys("bitcoin", &account.address).unwrap();
        assert_eq!(pubkey, account.public_key);

        let jws = dispatcher
            .request_signature("bitcoin", &account.address, "example-org", "https://example.org", 1_700_000_000)
            .unwrap();

        let pubkey_bytes = hex::decode(&pubkey).unwrap();
        crate::signature::verify(&jws, &pubkey_bytes).unwrap();
    }
}
