//! Per-chain backend wiring: bundles the services a single configured
//! chain needs (RPC client, account manager, transaction builder,
//! listener, confirmation hooks) behind one handle the dispatcher can
//! route to by chain name.

pub mod bitcoin;

use crate::account::AccountManager;
use crate::error::GatewayResult;
use crate::message::MetaHeader;
use crate::signature::{FlattenedJws, SignaturePayload};
use crate::state::Account;

pub use self::bitcoin::BitcoinBackend;

/// Whether a configured chain is currently serving requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Enabled,
    Disabled,
}

/// The set of operations the dispatcher delegates to a concrete
/// backend, one instance materialised per configured chain.
#[async_trait::async_trait]
pub trait ChainBackend: Send + Sync {
    fn status(&self) -> BackendStatus;

    fn network(&self) -> ::bitcoin::Network;

    fn account_manager(&self) -> &AccountManager;

    async fn send_message(
        &self,
        account: &Account,
        to_address: &str,
        amount: u64,
        data: &[u8],
    ) -> GatewayResult<String>;

    async fn transfer_funds(&self, account: &Account, to_address: &str, amount: u64) -> GatewayResult<String>;

    /// Looks a message up by transaction hash directly from the chain
    /// node, re-running the same extraction the listener applies as it
    /// crawls blocks (§4.6's `getMessage`).
    async fn get_message(&self, transaction_hash: &str) -> GatewayResult<MetaHeader>;

    /// Signs `payload` as a flattened ES256 JWS using the private key
    /// held in this backend's key store for `address` (§4.6's
    /// `requestSignature`); key material never leaves this call.
    fn sign(&self, address: &str, payload: &SignaturePayload) -> GatewayResult<FlattenedJws>;
}
