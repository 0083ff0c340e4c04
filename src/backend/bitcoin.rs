//! The Bitcoin-style UTXO backend: wires an [`RpcTransport`] to an
//! [`AccountManager`] and [`TransactionBuilder`] against one chain's
//! state store.

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::Network;

use crate::account::AccountManager;
use crate::backend::{BackendStatus, ChainBackend};
use crate::error::{GatewayError, GatewayResult};
use crate::keystore::KeyStore;
use crate::message::{self, MetaHeader};
use crate::rpc::RpcTransport;
use crate::signature::{self, FlattenedJws, SignaturePayload};
use crate::state::{Account, ChainStateStore};
use crate::txbuilder::TransactionBuilder;

pub struct BitcoinBackend {
    chain_name: String,
    status: BackendStatus,
    network: Network,
    store: Arc<dyn ChainStateStore>,
    rpc: Arc<dyn RpcTransport>,
    accounts: Arc<AccountManager>,
    builder: TransactionBuilder,
}

impl BitcoinBackend {
    /// `fee`, when configured, overrides [`crate::txbuilder::DEFAULT_TRANSACTION_FEE`]
    /// for every transaction this chain's builder assembles.
    pub fn new(
        chain_name: impl Into<String>,
        network: Network,
        status: BackendStatus,
        store: Arc<dyn ChainStateStore>,
        rpc: Arc<dyn RpcTransport>,
        fee: Option<u64>,
        trace_raw_transaction: bool,
    ) -> Self {
        let chain_name = chain_name.into();
        let accounts = Arc::new(AccountManager::new(
            chain_name.clone(),
            network,
            store.clone(),
            rpc.clone(),
        ));
        let mut builder = TransactionBuilder::new(chain_name.clone(), network, store.clone(), rpc.clone())
            .with_trace_raw_transaction(trace_raw_transaction);
        if let Some(fee) = fee {
            builder = builder.with_fee(fee);
        }
        Self {
            chain_name,
            status,
            network,
            store,
            rpc,
            accounts,
            builder,
        }
    }
}

#[async_trait]
impl ChainBackend for BitcoinBackend {
    fn status(&self) -> BackendStatus {
        self.status
    }

    fn network(&self) -> Network {
        self.network
    }

    fn account_manager(&self) -> &AccountManager {
        self.accounts.as_ref()
    }

    async fn send_message(
        &self,
        account: &Account,
        to_address: &str,
        amount: u64,
        data: &[u8],
    ) -> GatewayResult<String> {
        self.builder.send(account, to_address, amount, Some(data)).await
    }

    async fn transfer_funds(&self, account: &Account, to_address: &str, amount: u64) -> GatewayResult<String> {
        self.builder.send(account, to_address, amount, None).await
    }

    async fn get_message(&self, transaction_hash: &str) -> GatewayResult<MetaHeader> {
        let tx = self.rpc.get_raw_transaction(transaction_hash).await?;
        let blockhash = tx.blockhash.clone().ok_or_else(|| {
            GatewayError::NotFound(format!("transaction {transaction_hash} is not yet confirmed"))
        })?;
        let block = self.rpc.get_block_by_hash(&blockhash, 2).await?;
        message::extract_message(&self.chain_name, &block, &tx, self.network)
            .map_err(|_| GatewayError::NoData)
    }

    fn sign(&self, address: &str, payload: &SignaturePayload) -> GatewayResult<FlattenedJws> {
        let keystore = KeyStore::new(self.store.as_ref());
        let secret = keystore
            .get(&self.chain_name, address)
            .ok_or_else(|| GatewayError::NotFound(format!("key for {address}")))?;
        signature::sign(payload, &secret)
    }
}
