//! JSON-RPC transport to a chain node (§4.1 of the design spec).

pub mod client;
pub mod error;
pub mod types;

#[cfg(test)]
use mockall::automock;

pub use client::{RpcClient, RpcClientConfig};
pub use error::RpcError;
use types::{RpcBlock, RpcBlockchainInfo, RpcTransaction};

/// Seam over the node calls every other module needs, so they can be
/// driven by a stub in tests without standing up an HTTP endpoint.
/// [`RpcClient`] is the one real implementation.
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait RpcTransport: Send + Sync {
    async fn get_block_count(&self) -> Result<u64, RpcError>;

    async fn get_block_hash(&self, height: u64) -> Result<String, RpcError>;

    async fn get_block_by_hash(&self, hash: &str, verbosity: u8) -> Result<RpcBlock, RpcError>;

    async fn get_raw_transaction(&self, txid: &str) -> Result<RpcTransaction, RpcError>;

    async fn send_raw_transaction(&self, hex: &str) -> Result<Option<String>, RpcError>;

    async fn get_connection_count(&self) -> Result<u64, RpcError>;

    async fn get_blockchain_info(&self) -> Result<RpcBlockchainInfo, RpcError>;

    async fn estimate_fee_rate(&self, conf_target: u16) -> Result<Option<f64>, RpcError>;
}

#[async_trait::async_trait]
impl RpcTransport for RpcClient {
    async fn get_block_count(&self) -> Result<u64, RpcError> {
        RpcClient::get_block_count(self).await
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        RpcClient::get_block_hash(self, height).await
    }

    async fn get_block_by_hash(&self, hash: &str, verbosity: u8) -> Result<RpcBlock, RpcError> {
        RpcClient::get_block_by_hash(self, hash, verbosity).await
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<RpcTransaction, RpcError> {
        RpcClient::get_raw_transaction(self, txid).await
    }

    async fn send_raw_transaction(&self, hex: &str) -> Result<Option<String>, RpcError> {
        RpcClient::send_raw_transaction(self, hex).await
    }

    async fn get_connection_count(&self) -> Result<u64, RpcError> {
        RpcClient::get_connection_count(self).await
    }

    async fn get_blockchain_info(&self) -> Result<RpcBlockchainInfo, RpcError> {
        RpcClient::get_blockchain_info(self).await
    }

    async fn estimate_fee_rate(&self, conf_target: u16) -> Result<Option<f64>, RpcError> {
        RpcClient::estimate_fee_rate(self, conf_target).await
    }
}
