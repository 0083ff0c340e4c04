//! Error types for the RPC transport.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by [`super::client::RpcClient`].
#[derive(Debug, Error, Clone)]
pub enum RpcError {
    /// The HTTP request itself failed, or the node returned a non-200
    /// status. Retryable.
    #[error("transport: {0}")]
    Transport(String),

    /// The node accepted the request but the JSON-RPC `error` field was
    /// non-null. Retryable — the underlying cause is usually a transient
    /// node condition (still-syncing mempool, etc).
    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// The call did not complete within the configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The response body could not be parsed into the expected shape.
    /// Not retryable — a malformed response will not repair itself.
    #[error("could not decode response: {0}")]
    Decode(String),
}
