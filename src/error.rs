//! Error taxonomy for the gateway core, mirroring the kinds enumerated
//! in the design spec's error-handling section.

use thiserror::Error;

use crate::rpc::error::RpcError;

/// A stable machine-readable code, surfaced to HTTP callers as `WF_API_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    NoData,
    NotFound,
    ResourceConflict,
    NotAvailable,
    NotImplemented,
    MetaHeader,
    Sign,
    RpcTransport,
    RpcRemote,
    Timeout,
    Decode,
    InsufficientFunds,
    TransactionRejected,
}

impl ErrorCode {
    /// The `WF_API_*` identifier for this code.
    pub fn as_api_code(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "WF_API_BAD_REQUEST",
            ErrorCode::NoData => "WF_API_NO_DATA",
            ErrorCode::NotFound => "WF_API_NOT_FOUND",
            ErrorCode::ResourceConflict => "WF_API_RESOURCE_CONFLICT",
            ErrorCode::NotAvailable => "WF_API_NOT_AVAILABLE",
            ErrorCode::NotImplemented => "WF_API_NOT_IMPLEMENTED",
            ErrorCode::MetaHeader => "WF_API_META_HEADER",
            ErrorCode::Sign => "WF_API_SIGN",
            ErrorCode::RpcTransport => "WF_API_RPC_TRANSPORT",
            ErrorCode::RpcRemote => "WF_API_RPC_REMOTE",
            ErrorCode::Timeout => "WF_API_TIMEOUT",
            ErrorCode::Decode => "WF_API_DECODE",
            ErrorCode::InsufficientFunds => "WF_API_INSUFFICIENT_FUNDS",
            ErrorCode::TransactionRejected => "WF_API_TRANSACTION_REJECTED",
        }
    }

    /// Whether a failure of this kind is safe to retry transparently
    /// (RPC transport/remote errors and timeouts), per the propagation
    /// rules in the design spec.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::RpcTransport | ErrorCode::RpcRemote | ErrorCode::Timeout
        )
    }
}

/// Top-level error type returned by every public operation in this crate.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("no whiteflag payload present")]
    NoData,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    ResourceConflict(String),

    #[error("not available: {0}")]
    NotAvailable(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("metaheader error: missing or invalid fields {0:?}")]
    MetaHeader(Vec<String>),

    #[error("signature error: {0}")]
    Sign(String),

    #[error("rpc transport error: {0}")]
    RpcTransport(String),

    #[error("rpc remote error ({code}): {message}")]
    RpcRemote { code: i64, message: String },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("transaction rejected by node")]
    TransactionRejected,
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::BadRequest(_) => ErrorCode::BadRequest,
            GatewayError::NoData => ErrorCode::NoData,
            GatewayError::NotFound(_) => ErrorCode::NotFound,
            GatewayError::ResourceConflict(_) => ErrorCode::ResourceConflict,
            GatewayError::NotAvailable(_) => ErrorCode::NotAvailable,
            GatewayError::NotImplemented(_) => ErrorCode::NotImplemented,
            GatewayError::MetaHeader(_) => ErrorCode::MetaHeader,
            GatewayError::Sign(_) => ErrorCode::Sign,
            GatewayError::RpcTransport(_) => ErrorCode::RpcTransport,
            GatewayError::RpcRemote { .. } => ErrorCode::RpcRemote,
            GatewayError::Timeout(_) => ErrorCode::Timeout,
            GatewayError::Decode(_) => ErrorCode::Decode,
            GatewayError::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            GatewayError::TransactionRejected => ErrorCode::TransactionRejected,
        }
    }

    /// Structural errors are never retried; RPC/timeout errors are
    /// transient and may be retried by listener/sync loops.
    pub fn is_retryable(&self) -> bool {
        self.code().is_transient()
    }
}

impl From<RpcError> for GatewayError {
    fn from(value: RpcError) -> Self {
        match value {
            RpcError::Transport(msg) => GatewayError::RpcTransport(msg),
            RpcError::Remote { code, message } => GatewayError::RpcRemote { code, message },
            RpcError::Timeout(d) => GatewayError::Timeout(d),
            RpcError::Decode(msg) => GatewayError::Decode(msg),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
