//! Error taxonomy for the kernel boundary
//!
//! Every RPC, verifier, and executor failure maps to one stable wire code.
//! Graph certification failures additionally carry a `GRAPH_INVALID` sub-code
//! so submitters can tell a linearity hole from a capability hole.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable wire codes returned in RPC error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    MethodNotFound,
    BadRequest,
    SessionInvalid,
    CapDenied,
    QuotaExceeded,
    RateLimited,
    GraphInvalid,
    JobNotFound,
    Timeout,
    DeviceFailure,
    UncomputeFailure,
    FirewallViolation,
    BadSig,
    Expired,
    Exhausted,
    Revoked,
    Internal,
}

impl ErrorCode {
    /// Wire form of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::SessionInvalid => "SESSION_INVALID",
            ErrorCode::CapDenied => "CAP_DENIED",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::GraphInvalid => "GRAPH_INVALID",
            ErrorCode::JobNotFound => "JOB_NOT_FOUND",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::DeviceFailure => "DEVICE_FAILURE",
            ErrorCode::UncomputeFailure => "UNCOMPUTE_FAILURE",
            ErrorCode::FirewallViolation => "FIREWALL_VIOLATION",
            ErrorCode::BadSig => "BAD_SIG",
            ErrorCode::Expired => "EXPIRED",
            ErrorCode::Exhausted => "EXHAUSTED",
            ErrorCode::Revoked => "REVOKED",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `GRAPH_INVALID` sub-codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphErrorKind {
    LinearityViolation,
    CapMissing,
    DagCyclic,
    GuardInvalid,
    LifetimeLeak,
    TypeMismatch,
    NodesNotList,
}

impl GraphErrorKind {
    /// Wire form of the sub-code.
    pub fn as_str(self) -> &'static str {
        match self {
            GraphErrorKind::LinearityViolation => "LINEARITY_VIOLATION",
            GraphErrorKind::CapMissing => "CAP_MISSING",
            GraphErrorKind::DagCyclic => "DAG_CYCLIC",
            GraphErrorKind::GuardInvalid => "GUARD_INVALID",
            GraphErrorKind::LifetimeLeak => "LIFETIME_LEAK",
            GraphErrorKind::TypeMismatch => "TYPE_MISMATCH",
            GraphErrorKind::NodesNotList => "NODES_NOT_LIST",
        }
    }
}

/// A single certification failure, attributed to a node where one exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphError {
    pub kind: GraphErrorKind,
    pub node: Option<String>,
    pub detail: String,
}

impl GraphError {
    pub fn new(kind: GraphErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            node: None,
            detail: detail.into(),
        }
    }

    pub fn at_node(kind: GraphErrorKind, node: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            node: Some(node.into()),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "{} at node {}: {}", self.kind.as_str(), node, self.detail),
            None => write!(f, "{}: {}", self.kind.as_str(), self.detail),
        }
    }
}

impl std::error::Error for GraphError {}

/// Kernel-wide error type. Variants map 1:1 onto the wire codes.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum KernelError {
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("session invalid: {0}")]
    SessionInvalid(String),

    #[error("capability denied: {0}")]
    CapDenied(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("timed out")]
    Timeout,

    #[error("device failure: {0}")]
    Device(String),

    #[error("uncompute failure: {0}")]
    Uncompute(String),

    #[error("firewall violation: {0}")]
    Firewall(String),

    #[error("bad token signature")]
    BadSig,

    #[error("token expired")]
    Expired,

    #[error("token exhausted")]
    Exhausted,

    #[error("token revoked")]
    Revoked,

    #[error("internal error: {0}")]
    Internal(String),
}

impl KernelError {
    /// The stable wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            KernelError::MethodNotFound(_) => ErrorCode::MethodNotFound,
            KernelError::BadRequest(_) => ErrorCode::BadRequest,
            KernelError::SessionInvalid(_) => ErrorCode::SessionInvalid,
            KernelError::CapDenied(_) => ErrorCode::CapDenied,
            KernelError::QuotaExceeded(_) => ErrorCode::QuotaExceeded,
            KernelError::RateLimited(_) => ErrorCode::RateLimited,
            KernelError::Graph(_) => ErrorCode::GraphInvalid,
            KernelError::JobNotFound(_) => ErrorCode::JobNotFound,
            KernelError::Timeout => ErrorCode::Timeout,
            KernelError::Device(_) => ErrorCode::DeviceFailure,
            KernelError::Uncompute(_) => ErrorCode::UncomputeFailure,
            KernelError::Firewall(_) => ErrorCode::FirewallViolation,
            KernelError::BadSig => ErrorCode::BadSig,
            KernelError::Expired => ErrorCode::Expired,
            KernelError::Exhausted => ErrorCode::Exhausted,
            KernelError::Revoked => ErrorCode::Revoked,
            KernelError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// The `GRAPH_INVALID` sub-code, when this is a graph error.
    pub fn graph_sub_code(&self) -> Option<&'static str> {
        match self {
            KernelError::Graph(e) => Some(e.kind.as_str()),
            _ => None,
        }
    }
}

/// Result alias used across the kernel.
pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::CapDenied.as_str(), "CAP_DENIED");
        assert_eq!(ErrorCode::FirewallViolation.as_str(), "FIREWALL_VIOLATION");
        assert_eq!(GraphErrorKind::NodesNotList.as_str(), "NODES_NOT_LIST");
    }

    #[test]
    fn graph_error_maps_to_graph_invalid() {
        let err: KernelError =
            GraphError::at_node(GraphErrorKind::LinearityViolation, "n3", "vq consumed twice")
                .into();
        assert_eq!(err.code(), ErrorCode::GraphInvalid);
        assert_eq!(err.graph_sub_code(), Some("LINEARITY_VIOLATION"));
    }
}
