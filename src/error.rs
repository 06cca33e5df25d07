//! Error types for propylon

use hyper::StatusCode;
use std::io;

/// Main error type for the gateway.
///
/// Every fault the core can produce is one of these kinds; `status()` gives
/// the HTTP status the error responder uses. `ClientAborted` has no status:
/// the client is gone and no response can be sent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown proxy instance")]
    InstanceNotFound,

    #[error("Invalid or missing authentication token")]
    Unauthorized,

    #[error("Access denied from your IP")]
    InboundDenied,

    #[error("Access denied to the target URL")]
    OutboundDenied,

    #[error("Bad target: {0}")]
    BadTarget(String),

    #[error("Gateway timeout")]
    UpstreamTimeout,

    #[error("Bad gateway: {0}")]
    UpstreamUnreachable(String),

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("Client disconnected")]
    ClientAborted,

    #[error("Internal server error")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn bad_target(msg: impl Into<String>) -> Self {
        Error::BadTarget(msg.into())
    }

    pub fn unreachable(msg: impl Into<String>) -> Self {
        Error::UpstreamUnreachable(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::UpstreamProtocol(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// The HTTP status for this error, or `None` when no response can be
    /// sent at all (client already gone).
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::InstanceNotFound => Some(StatusCode::NOT_FOUND),
            Error::Unauthorized => Some(StatusCode::UNAUTHORIZED),
            Error::InboundDenied | Error::OutboundDenied => Some(StatusCode::FORBIDDEN),
            Error::BadTarget(_) => Some(StatusCode::BAD_REQUEST),
            Error::UpstreamTimeout => Some(StatusCode::GATEWAY_TIMEOUT),
            Error::UpstreamUnreachable(_) | Error::UpstreamProtocol(_) => {
                Some(StatusCode::BAD_GATEWAY)
            }
            Error::ClientAborted => None,
            Error::Io(_) | Error::Config(_) | Error::Internal(_) | Error::Http(_) => {
                Some(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Short machine-readable kind name, used by the audit log.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Config(_) => "config",
            Error::InstanceNotFound => "instance_not_found",
            Error::Unauthorized => "unauthorized",
            Error::InboundDenied => "inbound_denied",
            Error::OutboundDenied => "outbound_denied",
            Error::BadTarget(_) => "bad_target",
            Error::UpstreamTimeout => "upstream_timeout",
            Error::UpstreamUnreachable(_) => "upstream_unreachable",
            Error::UpstreamProtocol(_) => "upstream_protocol",
            Error::ClientAborted => "client_aborted",
            Error::Internal(_) => "internal",
            Error::Http(_) => "http",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
