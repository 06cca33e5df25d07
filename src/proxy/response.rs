//! Structured JSON error responses

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::{Response, StatusCode};

use crate::audit::now_iso8601;
use crate::error::Error;

/// Boxed error type used for proxied bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body type every gateway response uses.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// An empty response body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|e| match e {}).boxed()
}

/// A full in-memory response body.
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|e| match e {}).boxed()
}

/// Build the JSON error document for a gateway fault.
///
/// The body carries the human message, the HTTP status, a correlation
/// timestamp, and the instance name when known. The full cause goes to the
/// log, never to the client.
pub fn error_response(err: &Error, instance: Option<&str>) -> Response<ProxyBody> {
    let status = err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut doc = serde_json::json!({
        "error": err.to_string(),
        "code": status.as_u16(),
        "timestamp": now_iso8601(),
    });
    if let Some(name) = instance {
        doc["instance"] = serde_json::Value::String(name.to_string());
    }

    let body = serde_json::to_string_pretty(&doc).unwrap_or_else(|_| doc.to_string());

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(body))
        .unwrap()
}

/// Build the pretty-printed JSON debug document for the current instance
/// table.
pub fn debug_response(
    instances: &std::collections::HashMap<String, std::sync::Arc<crate::config::InstanceConfig>>,
    expose_tokens: bool,
) -> Response<ProxyBody> {
    let mut table = serde_json::Map::new();
    for (name, instance) in instances {
        let tokens: Vec<String> = if expose_tokens {
            instance.tokens.clone()
        } else {
            instance.tokens.iter().map(|_| "<redacted>".to_string()).collect()
        };
        table.insert(
            name.clone(),
            serde_json::json!({
                "tokens": tokens,
                "restrict_out": instance.restrict_out,
                "restrict_out_cidrs": instance.restrict_out_cidrs,
                "restrict_in_cidrs": instance.restrict_in_cidrs,
                "timeout": instance.timeout,
                "requires_auth": instance.requires_auth,
            }),
        );
    }

    let doc = serde_json::json!({
        "timestamp": now_iso8601(),
        "instances": table,
    });
    let body = serde_json::to_string_pretty(&doc).unwrap_or_else(|_| doc.to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .header("Cache-Control", "no-cache")
        .body(full_body(body))
        .unwrap()
}
