//! Request admission pipeline

use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

use super::dispatch;
use super::relay;
use super::request::ProxyParams;
use super::response::{error_response, ProxyBody};
use crate::audit::{AuditEntry, AuditLogger, AuditReason};
use crate::config::InstanceConfig;
use crate::error::{Error, Result};
use crate::policy::{check_inbound, resolve_and_check};
use crate::registry::InstanceRegistry;
use crate::tls::TlsSelector;

/// The admission pipeline shared by the standalone server and embedding
/// hosts.
///
/// Admission order: instance lookup, inbound policy, parameter parsing,
/// authentication, outbound policy. No outbound I/O happens before both the
/// auth gate and the outbound policy engine have approved the request; the
/// address the policy engine approves is the address the dispatcher dials.
pub struct ProxyHandler {
    registry: Arc<InstanceRegistry>,
    tls: Arc<TlsSelector>,
    audit: Option<Arc<AuditLogger>>,
    log_allowed_requests: bool,
    log_blocked_requests: bool,
}

impl ProxyHandler {
    pub fn new(registry: Arc<InstanceRegistry>, tls: Arc<TlsSelector>) -> Self {
        Self {
            registry,
            tls,
            audit: None,
            log_allowed_requests: true,
            log_blocked_requests: true,
        }
    }

    pub fn with_audit_logger(mut self, logger: Arc<AuditLogger>) -> Self {
        self.audit = Some(logger);
        self
    }

    pub fn with_request_logging(mut self, log_allowed: bool, log_blocked: bool) -> Self {
        self.log_allowed_requests = log_allowed;
        self.log_blocked_requests = log_blocked;
        self
    }

    /// Handle one inbound request for a named instance.
    ///
    /// `client_ip` is the caller-derived source address (the standalone
    /// server passes the socket peer; embedding hosts apply their own
    /// trusted-forwarder rules first). `framework_authed` is the embedding
    /// host's auth verdict; it is AND-ed with the token gate for instances
    /// with `requires_auth`.
    ///
    /// Returns `Err` only for `ClientAborted`, where no response can be
    /// written; every other fault becomes a JSON error response.
    pub async fn handle(
        &self,
        instance_name: &str,
        client_ip: IpAddr,
        framework_authed: bool,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>> {
        let method = req.method().to_string();

        let instance = match self.registry.get(instance_name) {
            Some(instance) => instance,
            None => {
                return self.deny(instance_name, client_ip, &method, None, Error::InstanceNotFound)
            }
        };

        if let Err(err) = check_inbound(&instance, client_ip) {
            return self.deny(instance_name, client_ip, &method, None, err);
        }

        let params = match ProxyParams::parse(req.uri().query()) {
            Ok(params) => params,
            Err(err) => return self.deny(instance_name, client_ip, &method, None, err),
        };
        let target = params.target_url.to_string();

        if let Err(err) = authorize(&instance, &params, framework_authed) {
            return self.deny(instance_name, client_ip, &method, Some(&target), err);
        }

        let timeout = Duration::from_secs(params.effective_timeout(instance.timeout));
        let deadline = Instant::now() + timeout;

        let pinned =
            match timeout_at(deadline, resolve_and_check(&instance, &params.target_url)).await {
                Ok(Ok(pinned)) => pinned,
                Ok(Err(err)) => {
                    return self.deny(instance_name, client_ip, &method, Some(&target), err)
                }
                Err(_) => {
                    return self.deny(
                        instance_name,
                        client_ip,
                        &method,
                        Some(&target),
                        Error::UpstreamTimeout,
                    )
                }
            };

        if self.log_allowed_requests {
            tracing::info!(
                instance = %instance_name,
                method = %method,
                url = %target,
                upstream = %pinned.addr,
                "ALLOWED"
            );
        }
        if let Some(audit) = &self.audit {
            audit.log(&AuditEntry::allowed(instance_name, client_ip, &method, &target));
        }

        let is_websocket =
            req.method() == Method::GET && relay::is_websocket_upgrade(req.headers());

        let outcome = if is_websocket {
            relay::proxy_websocket(req, &params, &self.tls, pinned, deadline).await
        } else {
            let (parts, body) = req.into_parts();
            dispatch::dispatch(
                &instance,
                &self.tls,
                &params,
                parts.method,
                &parts.headers,
                body,
                pinned,
                deadline,
            )
            .await
            .map(|upstream| relay::forward_response(upstream, &params.response_headers, deadline))
        };

        match outcome {
            Ok(response) => Ok(response),
            Err(Error::ClientAborted) => Err(Error::ClientAborted),
            Err(err) => {
                tracing::warn!(
                    instance = %instance_name,
                    method = %method,
                    url = %target,
                    error = %err,
                    kind = err.kind(),
                    "Upstream dispatch failed"
                );
                Ok(error_response(&err, Some(instance_name)))
            }
        }
    }

    /// Log, audit and answer an admission denial.
    fn deny(
        &self,
        instance_name: &str,
        client_ip: IpAddr,
        method: &str,
        target: Option<&str>,
        err: Error,
    ) -> Result<Response<ProxyBody>> {
        if self.log_blocked_requests {
            tracing::warn!(
                instance = %instance_name,
                client = %client_ip,
                method = %method,
                error = %err,
                kind = err.kind(),
                "BLOCKED"
            );
        }
        if let Some(audit) = &self.audit {
            if let Some(reason) = audit_reason(&err) {
                audit.log(&AuditEntry::blocked(
                    instance_name,
                    client_ip,
                    method,
                    target,
                    reason,
                ));
            }
        }
        Ok(error_response(&err, Some(instance_name)))
    }
}

/// Only admission outcomes are audited; dispatch faults are not decisions.
fn audit_reason(err: &Error) -> Option<AuditReason> {
    match err {
        Error::InstanceNotFound => Some(AuditReason::InstanceNotFound),
        Error::InboundDenied => Some(AuditReason::InboundDenied),
        Error::OutboundDenied => Some(AuditReason::OutboundDenied),
        Error::Unauthorized => Some(AuditReason::AuthFailed),
        Error::BadTarget(_) => Some(AuditReason::BadTarget),
        _ => None,
    }
}

/// Token gate. The host framework verdict is AND-ed for instances that
/// require it; an empty token set means no token is needed.
fn authorize(
    instance: &InstanceConfig,
    params: &ProxyParams,
    framework_authed: bool,
) -> Result<()> {
    if instance.requires_auth && !framework_authed {
        return Err(Error::Unauthorized);
    }
    if instance.tokens.is_empty() {
        return Ok(());
    }
    let provided = params.token.as_deref().ok_or(Error::Unauthorized)?;
    if instance
        .tokens
        .iter()
        .any(|expected| constant_time_eq(provided.as_bytes(), expected.as_bytes()))
    {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
