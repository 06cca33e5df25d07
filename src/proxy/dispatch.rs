//! Upstream request construction and dispatch

use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST, LOCATION, TRANSFER_ENCODING};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::TlsConnector;
use url::{Position, Url};

use super::request::{HeaderDirective, ProxyParams};
use super::response::{empty_body, ProxyBody};
use crate::config::InstanceConfig;
use crate::error::{Error, Result};
use crate::policy::{resolve_and_check, PinnedTarget};
use crate::tls::TlsSelector;

/// Redirect-following hop cap.
pub const MAX_REDIRECTS: usize = 10;

/// Hop-by-hop headers that must not be forwarded (RFC 7230 §6.1).
pub(crate) const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Proxy/forwarding headers received from the client that are dropped
/// before dispatch.
pub(crate) fn is_forwarding_header(name: &str) -> bool {
    name.starts_with("x-forwarded-") || name == "x-real-ip" || name == "forwarded"
}

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// Send the request upstream and return the response head with its
/// still-streaming body.
///
/// `first_hop` is the address the policy engine already approved; redirect
/// hops re-run the policy engine and pin a fresh address each time. The
/// deadline bounds resolution, connect, TLS, request upload and response
/// headers together.
pub async fn dispatch(
    instance: &InstanceConfig,
    tls: &TlsSelector,
    params: &ProxyParams,
    method: Method,
    client_headers: &HeaderMap,
    body: Incoming,
    first_hop: PinnedTarget,
    deadline: Instant,
) -> Result<Response<Incoming>> {
    let mut url = as_http_url(&params.target_url)?;
    let mut method = method;
    let had_body = body_expected(client_headers);
    let mut body = Some(BoxBodyExt::boxed_incoming(body));
    let mut send_body_headers = true;
    let mut pinned = first_hop;
    let mut hops = 0usize;

    loop {
        let headers = rewrite_headers(
            client_headers,
            &url,
            &params.request_headers,
            send_body_headers,
        )?;
        let send_body = body.take().unwrap_or_else(empty_body);
        let tls_config = tls.client_config(params.skip_tls_checks);

        let response = timeout_at(
            deadline,
            send_once(&url, pinned, tls_config, method.clone(), headers, send_body),
        )
        .await
        .map_err(|_| Error::UpstreamTimeout)??;

        let status = response.status();
        if !params.follow_redirects || !is_followable_redirect(status) {
            return Ok(response);
        }

        hops += 1;
        if hops > MAX_REDIRECTS {
            return Err(Error::protocol(format!(
                "stopped after {} redirects",
                MAX_REDIRECTS
            )));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .ok_or_else(|| Error::protocol("redirect response without Location header"))?
            .to_str()
            .map_err(|_| Error::protocol("redirect Location is not valid UTF-8"))?;
        let next = url
            .join(location)
            .map_err(|e| Error::protocol(format!("invalid redirect Location: {}", e)))?;
        match next.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::protocol(format!(
                    "redirect to unsupported scheme '{}'",
                    other
                )));
            }
        }

        match status.as_u16() {
            // 303 always converts to GET (HEAD stays HEAD); 301/302 convert
            // the historically GET-converted methods.
            301 | 302 | 303 => {
                if method != Method::GET && method != Method::HEAD {
                    method = Method::GET;
                }
                body = Some(empty_body());
                send_body_headers = false;
            }
            // 307/308 preserve the method; a streamed body cannot be replayed.
            307 | 308 => {
                if had_body {
                    return Err(Error::protocol(
                        "cannot follow redirect: request body already consumed",
                    ));
                }
                body = Some(empty_body());
            }
            _ => unreachable!(),
        }

        tracing::debug!(from = %url, to = %next, status = %status, "Following redirect");
        url = next;

        // Every hop is re-validated against the outbound policy.
        pinned = timeout_at(deadline, resolve_and_check(instance, &url))
            .await
            .map_err(|_| Error::UpstreamTimeout)??;
    }
}

fn is_followable_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Map ws/wss targets onto their HTTP equivalents for the plain dispatch
/// path.
fn as_http_url(target: &Url) -> Result<Url> {
    let mut url = target.clone();
    let mapped = match url.scheme() {
        "ws" => Some("http"),
        "wss" => Some("https"),
        _ => None,
    };
    if let Some(scheme) = mapped {
        url.set_scheme(scheme)
            .map_err(|_| Error::internal("failed to map WebSocket scheme"))?;
    }
    Ok(url)
}

/// Connect to the pinned address, complete the HTTP/1.1 handshake and send
/// one request.
async fn send_once(
    url: &Url,
    pinned: PinnedTarget,
    tls_config: Arc<ClientConfig>,
    method: Method,
    headers: HeaderMap,
    body: ProxyBody,
) -> Result<Response<Incoming>> {
    let tcp = TcpStream::connect(pinned.addr).await.map_err(|e| {
        Error::unreachable(format!("Failed to connect to {}: {}", pinned.addr, e))
    })?;

    let mut sender = if url.scheme() == "https" {
        let host = url
            .host_str()
            .unwrap_or_default()
            .trim_matches(|c| c == '[' || c == ']');
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::unreachable(format!("Invalid server name '{}': {}", host, e)))?;
        let connector = TlsConnector::from(tls_config);
        let tls_stream = connector.connect(server_name, tcp).await.map_err(|e| {
            Error::unreachable(format!("TLS connection to {} failed: {}", host, e))
        })?;
        handshake(tls_stream).await?
    } else {
        handshake(tcp).await?
    };

    let uri: hyper::Uri = origin_form(url)
        .parse()
        .map_err(|e| Error::internal(format!("failed to build upstream URI: {}", e)))?;

    let mut upstream_req = Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .map_err(|e| Error::internal(format!("failed to build upstream request: {}", e)))?;
    *upstream_req.headers_mut() = headers;

    sender.send_request(upstream_req).await.map_err(|e| {
        if e.is_parse() {
            Error::protocol(format!("malformed upstream response: {}", e))
        } else {
            Error::unreachable(format!("upstream request failed: {}", e))
        }
    })
}

async fn handshake<T>(io: T) -> Result<SendRequest<ProxyBody>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| Error::unreachable(format!("HTTP handshake failed: {}", e)))?;

    // Connection driver
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            let err_str = e.to_string();
            if !err_str.contains("connection closed") && !err_str.contains("early eof") {
                tracing::debug!(error = %e, "Upstream connection error");
            }
        }
    });

    Ok(sender)
}

/// The request target in origin form (path + query).
fn origin_form(url: &Url) -> String {
    let pq = &url[Position::BeforePath..Position::AfterQuery];
    if pq.is_empty() {
        "/".to_string()
    } else {
        pq.to_string()
    }
}

/// The target's authority component for the Host header: host, plus the
/// port when it is not the scheme default.
pub(crate) fn host_authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// True when the inbound request carries a body worth forwarding.
fn body_expected(headers: &HeaderMap) -> bool {
    if headers.contains_key(TRANSFER_ENCODING) {
        return true;
    }
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|n| n > 0)
}

/// Build the upstream header set per the rewriting rules: hop-by-hop and
/// forwarding headers dropped, Host re-derived from the target, overrides
/// applied last (an override of Host wins over the derived one).
/// User-Agent is forwarded only when the client sent one.
pub(crate) fn rewrite_headers(
    client_headers: &HeaderMap,
    target: &Url,
    overrides: &[HeaderDirective],
    send_body_headers: bool,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    for (name, value) in client_headers {
        let lower = name.as_str();
        if is_hop_by_hop(lower) || is_forwarding_header(lower) || lower == "host" {
            continue;
        }
        if !send_body_headers && matches!(lower, "content-length" | "content-type") {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let authority = host_authority(target);
    let host_value = HeaderValue::from_str(&authority)
        .map_err(|_| Error::bad_target(format!("Invalid target authority '{}'", authority)))?;
    headers.insert(HOST, host_value);

    for directive in overrides {
        headers.insert(directive.name.clone(), directive.value.clone());
    }

    Ok(headers)
}

/// Small helper so the first hop can move the hyper body into the shared
/// boxed type.
struct BoxBodyExt;

impl BoxBodyExt {
    fn boxed_incoming(body: Incoming) -> ProxyBody {
        use http_body_util::BodyExt;
        body.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            .boxed()
    }
}
