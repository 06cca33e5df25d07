//! Streaming relay: HTTP body pass-through and WebSocket frame pumps

use bytes::Bytes;
use futures_util::{SinkExt, Stream, StreamExt};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    UPGRADE,
};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant, Sleep};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{client_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::dispatch::{is_forwarding_header, is_hop_by_hop};
use super::request::{HeaderDirective, ProxyParams};
use super::response::{empty_body, BoxError, ProxyBody};
use crate::error::{Error, Result};
use crate::policy::PinnedTarget;
use crate::tls::TlsSelector;

/// True when the request asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("websocket"))
        .unwrap_or(false)
}

/// Build the client-facing response from the upstream response head:
/// hop-by-hop headers dropped, injected headers merged last, body streamed
/// through under the request deadline.
pub fn forward_response(
    upstream: Response<Incoming>,
    inject: &[HeaderDirective],
    deadline: Instant,
) -> Response<ProxyBody> {
    let (mut parts, body) = upstream.into_parts();

    let mut headers = HeaderMap::new();
    for (name, value) in &parts.headers {
        if !is_hop_by_hop(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    for directive in inject {
        headers.insert(directive.name.clone(), directive.value.clone());
    }
    parts.headers = headers;

    let body = DeadlineBody::new(body, deadline).boxed();
    Response::from_parts(parts, body)
}

/// A body wrapper that fails the stream when the request deadline passes.
///
/// Once streaming has begun no status-code change is possible, so firing
/// the deadline aborts the connection mid-body.
pub struct DeadlineBody<B> {
    inner: B,
    sleep: Pin<Box<Sleep>>,
}

impl<B> DeadlineBody<B> {
    pub fn new(inner: B, deadline: Instant) -> Self {
        Self {
            inner,
            sleep: Box::pin(tokio::time::sleep_until(deadline)),
        }
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if this.sleep.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(Box::new(Error::UpstreamTimeout))));
        }
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Headers that belong to the WebSocket handshake itself and must not be
/// copied between the two legs.
const WS_HANDSHAKE_HEADERS: &[&str] = &[
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-accept",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
];

fn is_ws_handshake_header(name: &str) -> bool {
    WS_HANDSHAKE_HEADERS.contains(&name)
}

/// Complete the upstream WebSocket handshake over the pinned, policy-checked
/// connection, answer the client's upgrade, and spawn the frame relay.
///
/// The deadline bounds the upstream handshake; an established relay runs
/// until either side closes or drops.
pub async fn proxy_websocket(
    mut req: Request<Incoming>,
    params: &ProxyParams,
    tls: &TlsSelector,
    pinned: PinnedTarget,
    deadline: Instant,
) -> Result<Response<ProxyBody>> {
    let client_key = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .ok_or_else(|| Error::bad_target("malformed WebSocket upgrade: missing key"))?
        .clone();
    let accept = derive_accept_key(client_key.as_bytes());
    let on_upgrade = hyper::upgrade::on(&mut req);

    let ws_url = as_ws_url(&params.target_url)?;
    let upstream_req = build_upstream_handshake(&ws_url, req.headers(), &params.request_headers)?;

    let stream = timeout_at(deadline, connect_ws_stream(&ws_url, pinned, tls, params))
        .await
        .map_err(|_| Error::UpstreamTimeout)??;

    let (upstream_ws, upstream_resp) = timeout_at(deadline, client_async(upstream_req, stream))
        .await
        .map_err(|_| Error::UpstreamTimeout)?
        .map_err(|e| match e {
            WsError::Http(resp) => Error::protocol(format!(
                "upstream rejected WebSocket upgrade with status {}",
                resp.status()
            )),
            e => Error::unreachable(format!("WebSocket handshake failed: {}", e)),
        })?;

    // Answer the client's upgrade with the same negotiated subprotocol.
    let mut response = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(empty_body())
        .map_err(|e| Error::internal(format!("failed to build upgrade response: {}", e)))?;
    if let Some(protocol) = upstream_resp.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }
    for directive in &params.response_headers {
        response
            .headers_mut()
            .insert(directive.name.clone(), directive.value.clone());
    }

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::debug!(error = %e, "Client upgrade failed");
                return;
            }
        };
        let io = TokioIo::new(upgraded);
        let client_ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
        relay_frames(client_ws, upstream_ws).await;
    });

    Ok(response)
}

/// Map http/https targets onto ws/wss for the upgrade path.
fn as_ws_url(target: &Url) -> Result<Url> {
    let mut url = target.clone();
    let mapped = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        _ => None,
    };
    if let Some(scheme) = mapped {
        url.set_scheme(scheme)
            .map_err(|_| Error::internal("failed to map scheme for WebSocket"))?;
    }
    Ok(url)
}

/// Dial the pinned address, with TLS for wss targets.
async fn connect_ws_stream(
    ws_url: &Url,
    pinned: PinnedTarget,
    tls: &TlsSelector,
    params: &ProxyParams,
) -> Result<MaybeTlsStream<TcpStream>> {
    let tcp = TcpStream::connect(pinned.addr).await.map_err(|e| {
        Error::unreachable(format!("Failed to connect to {}: {}", pinned.addr, e))
    })?;

    if ws_url.scheme() == "wss" {
        let host = ws_url
            .host_str()
            .unwrap_or_default()
            .trim_matches(|c| c == '[' || c == ']');
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| Error::unreachable(format!("Invalid server name '{}': {}", host, e)))?;
        let connector = TlsConnector::from(tls.client_config(params.skip_tls_checks));
        let tls_stream = connector.connect(server_name, tcp).await.map_err(|e| {
            Error::unreachable(format!("TLS connection to {} failed: {}", host, e))
        })?;
        Ok(MaybeTlsStream::Rustls(tls_stream))
    } else {
        Ok(MaybeTlsStream::Plain(tcp))
    }
}

/// Build the upstream handshake request: tungstenite supplies the required
/// upgrade headers, we carry over the client's application headers and the
/// requested subprotocol, then apply operator overrides.
fn build_upstream_handshake(
    ws_url: &Url,
    client_headers: &HeaderMap,
    overrides: &[HeaderDirective],
) -> Result<Request<()>> {
    let mut upstream_req = ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::bad_target(format!("Invalid WebSocket target: {}", e)))?;

    for (name, value) in client_headers {
        let lower = name.as_str();
        if is_hop_by_hop(lower)
            || is_forwarding_header(lower)
            || is_ws_handshake_header(lower)
            || lower == "host"
        {
            continue;
        }
        upstream_req.headers_mut().append(name.clone(), value.clone());
    }

    // The requested subprotocol is semantic and passes through.
    if let Some(protocol) = client_headers.get(SEC_WEBSOCKET_PROTOCOL) {
        upstream_req
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }

    for directive in overrides {
        upstream_req
            .headers_mut()
            .insert(directive.name.clone(), directive.value.clone());
    }

    Ok(upstream_req)
}

/// Relay frames in both directions until either side closes. Dropping the
/// halves on exit closes both sockets, which unblocks whichever direction
/// was still pending.
async fn relay_frames<C, U>(client: WebSocketStream<C>, upstream: WebSocketStream<U>)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    tokio::select! {
        _ = pump(&mut client_rx, &mut upstream_tx) => {
            tracing::debug!("WebSocket client side finished");
        }
        _ = pump(&mut upstream_rx, &mut client_tx) => {
            tracing::debug!("WebSocket upstream side finished");
        }
    }

    let _ = client_tx.close().await;
    let _ = upstream_tx.close().await;
}

/// Forward frames from one side to the other. Close frames propagate with
/// their status code and end the pump.
async fn pump<S, D>(rx: &mut S, tx: &mut D)
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
    D: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    while let Some(frame) = rx.next().await {
        match frame {
            Ok(Message::Close(close_frame)) => {
                let _ = tx.send(Message::Close(close_frame)).await;
                break;
            }
            // Raw frames only appear in manual framing mode
            Ok(Message::Frame(_)) => continue,
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            Err(_) => {
                let _ = tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = tx.flush().await;
}
