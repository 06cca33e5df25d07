//! Test infrastructure for e2e gateway tests.
// Each integration test is a separate crate, so not every test uses every item here.
#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use propylon::{Config, InstanceConfig, OutboundMode, ProxyServer};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

// ---------------------------------------------------------------------------
// TestReport — structured test reporting
// ---------------------------------------------------------------------------

/// Auto-detect the test name from the calling function.
/// Must be called from the test function body (not a helper).
#[macro_export]
macro_rules! test_report {
    ($title:expr) => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        // Strip "::f" suffix
        let name = &name[..name.len() - 3];
        // In async fns, the path ends with "::{{closure}}" — strip that too
        let name = name.strip_suffix("::{{closure}}").unwrap_or(name);
        $crate::common::TestReport::new(name, $title, file!(), line!())
    }};
}

enum Step {
    Setup(String),
    Action(String),
    AssertPass(String),
    AssertFail(String),
}

impl Step {
    fn to_report_line(&self) -> String {
        match self {
            Step::Setup(msg) => format!("STEP setup: {}", msg),
            Step::Action(msg) => format!("STEP action: {}", msg),
            Step::AssertPass(msg) => format!("STEP assert_pass: {}", msg),
            Step::AssertFail(msg) => format!("STEP assert_fail: {}", msg),
        }
    }
}

pub struct TestReport {
    full_path: String,
    title: String,
    steps: Mutex<Vec<Step>>,
    report_dir: Option<PathBuf>,
    source_file: String,
    source_line: u32,
}

impl TestReport {
    pub fn new(full_path: &str, title: &str, source_file: &str, source_line: u32) -> Self {
        let report_dir = std::env::var("TEST_REPORT_DIR").ok().map(PathBuf::from);
        Self {
            full_path: full_path.to_string(),
            title: title.to_string(),
            steps: Mutex::new(Vec::new()),
            report_dir,
            source_file: source_file.to_string(),
            source_line,
        }
    }

    fn display_value(debug_str: &str) -> String {
        const MAX: usize = 1000;
        if debug_str.len() <= MAX {
            format!("`{}`", debug_str)
        } else {
            format!("`{}…` ({} bytes)", &debug_str[..MAX], debug_str.len())
        }
    }

    pub fn setup(&self, msg: impl Display) {
        self.steps
            .lock()
            .unwrap()
            .push(Step::Setup(msg.to_string()));
    }

    pub fn action(&self, msg: impl Display) {
        self.steps
            .lock()
            .unwrap()
            .push(Step::Action(msg.to_string()));
    }

    pub fn assert_eq<A, E>(&self, label: &str, actual: &A, expected: &E)
    where
        A: PartialEq<E> + Debug,
        E: Debug,
    {
        let pass = actual == expected;
        let msg = format!(
            "{}: {} == {}",
            label,
            Self::display_value(&format!("{:?}", actual)),
            Self::display_value(&format!("{:?}", expected))
        );
        self.record(pass, msg);
        assert_eq!(actual, expected, "{}", label);
    }

    pub fn assert_contains(&self, label: &str, haystack: &str, needle: &str) {
        let pass = haystack.contains(needle);
        let msg = format!(
            "{}: {} contains {}",
            label,
            Self::display_value(&format!("{:?}", haystack)),
            Self::display_value(&format!("{:?}", needle))
        );
        self.record(pass, msg);
        assert!(
            pass,
            "{}: {:?} does not contain {:?}",
            label, haystack, needle
        );
    }

    pub fn assert_true(&self, label: &str, value: bool) {
        let msg = format!("{}: `{}`", label, value);
        self.record(value, msg);
        assert!(value, "{}", label);
    }

    fn record(&self, pass: bool, msg: String) {
        self.steps.lock().unwrap().push(if pass {
            Step::AssertPass(msg)
        } else {
            Step::AssertFail(msg)
        });
    }

    fn group(&self) -> &str {
        let parts: Vec<&str> = self.full_path.split("::").collect();
        if parts.len() >= 2 {
            parts[parts.len() - 2]
        } else {
            &self.full_path
        }
    }

    fn name(&self) -> &str {
        self.full_path
            .rsplit("::")
            .next()
            .unwrap_or(&self.full_path)
    }

    fn write_report(&self) {
        let Some(dir) = &self.report_dir else {
            return;
        };

        let result = if std::thread::panicking() {
            "fail"
        } else {
            "pass"
        };

        let steps = self.steps.lock().unwrap();
        let mut lines = Vec::new();
        lines.push(format!("GROUP: {}", self.group()));
        lines.push(format!("NAME: {}", self.name()));
        lines.push(format!("TITLE: {}", self.title));
        lines.push(format!("SOURCE: {}:{}", self.source_file, self.source_line));
        for step in steps.iter() {
            lines.push(step.to_report_line());
        }
        lines.push(format!("RESULT: {}", result));
        lines.push(String::new());

        let sanitized = self.full_path.replace("::", "__");
        let path = dir.join(format!("{}.txt", sanitized));
        let _ = std::fs::create_dir_all(dir);
        let _ = std::fs::write(path, lines.join("\n"));
    }
}

impl Drop for TestReport {
    fn drop(&mut self) {
        self.write_report();
    }
}

// ---------------------------------------------------------------------------
// Instance builders
// ---------------------------------------------------------------------------

/// An instance with no tokens and no restrictions.
pub fn open_instance(name: &str) -> InstanceConfig {
    InstanceConfig::named(name)
}

/// An instance guarded by a single token.
pub fn token_instance(name: &str, token: &str) -> InstanceConfig {
    let mut instance = InstanceConfig::named(name);
    instance.tokens = vec![token.to_string()];
    instance
}

/// Restrict an instance's outbound policy.
pub fn with_restrict_out(mut instance: InstanceConfig, mode: OutboundMode) -> InstanceConfig {
    instance.restrict_out = mode;
    instance
}

// ---------------------------------------------------------------------------
// TestCa — rcgen CA + issued server certs for upstream TLS
// ---------------------------------------------------------------------------

/// A test CA whose PEM is written to a tempdir so the gateway can trust it
/// via the `upstream_tls_ca` option.
pub struct TestCa {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    pub ca_pem_path: String,
    dir: TempDir,
}

impl TestCa {
    pub fn generate() -> Self {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "propylon test CA");
        let ca_cert = params.self_signed(&ca_key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let ca_pem_path = dir.path().join("ca.pem");
        std::fs::write(&ca_pem_path, ca_cert.pem()).unwrap();

        Self {
            ca_cert,
            ca_key,
            ca_pem_path: ca_pem_path.to_str().unwrap().to_string(),
            dir,
        }
    }

    /// A server TLS config for the given SAN, signed by this CA.
    pub fn server_tls_config(&self, san: &str) -> Arc<ServerConfig> {
        let params = CertificateParams::new(vec![san.to_string()]).unwrap();
        self.server_config_from(params)
    }

    /// A server TLS config whose certificate expired in the past.
    pub fn expired_server_tls_config(&self, san: &str) -> Arc<ServerConfig> {
        let mut params = CertificateParams::new(vec![san.to_string()]).unwrap();
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(30);
        params.not_after = now - time::Duration::days(1);
        self.server_config_from(params)
    }

    fn server_config_from(&self, params: CertificateParams) -> Arc<ServerConfig> {
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        server_config(cert.der().clone(), key)
    }
}

/// A server TLS config with a self-signed certificate (no CA).
pub fn self_signed_tls_config(san: &str) -> Arc<ServerConfig> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let key = KeyPair::generate().unwrap();
    let params = CertificateParams::new(vec![san.to_string()]).unwrap();
    let cert = params.self_signed(&key).unwrap();
    server_config(cert.der().clone(), key)
}

fn server_config(cert: CertificateDer<'static>, key: KeyPair) -> Arc<ServerConfig> {
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key_der)
        .unwrap();
    Arc::new(config)
}

// ---------------------------------------------------------------------------
// TestUpstream — a tiny HTTP(S) server
// ---------------------------------------------------------------------------

/// A handler function for the test upstream.
pub type UpstreamHandler =
    Arc<dyn Fn(Request<Incoming>) -> UpstreamResponse + Send + Sync + 'static>;

pub type UpstreamResponse = std::pin::Pin<
    Box<
        dyn std::future::Future<
                Output = std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error>,
            > + Send,
    >,
>;

/// A test upstream server on 127.0.0.1, plain or TLS.
pub struct TestUpstream {
    pub addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestUpstream {
    /// Start a plain-HTTP upstream.
    pub async fn start(handler: UpstreamHandler) -> Self {
        Self::start_inner("127.0.0.1:0", None, handler).await
    }

    /// Start a plain-HTTP upstream on a specific bind address (e.g. "[::1]:0").
    /// Returns None when the address family is unavailable.
    pub async fn try_start_on(bind: &str, handler: UpstreamHandler) -> Option<Self> {
        let listener = TcpListener::bind(bind).await.ok()?;
        Some(Self::from_listener(listener, None, handler))
    }

    /// Start a TLS upstream with the given server config.
    pub async fn start_tls(config: Arc<ServerConfig>, handler: UpstreamHandler) -> Self {
        Self::start_inner("127.0.0.1:0", Some(config), handler).await
    }

    async fn start_inner(
        bind: &str,
        tls: Option<Arc<ServerConfig>>,
        handler: UpstreamHandler,
    ) -> Self {
        let listener = TcpListener::bind(bind).await.unwrap();
        Self::from_listener(listener, tls, handler)
    }

    fn from_listener(
        listener: TcpListener,
        tls: Option<Arc<ServerConfig>>,
        handler: UpstreamHandler,
    ) -> Self {
        let addr = listener.local_addr().unwrap();
        let acceptor = tls.map(TlsAcceptor::from);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let (stream, _) = match result {
                            Ok(conn) => conn,
                            Err(_) => continue,
                        };

                        let acceptor = acceptor.clone();
                        let handler = handler.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req: Request<Incoming>| {
                                let handler = handler.clone();
                                handler(req)
                            });

                            match acceptor {
                                Some(acceptor) => {
                                    let tls_stream = match acceptor.accept(stream).await {
                                        Ok(s) => s,
                                        Err(_) => return,
                                    };
                                    let _ = http1::Builder::new()
                                        .serve_connection(TokioIo::new(tls_stream), service)
                                        .with_upgrades()
                                        .await;
                                }
                                None => {
                                    let _ = http1::Builder::new()
                                        .serve_connection(TokioIo::new(stream), service)
                                        .with_upgrades()
                                        .await;
                                }
                            }
                        });
                    }
                }
            }
        });

        Self { addr, shutdown_tx }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

fn text_response(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .unwrap()
}

/// A simple upstream handler that returns 200 with a text body.
pub fn ok_handler(body: &'static str) -> UpstreamHandler {
    Arc::new(move |_req| Box::pin(async move { Ok(text_response(StatusCode::OK, body)) }))
}

/// An upstream handler that echoes request details back.
pub fn echo_handler() -> UpstreamHandler {
    Arc::new(|req: Request<Incoming>| {
        Box::pin(async move {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            let query = req.uri().query().unwrap_or("").to_string();

            let mut header_lines = Vec::new();
            for (name, value) in req.headers().iter() {
                header_lines.push(format!("{}: {}", name, value.to_str().unwrap_or("?")));
            }

            let body = format!(
                "method={}\npath={}\nquery={}\n{}\n",
                method,
                path,
                query,
                header_lines.join("\n")
            );

            Ok(text_response(StatusCode::OK, body))
        })
    })
}

/// An upstream handler that echoes the request body bytes back.
pub fn body_echo_handler() -> UpstreamHandler {
    Arc::new(|req: Request<Incoming>| {
        Box::pin(async move {
            let body = req.into_body().collect().await?.to_bytes();
            Ok(text_response(StatusCode::OK, body))
        })
    })
}

/// An upstream handler that waits before answering.
pub fn delay_handler(delay: std::time::Duration, body: &'static str) -> UpstreamHandler {
    Arc::new(move |_req| {
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(text_response(StatusCode::OK, body))
        })
    })
}

/// An upstream handler implementing `/redirect/<n>` chains: each hop
/// redirects to `/redirect/<n-1>`, and `/redirect/0` answers 200.
pub fn redirect_handler(status: StatusCode) -> UpstreamHandler {
    Arc::new(move |req: Request<Incoming>| {
        Box::pin(async move {
            let path = req.uri().path().to_string();
            match path.strip_prefix("/redirect/").and_then(|n| n.parse::<u32>().ok()) {
                Some(0) => Ok(text_response(StatusCode::OK, "redirect done")),
                Some(n) => Ok(Response::builder()
                    .status(status)
                    .header("Location", format!("/redirect/{}", n - 1))
                    .body(Full::new(Bytes::new()).map_err(|e| match e {}).boxed())
                    .unwrap()),
                None => Ok(text_response(StatusCode::NOT_FOUND, "not a redirect path")),
            }
        })
    })
}

/// A WebSocket echo upstream: completes the upgrade and echoes every
/// text/binary message back.
pub fn ws_echo_handler() -> UpstreamHandler {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
    use tokio_tungstenite::tungstenite::protocol::{Message, Role};
    use tokio_tungstenite::WebSocketStream;

    Arc::new(|mut req: Request<Incoming>| {
        Box::pin(async move {
            let key = match req.headers().get("sec-websocket-key") {
                Some(key) => key.clone(),
                None => return Ok(text_response(StatusCode::BAD_REQUEST, "not a websocket")),
            };
            let accept = derive_accept_key(key.as_bytes());
            let protocol = req.headers().get("sec-websocket-protocol").cloned();

            let on_upgrade = hyper::upgrade::on(&mut req);
            tokio::spawn(async move {
                let upgraded = match on_upgrade.await {
                    Ok(upgraded) => upgraded,
                    Err(_) => return,
                };
                let mut ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Text(_) | Message::Binary(_) => {
                            if ws.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(frame) => {
                            let _ = ws.send(Message::Close(frame)).await;
                            break;
                        }
                        _ => {}
                    }
                }
            });

            let mut builder = Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header("Connection", "Upgrade")
                .header("Upgrade", "websocket")
                .header("Sec-WebSocket-Accept", accept);
            if let Some(protocol) = protocol {
                builder = builder.header("Sec-WebSocket-Protocol", protocol);
            }
            Ok(builder
                .body(Full::new(Bytes::new()).map_err(|e| match e {}).boxed())
                .unwrap())
        })
    })
}

// ---------------------------------------------------------------------------
// TestGateway — wraps ProxyServer with bind + spawn
// ---------------------------------------------------------------------------

pub struct TestGateway {
    pub addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl TestGateway {
    /// Start a gateway on 127.0.0.1:0 with the given instances.
    pub async fn start(instances: Vec<InstanceConfig>) -> Self {
        Self::start_with(instances, None, false).await
    }

    /// Start a gateway with an extra upstream trust root and/or exposed
    /// debug tokens.
    pub async fn start_with(
        instances: Vec<InstanceConfig>,
        upstream_tls_ca: Option<String>,
        expose_tokens: bool,
    ) -> Self {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut map = HashMap::new();
        for instance in instances {
            map.insert(instance.name.clone(), instance);
        }

        let config = Config {
            server: propylon::config::ServerConfig {
                listen: "127.0.0.1:0".to_string(),
                expose_tokens,
                upstream_tls_ca,
            },
            logging: propylon::config::LoggingConfig::default(),
            instances: map,
        };

        let mut server = ProxyServer::new(config).unwrap();
        let addr = server.bind().await.unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let _ = server.serve(shutdown_rx).await;
        });

        Self { addr, shutdown_tx }
    }

    /// Base URL for an instance endpoint.
    pub fn url(&self, instance: &str) -> String {
        format!("http://{}/{}", self.addr, instance)
    }

    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// A plain reqwest client for talking to the gateway.
pub fn test_client() -> reqwest::Client {
    reqwest::Client::builder().build().unwrap()
}
