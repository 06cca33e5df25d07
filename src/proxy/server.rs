//! Standalone gateway server

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use super::handler::ProxyHandler;
use super::response::{debug_response, error_response, BoxError, ProxyBody};
use crate::audit::AuditLogger;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::InstanceRegistry;
use crate::tls::TlsSelector;

/// The standalone gateway server: owns the accept loop and routes
/// `/<instance>` and `/debug` into the core.
pub struct ProxyServer {
    config: Config,
    registry: Arc<InstanceRegistry>,
    tls: Arc<TlsSelector>,
    audit: Option<Arc<AuditLogger>>,
    listener: Option<TcpListener>,
}

impl ProxyServer {
    /// Create a new gateway server from configuration.
    pub fn new(config: Config) -> Result<Self> {
        let extra_roots = match &config.server.upstream_tls_ca {
            Some(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    Error::config(format!("Failed to read upstream TLS CA '{}': {}", path, e))
                })?;
                rustls_pemfile::certs(&mut &pem[..])
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| {
                        Error::config(format!("Invalid upstream TLS CA '{}': {}", path, e))
                    })?
            }
            None => Vec::new(),
        };
        let tls = Arc::new(TlsSelector::new(extra_roots)?);

        let registry = Arc::new(InstanceRegistry::new(config.instances.clone()));
        tracing::info!(instances = registry.len(), "Instance registry initialized");

        Ok(Self {
            config,
            registry,
            tls,
            audit: None,
            listener: None,
        })
    }

    /// Attach a JSONL audit logger for admission decisions.
    pub fn with_audit_logger(mut self, logger: Arc<AuditLogger>) -> Self {
        self.audit = Some(logger);
        self
    }

    /// The shared registry, for live reconfiguration (`replace_all`).
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Get the configured listen address.
    pub fn listen_address(&self) -> &str {
        &self.config.server.listen
    }

    /// Run the server until the process dies.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind_listener().await?;
        let shared = self.shared();

        loop {
            let (stream, client_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            spawn_connection(shared.clone(), stream, client_addr);
        }
    }

    /// Run the server with graceful shutdown.
    pub async fn run_until_shutdown(
        &self,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let listener = self.bind_listener().await?;
        let shared = self.shared();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    spawn_connection(shared.clone(), stream, client_addr);
                }
            }
        }
    }

    /// Bind the server to its configured address and return the actual
    /// socket address.
    ///
    /// This is useful when binding to port 0 to discover the assigned port.
    /// Call `serve()` afterwards to start accepting connections.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let listener = self.bind_listener().await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::internal(format!("Failed to get local address: {}", e)))?;
        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Serve connections using a previously bound listener, with graceful
    /// shutdown. Must call `bind()` first.
    pub async fn serve(
        mut self,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        let listener = self
            .listener
            .take()
            .expect("must call bind() before serve()");
        let shared = self.shared();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, client_addr) = match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    spawn_connection(shared.clone(), stream, client_addr);
                }
            }
        }
    }

    async fn bind_listener(&self) -> Result<TcpListener> {
        let addr: SocketAddr = self.config.server.listen.parse().map_err(|e| {
            Error::config(format!(
                "Invalid listen address '{}': {}",
                self.config.server.listen, e
            ))
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::internal(format!("Failed to bind to {}: {}", addr, e)))?;

        tracing::info!(address = %addr, "Gateway listening");
        Ok(listener)
    }

    fn shared(&self) -> Arc<Shared> {
        let handler = ProxyHandler::new(self.registry.clone(), self.tls.clone())
            .with_request_logging(
                self.config.logging.log_allowed_requests,
                self.config.logging.log_blocked_requests,
            );
        let handler = match &self.audit {
            Some(logger) => handler.with_audit_logger(logger.clone()),
            None => handler,
        };
        Arc::new(Shared {
            handler,
            registry: self.registry.clone(),
            expose_tokens: self.config.server.expose_tokens,
        })
    }
}

/// Per-connection shared state.
struct Shared {
    handler: ProxyHandler,
    registry: Arc<InstanceRegistry>,
    expose_tokens: bool,
}

fn spawn_connection(shared: Arc<Shared>, stream: TcpStream, client_addr: SocketAddr) {
    tracing::debug!(client = %client_addr, "New connection");

    tokio::spawn(async move {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let shared = shared.clone();
            Box::pin(async move { route(shared, client_addr, req).await })
                as std::pin::Pin<
                    Box<
                        dyn std::future::Future<
                                Output = std::result::Result<
                                    Response<ProxyBody>,
                                    Box<dyn std::error::Error + Send + Sync + 'static>,
                                >,
                            > + Send
                            + 'static,
                    >,
                >
        });

        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            let err_str = e.to_string();
            if !err_str.contains("connection closed") && !err_str.contains("early eof") {
                tracing::debug!(client = %client_addr, error = %e, "Connection error");
            }
        }
    });
}

/// Dispatch `/debug` and `/<instance>` paths into the core.
async fn route(
    shared: Arc<Shared>,
    client_addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<ProxyBody>, BoxError> {
    let path = req.uri().path();

    if path == "/debug" && req.method() == Method::GET {
        return Ok(debug_response(
            &shared.registry.snapshot(),
            shared.expose_tokens,
        ));
    }

    let name = path.trim_start_matches('/');
    if name.is_empty() || name.contains('/') {
        return Ok(error_response(&Error::InstanceNotFound, None));
    }
    let name = name.to_string();

    // The standalone edge has no host framework: trusted-forwarder handling
    // and framework auth are embedded-mode concerns.
    match shared
        .handler
        .handle(&name, client_addr.ip(), true, req)
        .await
    {
        Ok(response) => Ok(response),
        // No response can be written; erroring the service aborts the
        // connection.
        Err(e) => Err(Box::new(e) as BoxError),
    }
}
