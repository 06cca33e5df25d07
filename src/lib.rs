//! Propylon - a multi-tenant reverse proxy gateway
//!
//! This crate hosts many named proxy *instances* in one process. Each
//! instance has its own authentication tokens, destination network policy,
//! client network policy, default timeout and TLS verification posture.
//! Clients name the upstream in the `url` query parameter; the gateway
//! authenticates the caller, validates the resolved destination address
//! against the instance policy, and streams the response back, WebSocket
//! upgrades included.
//!
//! # Features
//!
//! - **Per-instance admission**: query-token auth, client CIDR allowlists
//! - **SSRF defense**: destinations are resolved once, classified, and the
//!   approved address is the address dialed
//! - **Streaming relay**: request and response bodies pass through in
//!   bounded chunks; WebSocket frames relay in both directions
//! - **Per-request TLS policy**: `skip_tls_checks` relaxes exactly the
//!   named verification steps, never shared across requests
//!
//! # Example
//!
//! ```no_run
//! use propylon::{Config, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("proxy_config.json")?;
//!     let server = ProxyServer::new(config)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod policy;
pub mod proxy;
pub mod registry;
pub mod tls;


pub use audit::AuditLogger;
pub use config::{Config, InstanceConfig, OutboundMode};
pub use error::{Error, Result};
pub use proxy::{ProxyHandler, ProxyServer};
pub use registry::InstanceRegistry;
pub use tls::{SkipTlsChecks, TlsSelector};
