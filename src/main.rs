//! Propylon CLI - a multi-tenant reverse proxy gateway

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use propylon::{AuditLogger, Config, ProxyServer};

#[derive(Parser)]
#[command(name = "propylon")]
#[command(about = "A multi-tenant reverse proxy gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server
    Run {
        /// Path to JSON configuration file
        #[arg(short, long, default_value = "proxy_config.json")]
        config: PathBuf,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Log level (error, warn, info, debug, trace)
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            host,
            port,
            log_level,
        } => {
            // Initialize logging
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();

            tracing::info!(path = %config.display(), "Loading configuration");
            let mut cfg = Config::from_file(&config)?;

            // Apply CLI overrides to the listen address
            if host.is_some() || port.is_some() {
                let (cfg_host, cfg_port) = split_listen(&cfg.server.listen);
                cfg.server.listen = format!(
                    "{}:{}",
                    host.as_deref().unwrap_or(cfg_host),
                    port.unwrap_or(cfg_port)
                );
            }

            if cfg.instances.is_empty() {
                eprintln!("Error: no instances configured.");
                eprintln!();
                eprintln!("Add at least one instance to the config file, for example:");
                eprintln!("  {{\"instances\": {{\"default\": {{\"tokens\": [\"my-token\"]}}}}}}");
                std::process::exit(1);
            }

            let audit_log_path = cfg.logging.audit_log.clone();

            let mut server = ProxyServer::new(cfg)?;

            // Open audit logger if configured
            if let Some(ref audit_path) = audit_log_path {
                match AuditLogger::open(audit_path) {
                    Ok(logger) => {
                        tracing::info!(path = %audit_path, "Audit log enabled");
                        server = server.with_audit_logger(Arc::new(logger));
                    }
                    Err(e) => {
                        eprintln!("Error: Failed to open audit log '{}': {}", audit_path, e);
                        std::process::exit(1);
                    }
                }
            }

            tracing::info!("Starting gateway server...");
            tracing::info!(
                "Request shape: http://{}/<instance>?token=<token>&url=<target>",
                server.listen_address()
            );

            // Handle Ctrl+C
            let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("Shutting down...");
                let _ = shutdown_tx.send(());
            });

            server.run_until_shutdown(shutdown_rx).await?;
        }

        Commands::ValidateConfig { config } => {
            println!("Validating configuration: {}", config.display());

            let cfg = Config::from_file(&config)?;

            println!("Configuration is valid!");
            println!();
            println!("  Listen address: {}", cfg.server.listen);
            println!("  Log level: {}", cfg.logging.level);
            println!(
                "  Log allowed requests: {}",
                cfg.logging.log_allowed_requests
            );
            println!(
                "  Log blocked requests: {}",
                cfg.logging.log_blocked_requests
            );
            println!(
                "  Audit log: {}",
                cfg.logging.audit_log.as_deref().unwrap_or("disabled")
            );
            println!("  Instances: {}", cfg.instances.len());

            if !cfg.instances.is_empty() {
                println!();
                println!("Instances:");
                let mut names: Vec<&String> = cfg.instances.keys().collect();
                names.sort();
                for name in names {
                    let inst = &cfg.instances[name];
                    let mode = serde_json::to_value(inst.restrict_out)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default();
                    let out_desc = if inst.restrict_out_cidrs.is_empty() {
                        mode
                    } else {
                        let cidrs: Vec<String> = inst
                            .restrict_out_cidrs
                            .iter()
                            .map(|c| c.to_string())
                            .collect();
                        format!("{} [{}]", mode, cidrs.join(", "))
                    };
                    println!(
                        "  {} — tokens: {}, restrict_out: {}, timeout: {}s{}",
                        name,
                        inst.tokens.len(),
                        out_desc,
                        inst.timeout,
                        if inst.requires_auth {
                            ", requires host auth"
                        } else {
                            ""
                        }
                    );
                }
            }
        }
    }

    Ok(())
}

/// Split "host:port" keeping IPv6 bracket forms intact.
fn split_listen(listen: &str) -> (&str, u16) {
    match listen.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().unwrap_or(8080)),
        None => (listen, 8080),
    }
}
