//! Munin API server binary.
//!
//! Usage:
//!   munin-api --config config.toml
//!   munin-api --port 8080
//!   munin-api --port 8080 --bind 0.0.0.0
//!
//! # Environment Variables
//!
//! - `MUNIN_BIND_ADDR` - server bind address (default: 127.0.0.1)
//! - `MUNIN_LEDGER_API_KEY` - ledger collaborator token (http backend)
//! - `OPENAI_API_KEY` / `ANTHROPIC_API_KEY` - LLM provider keys

use munin_api::{AppState, serve};
use munin_coordinator::{Coordinator, DelegationChannel, MuninConfig, Triage};
use munin_ledger::build_ledger;
use munin_llm::build_llm_client;
use munin_workers::standard_workers;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,munin_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut port: u16 = 8080;
    let mut config_path: Option<String> = None;
    let mut bind_addr: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port = args[i + 1]
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid port: {}", args[i + 1]))?;
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    bind_addr = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Munin API Server");
                println!();
                println!("Usage: munin-api [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -p, --port <PORT>    Port to listen on (default: 8080)");
                println!(
                    "  -b, --bind <ADDR>    Bind address (default: 127.0.0.1, env: MUNIN_BIND_ADDR)"
                );
                println!("  -c, --config <FILE>  Path to config.toml file");
                println!("  -h, --help           Show this help message");
                println!();
                println!("Environment variables:");
                println!("  MUNIN_BIND_ADDR      Server bind address (overridden by --bind)");
                println!("  MUNIN_LEDGER_API_KEY Ledger collaborator token (http backend)");
                println!("  OPENAI_API_KEY       OpenAI API key");
                println!("  ANTHROPIC_API_KEY    Anthropic API key");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    // Bind address precedence: CLI flag, then env var, then loopback.
    let host = bind_addr
        .or_else(|| std::env::var("MUNIN_BIND_ADDR").ok())
        .unwrap_or_else(|| "127.0.0.1".to_string());

    if host == "0.0.0.0" {
        tracing::warn!(
            "Server binding to 0.0.0.0: the API is reachable from all network interfaces. \
             Ensure a reverse proxy or firewall is in place."
        );
    }

    let config = if let Some(path) = config_path {
        tracing::info!(path = %path, "Reading config file");
        MuninConfig::from_file(&path)?
    } else {
        tracing::info!("No config file given, using built-in defaults");
        MuninConfig::default()
    };

    let ledger = build_ledger(&config.ledger)?;
    let llm = match &config.llm {
        Some(llm_config) => {
            tracing::info!(provider = %llm_config.provider, model = %llm_config.model, "LLM enabled");
            Some(build_llm_client(llm_config)?)
        }
        None => {
            tracing::info!("No LLM configured; running on keyword triage and template replies");
            None
        }
    };

    let workers = standard_workers(ledger, llm.clone());
    let channel =
        DelegationChannel::with_max_depth(workers, config.conversation.max_delegation_depth);
    let coordinator = Coordinator::new(
        Arc::new(channel),
        Triage::new(llm),
        config.conversation.clone(),
    );
    let state = AppState::new(coordinator);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    serve(Arc::new(state), addr).await?;

    Ok(())
}
