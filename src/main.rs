// src/main.rs

//! Entry point: parses the minimal CLI surface, loads configuration, wires
//! up reloadable logging, and hands off to `server::run`.

use anyhow::Result;
use std::env;
use std::sync::Arc;
use tds_admission_proxy::config::Config;
use tds_admission_proxy::server;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--version") {
        println!("tds-admission-proxy {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
        .unwrap_or("config.toml");

    let port_override = match args.iter().position(|arg| arg == "--port") {
        Some(i) => match args.get(i + 1) {
            Some(s) => match s.parse::<u16>() {
                Ok(p) => Some(p),
                Err(_) => {
                    eprintln!("invalid port number: {s}");
                    std::process::exit(1);
                }
            },
            None => {
                eprintln!("--port flag requires a value");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let config = match Config::from_file(config_path, port_override) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();
    let reload_handle = Arc::new(reload_handle);

    if let Err(e) = server::run(config, reload_handle).await {
        error!("server runtime error: {e}");
        return Err(e);
    }
    Ok(())
}
