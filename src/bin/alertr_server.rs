//! AlertR server
//!
//! Loads the configuration, installs logging and serves clients until the
//! process is stopped.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use alertr::config::load_config;
use alertr::logging::init_tracing;
use alertr::server::Server;
use alertr::storage::InMemoryStorage;

/// Environment variable naming the configuration file.
const CONFIG_ENV: &str = "ALERTR_CONFIG";

fn parse_args() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    eprintln!("error: --config requires a value");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                println!("alertr-server - AlertR alerting server");
                println!();
                println!("USAGE:");
                println!("    alertr-server [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -c, --config <FILE>       TOML configuration file [env: {CONFIG_ENV}]");
                println!("    -h, --help                Print help information");
                println!();
                println!("Any setting can be overridden with ALERTR_<SECTION>__<KEY> variables.");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    config_path
}

fn main() {
    let config_path = parse_args();
    let config = match load_config(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
    info!(config = ?config_path, levels = config.alert_levels.len(), "configuration loaded");

    let storage = match InMemoryStorage::with_policy(config.alert_levels.clone(), config.alert_system_active) {
        Ok(storage) => Arc::new(storage),
        Err(e) => {
            error!(error = %e, "invalid alert level policy");
            std::process::exit(1);
        }
    };

    let result = Server::bind(config, storage).and_then(Server::run);
    if let Err(e) = result {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
