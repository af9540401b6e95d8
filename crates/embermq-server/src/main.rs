//! embermq - a multi-threaded MQTT broker.

mod config;
mod connection;
mod persistence;
mod retained;
mod server;
mod session;
mod store;
mod subscription;
mod util;
mod worker;

use std::sync::Arc;

use log::{error, info};

use crate::config::Config;
use crate::server::Server;

struct Args {
    config_path: String,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = "embermq.toml".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: -c requires a file path");
                    std::process::exit(1);
                }
            }
            "-h" | "--help" => {
                println!("embermq - MQTT broker");
                println!();
                println!("Usage: embermq [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>     Config file path (default: embermq.toml)");
                println!("  -h, --help              Show this help message");
                println!();
                println!("Configuration:");
                println!("  Config file uses TOML format. All settings can be overridden");
                println!("  with environment variables using the EMBERMQ__ prefix:");
                println!();
                println!("  EMBERMQ__SERVER__BIND=0.0.0.0:1884");
                println!("  EMBERMQ__SERVER__WORKERS=4");
                println!("  EMBERMQ__LIMITS__MAX_PACKET_SIZE=2097152");
                println!("  EMBERMQ__LOG__LEVEL=debug");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    Args { config_path }
}

fn main() {
    let args = parse_args();

    let config = match Config::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log.level))
        .init();

    let num_workers = if config.server.workers == 0 {
        num_cpus::get()
    } else {
        config.server.workers
    };

    info!(
        "starting embermq with {} worker threads (max_packet_size={}KB, max_qos_packets={})",
        num_workers,
        config.limits.max_packet_size / 1024,
        config.limits.max_qos_packets
    );

    let config = Arc::new(config);
    let mut server = match Server::new(num_workers, config) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        error!("server error: {}", e);
        std::process::exit(1);
    }
}
