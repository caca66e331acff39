//! deployd - Entry Point
//!
//! A distributed configuration-deployment agent. Exposes a REST surface for
//! submitting package deployments, journals durable state transitions, and
//! cooperates with peers through a shared coordination store so a dead
//! instance's deployments are redistributed to survivors.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use deployd::app::options::AppOptions;
use deployd::app::run::run;
use deployd::logs::{init_logging, LogLevel, LogOptions};
use deployd::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle -key=value and --key=value
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with('-') {
            // Handle standalone flags like -verbose
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        println!(
            "{}",
            serde_json::to_string_pretty(&version_info()).unwrap_or_default()
        );
        return;
    }

    // Initialize logging
    let log_level = if cli_args.contains_key("verbose") {
        LogLevel::Trace
    } else if cli_args.contains_key("d") || cli_args.contains_key("debug") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_options = LogOptions {
        log_level,
        ..Default::default()
    };
    if let Err(e) = init_logging(log_options) {
        println!("Failed to initialize logging: {e}");
    }

    let options = AppOptions {
        config_dir: cli_args
            .get("config")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/deployd")),
        config_from: cli_args.get("config-from").cloned(),
        endpoint: cli_args.get("endpoint").cloned(),
        no_cluster: cli_args.contains_key("nocluster"),
        no_journal: cli_args.contains_key("nojournal"),
    };

    info!("Running deployd with options: {:?}", options);
    let result = run(options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("deployd cannot be started: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("signal handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("signal handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("ctrl-c handler");
        info!("Ctrl+C received, shutting down...");
    }
}
