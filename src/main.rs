//! Bus Receiver - Main Entry Point
//!
//! `validate` checks a configuration file. `demo` runs every configured
//! endpoint against an in-process peek-lock queue until the queues drain or
//! Ctrl-C is pressed, then prints the metrics snapshot.

use async_trait::async_trait;
use bus_receiver::broker::{InMemoryQueue, ReceiveMode};
use bus_receiver::config::ReceiverConfig;
use bus_receiver::observability::{init_default_logging, metrics};
use bus_receiver::receiver::{
    HandlerError, HandlerRegistry, MessageHandler, ReceivedMessage, ReceiverHost,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["bus-receiver.toml", "config/bus-receiver.toml"];

const DEMO_CONFIG: &str = r#"
[receiver]
wait_timeout_secs = 1

[[endpoints]]
name = "demo/orders"
message_type = "DemoMessage"
handler_type = "DemoHandler"
max_retries = 3
pause_time_if_error_was_thrown_ms = 50
"#;

/// Per-subscription message consumption engine
#[derive(Parser)]
#[command(name = "bus-receiver")]
#[command(about = "Receive, dispatch and acknowledge broker messages")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BUS_RECEIVER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Validate {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
    /// Consume in-memory queues for every configured endpoint
    Demo {
        /// Messages sent to each endpoint
        #[arg(long, default_value_t = 10)]
        messages: u64,
        /// Make every K-th message fail in its handler
        #[arg(long, value_name = "K")]
        fail_every: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting bus-receiver v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Commands::Validate { show } => handle_validate_command(cli.config.as_deref(), show),
        Commands::Demo {
            messages,
            fail_every,
        } => run_demo(cli.config.as_deref(), messages, fail_every).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

/// Locate the configuration file: explicit path first, then the default locations
fn find_configuration(config_path: Option<&Path>) -> Option<PathBuf> {
    match config_path {
        Some(path) => Some(path.to_path_buf()),
        None => DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()),
    }
}

fn handle_validate_command(
    config_path: Option<&Path>,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = find_configuration(config_path).ok_or(
        "No configuration file found. Please provide one with -c/--config or create bus-receiver.toml",
    )?;

    info!("Loading configuration from: {}", path.display());
    let config = ReceiverConfig::load_from_file(&path)?;

    if show {
        println!("Effective configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!(
        endpoints = config.endpoints.len(),
        "Configuration validation complete"
    );
    Ok(())
}

/// Handler used by the demo: logs each payload and fails every K-th sequence
struct DemoHandler {
    fail_every: Option<u64>,
}

#[async_trait]
impl MessageHandler<Value> for DemoHandler {
    async fn handle(&self, message: ReceivedMessage<Value>) -> Result<(), HandlerError> {
        let sequence = message.body["sequence"].as_u64().unwrap_or_default();

        if let Some(k) = self.fail_every.filter(|k| *k > 0) {
            if sequence % k == 0 {
                return Err(format!("demo failure for sequence {sequence}").into());
            }
        }

        info!(
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            sequence,
            "Demo message handled"
        );
        Ok(())
    }
}

async fn run_demo(
    config_path: Option<&Path>,
    messages: u64,
    fail_every: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match find_configuration(config_path) {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ReceiverConfig::load_from_file(&path)?
        }
        None => {
            warn!("No configuration file found, using the built-in demo endpoint");
            ReceiverConfig::from_toml_str(DEMO_CONFIG)?
        }
    };

    if config.endpoints.is_empty() {
        return Err("configuration declares no endpoints".into());
    }

    let mut registry = HandlerRegistry::new();
    let mut registered = HashSet::new();
    for descriptor in config.descriptors() {
        if registered.insert(descriptor.handler_type.clone()) {
            registry.register::<Value, _, _>(
                descriptor.message_type.clone(),
                descriptor.handler_type.clone(),
                move || DemoHandler { fail_every },
            );
        }
    }

    let mut host = ReceiverHost::new(registry, config.settings());
    let mut queues = Vec::with_capacity(config.endpoints.len());

    for descriptor in config.descriptors() {
        let queue = InMemoryQueue::new(descriptor.name.clone());
        for sequence in 1..=messages {
            queue.send_json(&descriptor.message_type, &json!({ "sequence": sequence }))?;
        }
        host.subscribe(descriptor.clone(), queue.client(ReceiveMode::PeekLock))?;
        queues.push(queue);
    }

    info!(
        endpoints = queues.len(),
        messages_per_endpoint = messages,
        "Demo running, press Ctrl-C to stop"
    );

    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Received Ctrl-C, shutting down gracefully...");
        }
        _ = wait_until_drained(&host, &queues) => {
            info!("All demo queues drained");
        }
    }

    for (endpoint, result) in host.shutdown().await {
        if let Err(e) = result {
            warn!(endpoint = %endpoint, error = %e, "Subscription did not complete cleanly");
        }
    }

    for queue in &queues {
        println!(
            "{}: {}",
            queue.entity_path(),
            serde_json::to_string(&queue.stats())?
        );
    }
    println!("{}", serde_json::to_string_pretty(&metrics().get_metrics())?);
    Ok(())
}

/// Resolve once every queue is empty or every subscription has terminated
async fn wait_until_drained(host: &ReceiverHost, queues: &[InMemoryQueue]) {
    loop {
        let drained = queues.iter().all(InMemoryQueue::is_drained);
        let terminated = host
            .statuses()
            .iter()
            .all(|(_, status)| status.is_terminal());

        if drained || terminated {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
}
