//! Soak driver for the streamer
//!
//! Starts an in-process loopback broker, connects a [`Streamer`] to it and
//! publishes a fixed-size payload `--count` times, each call waiting for its
//! confirmation. Exits with status 1 on the first failure.

use amqp_streamer::config::{StreamerConfig, TransportSettings};
use amqp_streamer::observability::init_default_logging;
use amqp_streamer::testing::{BrokerMode, LoopbackBroker, LoopbackEngine};
use amqp_streamer::Streamer;
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Publish fixed-size messages with confirmation and report throughput
#[derive(Parser)]
#[command(name = "streamer-soak")]
#[command(about = "Publish fixed-size messages with confirmation and report throughput")]
#[command(version)]
struct Cli {
    /// Configuration file path (only the transport section is used)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of messages to publish
    #[arg(short = 'n', long, default_value_t = 100_000)]
    count: u64,

    /// Payload size in bytes
    #[arg(long, default_value_t = 500)]
    payload_size: usize,

    #[arg(long, default_value = "topic")]
    topic: String,

    #[arg(long, default_value = "po=test")]
    routing_key: String,

    #[arg(long, default_value = "soak")]
    message_type: String,

    /// How the loopback broker answers publishes
    #[arg(long, value_enum, default_value_t = Mode::Ack)]
    mode: Mode,

    /// Call stop() from a watchdog thread after this many milliseconds
    #[arg(long, value_name = "MS")]
    stop_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Ack,
    Reject,
    Silent,
}

impl From<Mode> for BrokerMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Ack => BrokerMode::Ack,
            Mode::Reject => BrokerMode::Reject,
            Mode::Silent => BrokerMode::Silent,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    init_default_logging();

    if let Err(e) = run(cli) {
        error!("Soak failed: {}", e);
        process::exit(1);
    }
}

fn load_settings(config_path: &Option<PathBuf>) -> Result<TransportSettings, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(StreamerConfig::load_from_file(path)?.transport)
        }
        None => Ok(TransportSettings::default()),
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_settings(&cli.config)?;
    let broker = LoopbackBroker::start(cli.mode.into())?;

    // Filled by the error callback, checked before every publish
    let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&failure);
    let streamer = Arc::new(Streamer::new(
        broker.server_config(),
        settings,
        LoopbackEngine::factory(),
        move |error| {
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
        },
    ));

    streamer.connect()?;

    if let Some(delay) = cli.stop_after_ms {
        let streamer = Arc::clone(&streamer);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(delay));
            warn!(delay_ms = delay, "Watchdog stopping streamer");
            streamer.stop();
        });
    }

    let payload = Bytes::from(vec![b'a'; cli.payload_size]);
    let started = Instant::now();

    for sent in 0..cli.count {
        if let Some(reason) = failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(format!("connection failed after {sent} messages: {reason}").into());
        }

        streamer
            .publish(&cli.topic, &cli.routing_key, &cli.message_type, payload.clone())
            .map_err(|e| format!("publish #{} failed: {e}", sent + 1))?;

        if (sent + 1) % 10_000 == 0 {
            info!(sent = sent + 1, "Soak progress");
        }
    }

    let elapsed = started.elapsed();
    let rate = cli.count as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    info!(
        count = cli.count,
        payload_size = cli.payload_size,
        elapsed_ms = elapsed.as_millis() as u64,
        messages_per_sec = rate as u64,
        broker_received = broker.received(),
        "Soak complete"
    );

    streamer.stop();
    Ok(())
}
