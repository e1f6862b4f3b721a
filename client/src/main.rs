use std::time::Duration;

use clap::Parser;
use log::info;

use client::input::{IdleInput, InputSource, OrbitInput};
use client::network::GameClient;
use shared::{DEFAULT_PORT, DEFAULT_TICK_RATE};

/// Predicting game client (headless bot when no renderer is attached).
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Local tick rate in ticks per second
    #[arg(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,

    /// Suppress the per-second status line
    #[arg(long)]
    headless: bool,

    /// Keep the entity still instead of orbiting
    #[arg(long)]
    idle: bool,

    /// Simulated outbound packet loss rate (0.0 to 1.0)
    #[arg(long, default_value_t = 0.0)]
    loss: f64,

    /// Simulated outbound base latency in seconds
    #[arg(long, default_value_t = 0.0)]
    latency: f64,

    /// Exit after this many seconds (runs forever when omitted)
    #[arg(long)]
    duration: Option<f64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    info!("connecting to {} @ {} Hz", addr, args.tick_rate);
    let mut game_client = GameClient::new(&addr, args.tick_rate, args.loss, args.latency)?;

    let mut orbit = OrbitInput::new();
    let mut idle = IdleInput;
    let source: &mut dyn InputSource = if args.idle { &mut idle } else { &mut orbit };

    let duration = args.duration.map(Duration::from_secs_f64);
    game_client.run(source, duration, args.headless)?;
    Ok(())
}
