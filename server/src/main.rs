use clap::Parser;
use log::info;

use server::network::Server;
use shared::{DEFAULT_PORT, DEFAULT_TICK_RATE};

/// Authoritative game server.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Bind port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Simulation rate in ticks per second
    #[arg(short, long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,

    /// Simulated outbound packet loss rate (0.0 to 1.0)
    #[arg(long, default_value_t = 0.0)]
    loss: f64,

    /// Simulated outbound base latency in seconds
    #[arg(long, default_value_t = 0.0)]
    latency: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    info!("starting server on {} @ {} Hz", addr, args.tick_rate);
    if args.loss > 0.0 || args.latency > 0.0 {
        info!(
            "network simulation: {:.0}% loss, {:.0} ms base latency",
            args.loss * 100.0,
            args.latency * 1000.0
        );
    }

    let mut server = Server::new(&addr, args.tick_rate, args.loss, args.latency).await?;
    server.run().await
}
