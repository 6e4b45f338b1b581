//! Tilestream Node -- chunk replication loopback driver.
//!
//! Usage:
//!   tilestream-node                        # Run the loopback with default config
//!   tilestream-node --config path.toml     # Run with custom config
//!   tilestream-node run --loss 15          # Override link loss
//!   tilestream-node hello                  # Show the server hello this config produces
//!   tilestream-node config                 # Print the effective config as TOML

use clap::{Parser, Subcommand};

use tilestream_node::config::NodeConfig;
use tilestream_node::expand_tilde;
use tilestream_node::session::ServerSession;
use tilestream_node::sim::{run_loopback, Loopback};
use tilestream_protocol::WireMessage;

#[derive(Parser)]
#[command(name = "tilestream-node", about = "Tilestream chunk replication node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.tilestream/config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run server and client over a lossy in-process link (default)
    Run {
        /// Server ticks to run
        #[arg(long)]
        ticks: Option<u64>,
        /// Percentage of snapshot fragments dropped
        #[arg(long)]
        loss: Option<u8>,
        /// Step both ends in lockstep instead of on wall-clock ticks
        #[arg(long)]
        lockstep: bool,
    },
    /// Show the server hello for this config
    Hello,
    /// Print the effective config
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tilestream_node=info,tilestream_replication=info".into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config_path = expand_tilde(&cli.config);
    let mut cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run { ticks, loss, lockstep }) => {
            if let Some(ticks) = ticks {
                cfg.sim.ticks = ticks;
            }
            if let Some(loss) = loss {
                cfg.link.loss_percent = loss;
            }
            run(cfg, lockstep).await?;
        }
        None => run(cfg, false).await?,
        Some(Commands::Hello) => {
            let server = ServerSession::new(&cfg)?;
            let hello = server.hello();
            println!("World seed: {}", hello.world_seed);
            println!("Sea level: {}", hello.sea_level);
            println!("Tick rate: {} Hz", hello.tick_rate_hz);
            println!("Config CRC64: {}", hex::encode(hello.config_crc64.to_be_bytes()));
            println!("Payload: {}", hex::encode(hello.encode_to_vec()));
        }
        Some(Commands::Config) => {
            print!("{}", cfg.to_toml()?);
        }
    }

    Ok(())
}

async fn run(cfg: NodeConfig, lockstep: bool) -> anyhow::Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        seed = cfg.world.seed,
        lockstep,
        "starting tilestream-node"
    );

    let report = if lockstep {
        let ticks = cfg.sim.ticks;
        let mut sim = Loopback::new(cfg)?;
        sim.run(ticks)?;
        sim.report()
    } else {
        run_loopback(cfg).await?
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.diverging_in_view > 0 {
        tracing::warn!(diverging = report.diverging_in_view, "client did not converge");
    }
    Ok(())
}
