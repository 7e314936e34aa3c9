use clap::Parser;
use ferrous_dot_domain::CliOverrides;
use tracing::{error, info};

mod bootstrap;
mod di;

#[derive(Parser)]
#[command(name = "ferrous-dot")]
#[command(version = "0.1.0")]
#[command(about = "Ferrous DoT - DNS-over-TLS forwarding proxy with certificate pinning")]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<String>,

    /// DNS listen port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short = 'b', long)]
    bind: Option<String>,

    /// Maximum concurrent forwarder connections
    #[arg(short = 'm', long)]
    max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cli_overrides = CliOverrides {
        bind_address: cli.bind,
        port: cli.port,
        max_connections: cli.max_connections,
        log_level: cli.log_level,
    };

    let config = bootstrap::load_config(cli.config.as_deref(), cli_overrides)?;
    bootstrap::init_logging(&config.logging);

    info!("Starting Ferrous DoT v{}", env!("CARGO_PKG_VERSION"));

    let mut services = di::DotServices::new(&config)?;
    if let Err(e) = services.listen(&config) {
        error!(error = %e, "Unable to bind to server port");
        return Err(e);
    }

    services.run()?;

    info!("Shutdown complete");
    Ok(())
}
