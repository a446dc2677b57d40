use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use relay_config::ConfigLoader;

#[derive(Parser)]
#[command(name = "relay", version, about = "OpenAI-compatible LLM API gateway")]
struct Cli {
    /// Path to relay.toml (default: ./relay.toml or $RELAY_CONFIG).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the families YAML document (overrides the config file).
    #[arg(long)]
    families: Option<PathBuf>,

    /// Listen address override, e.g. 127.0.0.1:9090.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> relay_core::Result<()> {
    let mut config = ConfigLoader::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    if let Some(families) = cli.families {
        config.gateway.families_path = Some(families);
    }
    if let Some(listen) = cli.listen {
        match listen.rsplit_once(':') {
            Some((host, port)) => {
                config.server.host = host.to_string();
                config.server.port = port.parse().map_err(|_| {
                    relay_core::RelayError::Config(format!("invalid listen port in {listen:?}"))
                })?;
            }
            None => {
                return Err(relay_core::RelayError::Config(format!(
                    "invalid listen address {listen:?}, expected host:port"
                )));
            }
        }
    }

    relay_server::start_server(config).await
}
