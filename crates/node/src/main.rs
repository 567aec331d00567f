// node/src/main.rs
use blockchain_core::Network;
use clap::{Parser, Subcommand, ValueEnum};
use consensus::WalletSecret;
use node::{Node, NodeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the staking wallet password
const WALLET_PASSWORD_ENV: &str = "HYBRID_NODE_WALLET_PASSWORD";

#[derive(Parser)]
#[command(name = "hybrid-node")]
#[command(about = "Hybrid PoW/PoS Blockchain Node", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start {
        /// Configuration file path
        #[arg(short, long, default_value = "./config.toml")]
        config: String,

        /// Override data directory. The staking wallet is opened when
        /// HYBRID_NODE_WALLET_PASSWORD is set.
        #[arg(short, long)]
        data_dir: Option<String>,
    },

    /// Initialize a data directory with a default configuration
    Init {
        /// Data directory
        #[arg(short, long, default_value = "./data")]
        data_dir: String,

        #[arg(short, long, value_enum, default_value_t = NetworkArg::Main)]
        network: NetworkArg,
    },

    /// Print the consensus constants of a network
    Params {
        #[arg(short, long, value_enum, default_value_t = NetworkArg::Main)]
        network: NetworkArg,

        /// Print JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum NetworkArg {
    Main,
    Test,
    Regtest,
}

impl From<NetworkArg> for Network {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Main => Network::Main,
            NetworkArg::Test => Network::Test,
            NetworkArg::Regtest => Network::RegTest,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{log_level},rocksdb=warn").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Start { config, data_dir } => {
            start_node(&config, data_dir, wallet_password()).await?;
        }
        Commands::Init { data_dir, network } => {
            init_node(&data_dir, network.into())?;
        }
        Commands::Params { network, json } => {
            let params = blockchain_core::ConsensusParameters::for_network(network.into());
            if json {
                println!("{}", serde_json::to_string_pretty(&params)?);
            } else {
                println!("{}", toml::to_string_pretty(&params)?);
            }
        }
    }

    Ok(())
}

async fn start_node(
    config_path: &str,
    data_dir_override: Option<String>,
    wallet_password: Option<String>,
) -> anyhow::Result<()> {
    tracing::info!("Loading configuration from {}", config_path);
    let mut config = NodeConfig::from_file(config_path)?;

    if let Some(data_dir) = data_dir_override {
        config.data_dir = data_dir;
    }

    tracing::info!("Starting node with data directory: {}", config.data_dir);

    let node = Node::new(config.clone())?;
    if let Some(password) = &wallet_password {
        let address = node.open_wallet(&config.staking.wallet, password)?;
        tracing::info!("Staking wallet '{}' at {}", config.staking.wallet, address);
    }
    node.start().await?;

    if let Some(password) = wallet_password {
        if config.staking.enabled {
            node.start_staking(WalletSecret::new(config.staking.wallet.clone(), password))
                .await?;
        }
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    node.shutdown().await?;
    tracing::info!("Node stopped gracefully");

    Ok(())
}

/// Take the wallet password out of the environment so child processes do
/// not inherit it
fn wallet_password() -> Option<String> {
    let password = std::env::var(WALLET_PASSWORD_ENV).ok().filter(|p| !p.is_empty());
    std::env::remove_var(WALLET_PASSWORD_ENV);
    password
}

fn init_node(data_dir: &str, network: Network) -> anyhow::Result<()> {
    tracing::info!("Initializing {} node at {}", network, data_dir);

    std::fs::create_dir_all(data_dir)?;

    let config = NodeConfig {
        data_dir: data_dir.to_string(),
        network,
        ..NodeConfig::default()
    };
    let path = std::path::Path::new(data_dir).join("config.toml");
    config.to_file(&path)?;

    tracing::info!("Node initialized successfully at {}", data_dir);
    tracing::info!("Edit {} to configure your node", path.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_not_accepted_as_argument() {
        assert!(Cli::try_parse_from(["hybrid-node", "start", "--wallet-password", "pw"]).is_err());
        assert!(Cli::try_parse_from(["hybrid-node", "start", "--data-dir", "/tmp/node"]).is_ok());
    }

    #[test]
    fn test_password_taken_from_environment() {
        std::env::set_var(WALLET_PASSWORD_ENV, "pw");
        assert_eq!(wallet_password().as_deref(), Some("pw"));
        assert!(std::env::var(WALLET_PASSWORD_ENV).is_err());
        assert_eq!(wallet_password(), None);
    }
}
