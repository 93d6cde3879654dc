use clap::{Args, Parser, Subcommand};
use tracing::{info, error, warn};
use tracing_subscriber::EnvFilter;
use anyhow::Result;
use std::path::PathBuf;

use gap_filler::client_trait::RpcClientKind;
use gap_filler::config::{split_addresses, Config, LogConfig};
use gap_filler::server;


#[derive(Parser, Debug)]
#[command(name = "gapfiller", author, version, about = "Gap-filling GraphQL proxy for an Ethereum indexer")]
struct Cli {

    /// Config file location (TOML)
    #[arg(long, global = true, env = "GAPFILLER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "GAPFILLER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Show full timestamp in logger
    #[arg(long, global = true)]
    log_timestamp: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy
    Proxy(ProxyArgs),

    /// Print the version of gap-filler
    Version,
}

#[derive(Args, Debug, Default)]
struct ProxyArgs {

    #[arg(long, env = "GAPFILLER_HTTP_HOST")]
    http_host: Option<String>,


    #[arg(long, env = "GAPFILLER_HTTP_PORT")]
    http_port: Option<u16>,

    /// HTTP base path
    #[arg(long, env = "GAPFILLER_HTTP_PATH")]
    http_path: Option<String>,

    /// Comma separated ethereum rpc addresses, e.g. http://127.0.0.1:8545,http://127.0.0.2:8545
    #[arg(long, env = "GAPFILLER_RPC_ETH")]
    rpc_eth: Option<String>,

    /// Comma separated tracing api addresses
    #[arg(long, env = "GAPFILLER_RPC_TRACING")]
    rpc_tracing: Option<String>,

    /// Postgraphile address
    #[arg(long, env = "GAPFILLER_GQL_DEFAULT")]
    gql_default: Option<String>,

    /// Tracing api postgraphile address
    #[arg(long, env = "GAPFILLER_GQL_TRACING")]
    gql_tracing: Option<String>,

    /// Enable graphiql interface
    #[arg(long)]
    gql_gui: bool,

    /// Talk to RPC endpoints through alloy instead of ethers-rs
    #[arg(long)]
    alloy: bool,
}

impl ProxyArgs {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.http_host {
            config.http.host = host;
        }
        if let Some(port) = self.http_port {
            config.http.port = port;
        }
        if let Some(path) = self.http_path {
            config.http.path = path;
        }
        if let Some(eth) = self.rpc_eth {
            config.rpc.eth = split_addresses(&eth);
        }
        if let Some(tracing) = self.rpc_tracing {
            config.rpc.tracing = split_addresses(&tracing);
        }
        if let Some(url) = self.gql_default {
            config.gql.default = url;
        }
        if let Some(url) = self.gql_tracing {
            config.gql.tracing = url;
        }
        if self.gql_gui {
            config.gql.gui = true;
        }
        if self.alloy {
            config.rpc.client = RpcClientKind::Alloy;
        }
    }
}

fn setup_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.timestamp {
        builder.init();
    } else {
        builder.without_time().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if let Some(timestamp) = cli.log_timestamp {
        config.log.timestamp = timestamp;
    }
    setup_tracing(&config.log);

    match cli.command {
        Commands::Version => {
            info!("gap-filler version: {}", env!("CARGO_PKG_VERSION"));
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Proxy(args) => {
            info!("----- Starting gap-filler-service -----");
            match &cli.config {
                Some(path) => info!(config = %path.display(), "using config file"),
                None => warn!("no config file passed with --config flag"),
            }
            args.apply(&mut config);
            config
                .validate()
                .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

            if let Err(e) = server::serve(config).await {
                error!("proxy failed: {}", e);
                return Err(anyhow::anyhow!("proxy failed: {}", e));
            }
        }
    }

    Ok(())
}
