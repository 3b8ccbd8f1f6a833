use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use voicebridge::{BridgeService, Config, Shutdown};

/// Voicebridge - speech engine bridge daemon
#[derive(Parser)]
#[command(name = "voicebridge", version, about)]
struct Cli {
    /// Address to listen on for the control client
    #[arg(long, env = "VOICEBRIDGE_LISTEN")]
    listen: Option<String>,

    /// Path to the speech engine helper executable
    #[arg(long, env = "VOICEBRIDGE_HELPER")]
    helper: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(short, long, env = "VOICEBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voicebridge=info",
        1 => "info,voicebridge=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(helper) = cli.helper {
        config.helper_path = helper;
    }
    tracing::debug!(
        listen = %config.listen_addr,
        helper = %config.helper_path.display(),
        "loaded configuration"
    );

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal.request();
        }
    });

    let mut bridge = BridgeService::bind(config, shutdown).await?;
    bridge.run().await?;

    Ok(())
}
