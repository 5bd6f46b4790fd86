use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use champd::config::Config;
use champd::logging::init_logging;
use champd::remote::serve_champ;
use champd::server::{open_champ, Champ, Server};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(version, about = "Deduplicating backup server")]
struct Cli {
    /// Configuration file; defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept backups from clients.
    Serve,
    /// Run only the champion chooser, for servers configured with `champ_addr`.
    Champ,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("failed to load config from {path:?}"))?
        }
        None => Config::default(),
    };
    init_logging(config.logging.level);

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Champ => champ(config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("failed to listen on {}", config.server.listen))?;
    let champ_listen = config.server.champ_listen;
    let server = Arc::new(Server::open(config).await?);

    if let (Some(addr), Champ::Local(handle)) = (champ_listen, server.champ()) {
        let champ_listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
        let handle = handle.clone();
        let champ_config = server.config().champ.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_champ(champ_listener, handle, champ_config).await {
                tracing::error!(%err, "champion chooser listener failed");
            }
        });
    }

    server.serve(listener).await?;
    Ok(())
}

async fn champ(config: Config) -> anyhow::Result<()> {
    let addr = config
        .server
        .champ_listen
        .context("`server.champ_listen` is required to run the champion chooser")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;
    let handle = open_champ(&config).await?;
    serve_champ(listener, handle, config.champ).await?;
    Ok(())
}
