use std::sync::Arc;
use std::time::Duration;

use champd::config::Config;
use champd::logging::{init_logging, LogLevel};
use champd::server::Server;
use tokio::net::TcpListener;

use crate::stresstest::perform_stresstest;
use crate::workload::Workload;

mod stresstest;
mod workload;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(LogLevel::Warn);

    let pool = tempfile::tempdir()?;
    let mut config = Config::default();
    config.pool = pool.path().to_path_buf();
    config.champ.window_hooks = 1024;
    config.champ.max_pending_blocks = 4096;

    let server = Arc::new(Server::open(config).await?);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(err) = server.serve(listener).await {
            tracing::error!(%err, "server stopped");
        }
    });

    let churn = Workload::builder("home directories")
        .concurrency(8)
        .size_distribution(64 * 1024, 4 * 1024 * 1024) // p50 = 64K, p99 = 4M
        .files_per_backup(32)
        .mutation_rate(0.05)
        .action_weights(10, 90)
        .build()?;
    let fresh = Workload::builder("new machines")
        .concurrency(4)
        .size_distribution(16 * 1024, 1024 * 1024)
        .files_per_backup(64)
        .action_weights(90, 10)
        .build()?;

    perform_stresstest(addr, vec![churn, fresh], Duration::from_secs(10)).await
}
