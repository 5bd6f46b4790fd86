//! Wires the pool, the allocator and the champion chooser together and runs
//! one session per client connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{error, info, warn, Instrument};

use crate::blockstore::{BlockStore, FsBlockStore};
use crate::config::Config;
use crate::dpth::DataPathAllocator;
use crate::error::Result;
use crate::remote::RemoteChamp;
use crate::service::{self, ChampHandle, Deduper};
use crate::session::{Session, SessionOptions, SessionSummary};
use crate::transport::framed;

#[derive(Clone)]
pub enum Champ {
    Local(ChampHandle),
    Remote(SocketAddr),
}

pub struct Server {
    config: Config,
    allocator: DataPathAllocator,
    store: Arc<dyn BlockStore>,
    champ: Champ,
}

impl Server {
    /// Opens the storage pool. Unless `champ_addr` is configured, the champion
    /// chooser runs inside this process.
    pub async fn open(config: Config) -> Result<Self> {
        let champ = match config.server.champ_addr {
            Some(addr) => Champ::Remote(addr),
            None => Champ::Local(open_champ(&config).await?),
        };
        Self::with_champ(config, champ).await
    }

    pub async fn with_champ(config: Config, champ: Champ) -> Result<Self> {
        tokio::fs::create_dir_all(config.backups_root()).await?;
        let data_root = config.data_root();
        let allocator = DataPathAllocator::open(&data_root, config.dpth.max_per_level).await?;
        let store = Arc::new(FsBlockStore::new(data_root, config.session.compression_level));
        Ok(Self {
            config,
            allocator,
            store,
            champ,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn champ(&self) -> &Champ {
        &self.champ
    }

    pub fn allocator(&self) -> &DataPathAllocator {
        &self.allocator
    }

    /// Runs one backup session over `io`.
    pub async fn serve_connection<T>(&self, io: T) -> Result<SessionSummary>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut link = framed(io);
        let options = SessionOptions::from_config(&self.config);
        let backups = self.config.backups_root();
        let dpth = self.allocator.session().await?;
        match &self.champ {
            Champ::Local(handle) => {
                Session::start(&backups, dpth, self.store.clone(), handle.clone(), options)
                    .await?
                    .run(&mut link)
                    .await
            }
            Champ::Remote(addr) => {
                let remote = RemoteChamp::connect(*addr).await?;
                Session::start(&backups, dpth, self.store.clone(), remote, options)
                    .await?
                    .run(&mut link)
                    .await
            }
        }
    }

    /// Accepts backup clients until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr()?, pool = ?self.config.pool, "accepting backups");
        loop {
            let (stream, peer) = listener.accept().await?;
            if let Err(err) = stream.set_nodelay(true) {
                warn!(%peer, %err, "could not disable nagle");
            }
            let server = Arc::clone(&self);
            let span = tracing::info_span!("client", %peer);
            tokio::spawn(
                async move {
                    if let Err(err) = server.serve_connection(stream).await {
                        if err.is_fatal() {
                            error!(%err, "backup failed");
                        } else {
                            warn!(%err, "backup failed");
                        }
                    }
                }
                .instrument(span),
            );
        }
    }
}

/// Loads the sparse index and starts the champion chooser task.
pub async fn open_champ(config: &Config) -> Result<ChampHandle> {
    tokio::fs::create_dir_all(&config.pool).await?;
    let deduper = Deduper::open(&config.pool, config.sparse_path(), &config.champ).await?;
    Ok(service::spawn(deduper))
}
