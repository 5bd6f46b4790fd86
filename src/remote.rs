//! The champion chooser over the network.
//!
//! A session streams `Sig` frames and closes each batch with `WrapUp`. The
//! service answers with a `Sig` frame for every block it already stores and
//! then echoes the `WrapUp`; anything not answered is new.

use std::net::SocketAddr;
use std::path::Path;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::ChampConfig;
use crate::dpth::Location;
use crate::error::{Error, Result};
use crate::protocol::{ChampReply, ChampRequest, FoundSig, FrameCodec, IndexedSig, Message};
use crate::service::{Batch, ChampHandle, Deduplicator};
use crate::transport::framed;

/// Accepts champion chooser clients until the listener fails.
pub async fn serve_champ(listener: TcpListener, handle: ChampHandle, config: ChampConfig) -> Result<()> {
    info!(addr = ?listener.local_addr()?, "serving champion chooser");
    loop {
        let (stream, peer) = listener.accept().await?;
        let handle = handle.clone();
        let config = config.clone();
        tokio::spawn(async move {
            debug!(%peer, "champ client connected");
            if let Err(err) = handle_champ_client(stream, handle, &config).await {
                warn!(%peer, %err, "champ client failed");
            }
        });
    }
}

/// Serves one session's requests until it disconnects.
pub async fn handle_champ_client<T>(io: T, mut handle: ChampHandle, config: &ChampConfig) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = framed(io);
    let mut batch = Batch::new(config.hook_policy(), config.window_hooks);
    let mut indices = Vec::new();

    while let Some(frame) = framed.next().await {
        match ChampRequest::from_frame(frame?)? {
            ChampRequest::Sig(IndexedSig { index, sig }) => {
                batch.push(sig);
                indices.push(index);
            }
            ChampRequest::WrapUp(upto) => {
                let verdicts = handle.classify(batch.take()).await?;
                for (index, verdict) in indices.drain(..).zip(verdicts) {
                    if let Some(location) = verdict {
                        let found = ChampReply::Sig(FoundSig { index, location });
                        framed.feed(found.to_frame()?).await?;
                    }
                }
                framed.send(ChampReply::WrapUp(upto).to_frame()?).await?;
            }
            ChampRequest::Manifest(path) => {
                let reply = match handle.register_manifest(Path::new(&path)).await {
                    Ok(()) => ChampReply::Manifest(path),
                    Err(err) => {
                        warn!(%path, %err, "failed to register manifest");
                        ChampReply::Error(err.to_string())
                    }
                };
                framed.send(reply.to_frame()?).await?;
            }
        }
    }
    Ok(())
}

/// A [`Deduplicator`] living in another process.
pub struct RemoteChamp<T> {
    framed: Framed<T, FrameCodec>,
}

impl RemoteChamp<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<T> RemoteChamp<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: T) -> Self {
        Self { framed: framed(io) }
    }

    async fn recv(&mut self) -> Result<ChampReply> {
        match self.framed.next().await {
            Some(frame) => ChampReply::from_frame(frame?),
            None => Err(Error::ServiceGone),
        }
    }
}

#[async_trait::async_trait]
impl<T> Deduplicator for RemoteChamp<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn classify(&mut self, batch: Batch) -> Result<Vec<Option<Location>>> {
        let count = batch.sigs.len();
        for (index, sig) in batch.sigs.into_iter().enumerate() {
            let request = ChampRequest::Sig(IndexedSig {
                index: index as u64,
                sig,
            });
            self.framed.feed(request.to_frame()?).await?;
        }
        let upto = count as u64;
        self.framed
            .send(ChampRequest::WrapUp(upto).to_frame()?)
            .await?;

        let mut verdicts = vec![None; count];
        loop {
            match self.recv().await? {
                ChampReply::Sig(FoundSig { index, location }) => {
                    let slot = verdicts.get_mut(index as usize).ok_or_else(|| {
                        Error::protocol(format!("champ answered for unknown block {index}"))
                    })?;
                    *slot = Some(location);
                }
                ChampReply::WrapUp(index) if index == upto => return Ok(verdicts),
                ChampReply::Error(reason) => return Err(Error::Protocol(reason)),
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected champ reply {other:?} while classifying"
                    )))
                }
            }
        }
    }

    async fn register_manifest(&mut self, manifest: &Path) -> Result<()> {
        let path = manifest
            .to_str()
            .ok_or_else(|| Error::protocol(format!("manifest path {manifest:?} is not UTF-8")))?
            .to_owned();
        self.framed
            .send(ChampRequest::Manifest(path.clone()).to_frame()?)
            .await?;
        match self.recv().await? {
            ChampReply::Manifest(echo) if echo == path => Ok(()),
            ChampReply::Error(reason) => Err(Error::Protocol(reason)),
            other => Err(Error::protocol(format!(
                "unexpected champ reply {other:?} while registering"
            ))),
        }
    }
}
