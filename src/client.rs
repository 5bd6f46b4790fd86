//! The client end of a backup: sends signatures and answers data requests.

use std::collections::BTreeMap;
use std::pin::pin;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::block::Signature;
use crate::chunker::{chunk_stream, ChunkingStrategy};
use crate::error::{Error, Result};
use crate::protocol::{
    BackupSummary, BlockData, ClientMessage, FileStart, Frame, FrameCodec, Message, ServerMessage,
};
use crate::transport::framed;

/// A file cut into signed blocks.
#[derive(Debug, Clone)]
pub struct ClientFile {
    pub path: String,
    pub blocks: Vec<(Signature, Vec<u8>)>,
}

impl ClientFile {
    pub async fn chunk(path: impl Into<String>, data: &[u8], strategy: ChunkingStrategy) -> Result<Self> {
        let blocks = pin!(chunk_stream(strategy, data)).try_collect().await?;
        Ok(Self {
            path: path.into(),
            blocks,
        })
    }

    pub fn len(&self) -> u64 {
        self.blocks.iter().map(|(sig, _)| u64::from(sig.length)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub summary: BackupSummary,
    /// Block indices the server asked for, in the order it asked.
    pub requested: Vec<u64>,
    pub forgotten: Option<u64>,
}

/// Backs up `files` over `io` and waits for the server's verdict.
///
/// Outgoing frames go through their own task, so answering a data request
/// never waits for the signatures still queued in front of it.
pub async fn run_backup<T>(io: T, files: Vec<ClientFile>) -> Result<BackupReport>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut frames) = framed(io).split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(forward(rx, sink));

    let send = |message: ClientMessage| tx.send(message).map_err(|_| Error::ServiceGone);
    let mut blocks = BTreeMap::new();
    let mut index = 0u64;
    for (file_index, file) in files.into_iter().enumerate() {
        send(ClientMessage::AttribsSigs(FileStart {
            file_index: file_index as u64,
            path: file.path,
        }))?;
        for (sig, data) in file.blocks {
            send(ClientMessage::Sig(sig))?;
            blocks.insert(index, data);
            index += 1;
        }
    }
    send(ClientMessage::SigsEnd)?;

    let mut report = BackupReport::default();
    let outcome = loop {
        let Some(frame) = frames.next().await else {
            break Err(Error::protocol("server hung up before confirming the backup"));
        };
        match ServerMessage::from_frame(frame?)? {
            ServerMessage::DataReq(index) => {
                let data = blocks.remove(&index).ok_or_else(|| {
                    Error::protocol(format!("server requested unknown block {index}"))
                })?;
                report.requested.push(index);
                send(ClientMessage::Data(BlockData { index, data }))?;
            }
            ServerMessage::Forget(index) => {
                blocks = blocks.split_off(&(index + 1));
                report.forgotten = Some(index);
            }
            ServerMessage::BackupEnd(summary) => {
                report.summary = summary;
                break Ok(report);
            }
            ServerMessage::Error(reason) => break Err(Error::Protocol(reason)),
        }
    };

    drop(tx);
    // the server has already answered, a failing writer changes nothing
    if let Ok(Err(err)) = writer.await {
        debug!(%err, "backup writer stopped with an error");
    }
    outcome
}

async fn forward<T>(
    mut rx: mpsc::UnboundedReceiver<ClientMessage>,
    mut sink: SplitSink<Framed<T, FrameCodec>, Frame>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        sink.feed(message.to_frame()?).await?;
        if rx.is_empty() {
            sink.flush().await?;
        }
    }
    sink.close().await
}
