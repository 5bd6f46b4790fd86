//! One backup session: from signatures to a finished, indexed manifest.
//!
//! Blocks live in an arena from the moment their signature arrives until their
//! manifest entry is flushed. Signatures are gathered into a [`Batch`] that is
//! classified whenever the window fills, too many blocks are pending, or the
//! client says it has sent everything. New blocks get a location and a
//! `DataReq`; once their data is written they become flushable like any block
//! that was already stored.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::block::{Block, BlockState, Signature, StrongHash};
use crate::blockstore::BlockStore;
use crate::config::Config;
use crate::dpth::{Dpth, Location};
use crate::error::{Error, Result};
use crate::hashstore::HashStore;
use crate::manifest::{ManifestEntry, ManifestWriter, MANIFEST_NAME};
use crate::protocol::{BackupSummary, BlockData, ClientMessage, FileStart, ServerMessage};
use crate::service::{Batch, Deduplicator};
use crate::sparse::HookPolicy;
use crate::transport::ClientLink;

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub hook_policy: HookPolicy,
    pub window_hooks: u16,
    pub max_pending_blocks: usize,
    pub forget_threshold: usize,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hook_policy: config.champ.hook_policy(),
            window_hooks: config.champ.window_hooks,
            max_pending_blocks: config.champ.max_pending_blocks,
            forget_threshold: config.session.forget_threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: Uuid,
    pub manifest: PathBuf,
    pub backup: BackupSummary,
}

pub struct Session<D> {
    id: Uuid,
    options: SessionOptions,
    champ: D,
    dpth: Dpth,
    store: Arc<dyn BlockStore>,
    work_dir: PathBuf,
    final_dir: PathBuf,
    manifest: Option<ManifestWriter>,

    /// Blocks not yet flushed; the front one has index `flushed`.
    arena: VecDeque<Block>,
    flushed: u64,
    next_index: u64,
    /// File starts waiting for their first block to be flushed.
    files: VecDeque<(u64, FileStart)>,
    batch: Batch,
    /// Blocks allocated by this session, so repeats within one backup are
    /// stored once.
    fresh: HashStore,
    /// Every location this session has written to.
    written: Vec<Location>,
    got_run: usize,
    sigs_done: bool,
    outbox: VecDeque<ServerMessage>,
    summary: BackupSummary,
}

impl<D: Deduplicator> Session<D> {
    /// Creates the working directory and the manifest for a new backup under
    /// `backups_root`.
    pub async fn start(
        backups_root: &Path,
        dpth: Dpth,
        store: Arc<dyn BlockStore>,
        champ: D,
        options: SessionOptions,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let work_dir = backups_root.join(format!("{id}.partial"));
        let final_dir = backups_root.join(id.to_string());
        tokio::fs::create_dir_all(&work_dir).await?;
        let manifest = ManifestWriter::create(work_dir.join(MANIFEST_NAME)).await?;
        info!(session = %id, dir = ?work_dir, "session started");

        Ok(Self {
            id,
            options,
            champ,
            dpth,
            store,
            work_dir,
            final_dir,
            manifest: Some(manifest),
            arena: VecDeque::new(),
            flushed: 0,
            next_index: 0,
            files: VecDeque::new(),
            batch: Batch::new(options.hook_policy, options.window_hooks),
            fresh: HashStore::new(),
            written: Vec::new(),
            got_run: 0,
            sigs_done: false,
            outbox: VecDeque::new(),
            summary: BackupSummary::default(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drives the session to completion over `link`.
    ///
    /// On failure the session is aborted, the client gets an `Error` frame and
    /// the error is returned.
    pub async fn run<L: ClientLink>(mut self, link: &mut L) -> Result<SessionSummary> {
        let sealed = match self.drive(link).await {
            Ok(()) => self.seal().await,
            Err(err) => Err(err),
        };
        match sealed {
            Ok(manifest) => {
                let summary = self.complete(manifest).await;
                if let Err(err) = link.send(ServerMessage::BackupEnd(summary.backup.clone())).await {
                    warn!(session = %summary.id, %err, "could not confirm finished backup");
                }
                Ok(summary)
            }
            Err(err) => {
                self.abort(&err).await;
                if let Err(send_err) = link.send(ServerMessage::Error(err.to_string())).await {
                    debug!(session = %self.id, %send_err, "could not report abort");
                }
                Err(err)
            }
        }
    }

    async fn drive<L: ClientLink>(&mut self, link: &mut L) -> Result<()> {
        while !self.is_complete() {
            let Some(message) = link.recv().await? else {
                return Err(Error::protocol("client hung up before the backup was complete"));
            };
            self.handle(message).await?;
            while let Some(message) = self.outbox.pop_front() {
                link.send(message).await?;
            }
        }
        Ok(())
    }

    pub async fn handle(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::AttribsSigs(file) => self.on_file_start(file),
            ClientMessage::Sig(sig) => self.on_sig(sig).await,
            ClientMessage::SigsEnd => self.on_sigs_end().await,
            ClientMessage::Data(data) => self.on_data(data).await,
            ClientMessage::BackupEnd => Err(Error::protocol("client cancelled the backup")),
        }
    }

    /// Messages for the client produced since the last call.
    pub fn drain_outbox(&mut self) -> impl Iterator<Item = ServerMessage> + '_ {
        self.outbox.drain(..)
    }

    /// Every signature has arrived and every block has been flushed.
    pub fn is_complete(&self) -> bool {
        self.sigs_done && self.arena.is_empty()
    }

    fn expect_sigs(&self) -> Result<()> {
        if self.sigs_done {
            return Err(Error::protocol("signature after the end of signatures"));
        }
        Ok(())
    }

    fn on_file_start(&mut self, file: FileStart) -> Result<()> {
        self.expect_sigs()?;
        self.files.push_back((self.next_index, file));
        Ok(())
    }

    async fn on_sig(&mut self, sig: Signature) -> Result<()> {
        self.expect_sigs()?;
        self.arena.push_back(Block::new(self.next_index, sig));
        self.next_index += 1;
        self.batch.push(sig);
        if self.batch.is_full(self.options.max_pending_blocks) {
            self.classify().await?;
        }
        Ok(())
    }

    async fn on_sigs_end(&mut self) -> Result<()> {
        self.expect_sigs()?;
        self.sigs_done = true;
        self.classify().await?;
        self.flush().await
    }

    /// Decides every block of the current batch. An empty batch is a no-op.
    pub async fn classify(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = self.batch.take();
        let first = self.next_index - batch.len() as u64;
        let hooks = batch.window.len();
        let verdicts = self.champ.classify(batch).await?;

        let (mut got, mut not_got) = (0, 0);
        for (offset, verdict) in verdicts.into_iter().enumerate() {
            let index = first + offset as u64;
            let position = (index - self.flushed) as usize;
            let sig = self.arena[position].sig;
            debug_assert_eq!(self.arena[position].state, BlockState::Incoming);

            let found = if sig.is_empty_block() {
                Some(None)
            } else {
                verdict
                    .or_else(|| self.fresh.lookup(sig.fingerprint, &sig.strong))
                    .map(Some)
            };

            let block = &mut self.arena[position];
            match found {
                Some(location) => {
                    block.state = BlockState::Got;
                    block.location = location;
                    got += 1;
                    self.got_run += 1;
                    if self.got_run >= self.options.forget_threshold {
                        self.outbox.push_back(ServerMessage::Forget(index));
                        self.got_run = 0;
                    }
                }
                None => {
                    let location = self.dpth.allocate().await?;
                    block.state = BlockState::NotGot;
                    block.location = Some(location);
                    block.requested = true;
                    self.fresh.insert(sig.fingerprint, sig.strong, location);
                    self.outbox.push_back(ServerMessage::DataReq(index));
                    debug!(session = %self.id, index, %location, "allocated block");
                    not_got += 1;
                    self.got_run = 0;
                }
            }
        }
        self.summary.got += got;
        self.summary.not_got += not_got;
        debug!(session = %self.id, first, hooks, got, not_got, "classified batch");
        self.flush().await
    }

    async fn on_data(&mut self, BlockData { index, data }: BlockData) -> Result<()> {
        let position = index
            .checked_sub(self.flushed)
            .map(|position| position as usize)
            .filter(|position| *position < self.arena.len())
            .ok_or_else(|| Error::protocol(format!("data for unknown block {index}")))?;
        let block = &self.arena[position];
        let location = match (block.state, block.location) {
            (BlockState::NotGot, Some(location)) if block.requested && !block.written => location,
            _ => {
                return Err(Error::protocol(format!(
                    "data for block {index} which was not requested"
                )))
            }
        };
        if data.len() as u64 != u64::from(block.sig.length) || StrongHash::of(&data) != block.sig.strong {
            return Err(Error::protocol(format!(
                "data for block {index} does not match its signature"
            )));
        }

        self.written.push(location);
        let stored = self
            .store
            .store_block(location, &data)
            .await
            .map_err(|source| Error::BlockWrite {
                index,
                location,
                source,
            })?;
        self.dpth.release(location);
        self.arena[position].written = true;
        self.summary.bytes_written += stored;
        self.flush().await
    }

    fn manifest(&mut self) -> Result<&mut ManifestWriter> {
        self.manifest
            .as_mut()
            .ok_or_else(|| Error::protocol("backup manifest already finished"))
    }

    /// Writes manifest entries for every complete block at the front of the
    /// arena, each preceded by the files starting at it.
    async fn flush(&mut self) -> Result<()> {
        loop {
            // a file may start once every block before it is written
            while self
                .files
                .front()
                .is_some_and(|(first, _)| *first <= self.flushed)
            {
                let Some((_, FileStart { file_index, path })) = self.files.pop_front() else {
                    break;
                };
                self.manifest()?
                    .write(&ManifestEntry::File { file_index, path })
                    .await?;
            }
            let Some(block) = self.arena.front() else {
                return Ok(());
            };
            if !block.is_complete() {
                return Ok(());
            }
            let entry = ManifestEntry::Block {
                sig: block.sig,
                location: block.location,
            };
            self.manifest()?.write(&entry).await?;
            self.arena.pop_front();
            self.flushed += 1;
            self.summary.blocks += 1;
        }
    }

    /// Finishes the manifest and moves the backup to its final directory.
    async fn seal(&mut self) -> Result<PathBuf> {
        self.flush().await?;
        if let Some(manifest) = self.manifest.take() {
            manifest.finish().await?;
        }
        tokio::fs::rename(&self.work_dir, &self.final_dir).await?;
        Ok(self.final_dir.join(MANIFEST_NAME))
    }

    /// Checks the reservations and makes the backup a dedup candidate.
    async fn complete(mut self, manifest: PathBuf) -> SessionSummary {
        if let Err(err) = self.champ.register_manifest(&manifest).await {
            // the backup itself is safe, later sessions just won't match against it
            warn!(session = %self.id, %err, ?manifest, "backup finished but was not indexed");
        }
        let Self {
            id, dpth, summary, ..
        } = self;
        dpth.finish(None);
        info!(
            session = %id,
            blocks = summary.blocks,
            got = summary.got,
            not_got = summary.not_got,
            bytes_written = summary.bytes_written,
            "session finished"
        );
        SessionSummary {
            id,
            manifest,
            backup: summary,
        }
    }

    /// Throws away everything this session produced.
    pub async fn abort(&mut self, reason: &Error) {
        warn!(
            session = %self.id,
            %reason,
            held = self.dpth.held(),
            written = self.written.len(),
            "aborting session"
        );
        self.dpth.abort();
        for location in self.written.drain(..) {
            if let Err(err) = self.store.delete_block(location).await {
                warn!(session = %self.id, %location, %err, "could not remove block data");
            }
        }
        self.manifest = None;
        match tokio::fs::remove_dir_all(&self.work_dir).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                warn!(session = %self.id, dir = ?self.work_dir, %err, "could not remove working directory");
            }
            _ => {}
        }
    }
}
