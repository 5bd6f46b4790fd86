//! The champion chooser as a service.
//!
//! The sparse index, the score table and the hash store are process-wide
//! state, so exactly one [`Deduper`] owns them. Sessions reach it through the
//! [`Deduplicator`] trait: either in-process via a [`ChampHandle`] talking to
//! the task that owns the deduper, or over the network via
//! [`crate::remote::RemoteChamp`].

use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::block::Signature;
use crate::config::ChampConfig;
use crate::dpth::Location;
use crate::error::{Error, Result};
use crate::hashstore::{HashStore, Probe};
use crate::scorer::{CandidateId, ChampChooser, IncomingWindow};
use crate::sparse::{append_sparse_file, hooks_of, repair_sparse_file, HookPolicy, SparseEntry};

/// Signatures collected for one scoring pass, with the hooks among them.
#[derive(Debug, Clone)]
pub struct Batch {
    pub window: IncomingWindow,
    pub sigs: Vec<Signature>,
    policy: HookPolicy,
}

impl Batch {
    pub fn new(policy: HookPolicy, window_hooks: u16) -> Self {
        Self {
            window: IncomingWindow::new(window_hooks),
            sigs: Vec::new(),
            policy,
        }
    }

    pub fn push(&mut self, sig: Signature) {
        if self.policy.is_hook(sig.fingerprint) {
            self.window.push(sig.fingerprint);
        }
        self.sigs.push(sig);
    }

    /// Whether a pass should run before more signatures are added.
    pub fn is_full(&self, max_pending_blocks: usize) -> bool {
        self.window.is_full() || self.sigs.len() >= max_pending_blocks
    }

    pub fn len(&self) -> usize {
        self.sigs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sigs.is_empty()
    }

    /// Hands out the collected batch and starts an empty one.
    pub fn take(&mut self) -> Self {
        let fresh = Self::new(self.policy, self.window.capacity());
        std::mem::replace(self, fresh)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DedupStats {
    pub passes: u64,
    pub champions_loaded: u64,
    pub load_failures: u64,
    pub hits: u64,
    pub collisions: u64,
    pub misses: u64,
}

#[async_trait::async_trait]
pub trait Deduplicator: Send {
    /// Runs a scoring pass over the batch and looks up every signature in it.
    ///
    /// The result has one entry per signature: the location it is already
    /// stored at, or `None` when it is new.
    async fn classify(&mut self, batch: Batch) -> Result<Vec<Option<Location>>>;

    /// Indexes a finished backup so later sessions can deduplicate against it.
    async fn register_manifest(&mut self, manifest: &Path) -> Result<()>;
}

/// Sole owner of the candidates, the sparse index and the hash store.
pub struct Deduper {
    pool: PathBuf,
    sparse_path: PathBuf,
    policy: HookPolicy,
    chooser: ChampChooser,
    store: HashStore,
    stats: DedupStats,
}

impl Deduper {
    /// Loads the candidates recorded in the sparse index file.
    ///
    /// Manifest paths in the file are relative to `pool` when they live in it.
    pub async fn open(
        pool: impl Into<PathBuf>,
        sparse_path: impl Into<PathBuf>,
        config: &ChampConfig,
    ) -> Result<Self> {
        let pool = pool.into();
        let sparse_path = sparse_path.into();
        let mut chooser = ChampChooser::new(config.champs_max);
        for entry in repair_sparse_file(&sparse_path).await? {
            chooser.add_candidate(entry.manifest, entry.hooks);
        }
        info!(
            candidates = chooser.candidates(),
            hooks = chooser.hooks(),
            sparse = ?sparse_path,
            "loaded sparse index"
        );
        Ok(Self {
            pool,
            sparse_path,
            policy: config.hook_policy(),
            chooser,
            store: HashStore::new(),
            stats: DedupStats::default(),
        })
    }

    pub fn chooser(&self) -> &ChampChooser {
        &self.chooser
    }

    pub fn stats(&self) -> DedupStats {
        self.stats
    }

    pub fn policy(&self) -> HookPolicy {
        self.policy
    }

    fn resolve(&self, manifest: &Path) -> PathBuf {
        self.pool.join(manifest)
    }

    pub async fn classify(&mut self, batch: Batch) -> Vec<Option<Location>> {
        let Batch {
            mut window, sigs, ..
        } = batch;
        self.stats.passes += 1;

        let champions = self.chooser.choose_champions(&mut window);
        self.store.clear();
        for champion in champions {
            let path = self.resolve(self.chooser.candidate(champion).manifest());
            match self.store.load(&path).await {
                Ok(inserted) => {
                    self.stats.champions_loaded += 1;
                    debug!(candidate = champion.0, inserted, "loaded champion");
                }
                Err(source) => {
                    self.stats.load_failures += 1;
                    let err = Error::CandidateLoad {
                        path,
                        source: Box::new(source),
                    };
                    warn!(%err, "abandoning champion");
                }
            }
        }

        let verdicts: Vec<_> = sigs
            .iter()
            .map(|sig| match self.store.probe(sig.fingerprint, &sig.strong) {
                Probe::Hit(location) => {
                    self.stats.hits += 1;
                    Some(location)
                }
                Probe::Collision => {
                    self.stats.collisions += 1;
                    info!(
                        fingerprint = format_args!("{:016X}", sig.fingerprint),
                        strong = %sig.strong,
                        "weak hash collision, treating block as new"
                    );
                    None
                }
                Probe::Miss => {
                    self.stats.misses += 1;
                    None
                }
            })
            .collect();
        debug!(
            blocks = sigs.len(),
            hooks = window.len(),
            store = self.store.len(),
            "classified window"
        );
        verdicts
    }

    /// Registers a finished backup as a new candidate.
    ///
    /// The sparse index file is amended before the in-memory index, so a
    /// crash never leaves a candidate that was scored but not persisted.
    pub async fn add_fresh_candidate(&mut self, manifest: &Path) -> Result<CandidateId> {
        let hooks = hooks_of(&self.resolve(manifest), self.policy).await?;
        let manifest = manifest
            .strip_prefix(&self.pool)
            .unwrap_or(manifest)
            .to_path_buf();
        let entry = SparseEntry {
            manifest: manifest.clone(),
            hooks,
        };
        append_sparse_file(&self.sparse_path, &entry).await?;

        let hooks = entry.hooks.len();
        let id = self.chooser.add_candidate(entry.manifest, entry.hooks);
        info!(candidate = id.0, ?manifest, hooks, "added fresh candidate");
        Ok(id)
    }
}

#[async_trait::async_trait]
impl Deduplicator for Deduper {
    async fn classify(&mut self, batch: Batch) -> Result<Vec<Option<Location>>> {
        Ok(Deduper::classify(self, batch).await)
    }

    async fn register_manifest(&mut self, manifest: &Path) -> Result<()> {
        self.add_fresh_candidate(manifest).await.map(|_| ())
    }
}

enum Command {
    Classify {
        batch: Batch,
        reply: oneshot::Sender<Vec<Option<Location>>>,
    },
    Register {
        manifest: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<DedupStats>,
    },
}

/// A cheap, cloneable way into the task owning the [`Deduper`].
#[derive(Clone)]
pub struct ChampHandle {
    tx: mpsc::Sender<Command>,
}

/// Moves the deduper into its own task. Commands are served one at a time,
/// so a scoring pass never interleaves with another.
pub fn spawn(mut deduper: Deduper) -> ChampHandle {
    let (tx, mut rx) = mpsc::channel(64);
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Classify { batch, reply } => {
                    let _ = reply.send(deduper.classify(batch).await);
                }
                Command::Register { manifest, reply } => {
                    let result = deduper.add_fresh_candidate(&manifest).await.map(|_| ());
                    let _ = reply.send(result);
                }
                Command::Stats { reply } => {
                    let _ = reply.send(deduper.stats());
                }
            }
        }
        info!("champion chooser stopped");
    });
    ChampHandle { tx }
}

impl ChampHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| Error::ServiceGone)?;
        rx.await.map_err(|_| Error::ServiceGone)
    }

    pub async fn stats(&self) -> Result<DedupStats> {
        self.request(|reply| Command::Stats { reply }).await
    }
}

#[async_trait::async_trait]
impl Deduplicator for ChampHandle {
    async fn classify(&mut self, batch: Batch) -> Result<Vec<Option<Location>>> {
        self.request(|reply| Command::Classify { batch, reply }).await
    }

    async fn register_manifest(&mut self, manifest: &Path) -> Result<()> {
        let manifest = manifest.to_path_buf();
        self.request(|reply| Command::Register { manifest, reply })
            .await?
    }
}
