//! The sparse similarity index: sampled fingerprints ("hooks") of every
//! candidate backup, and its on-disk form.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::pin;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::manifest::{self, ManifestEntry};
use crate::records::{open_gzip, records, GzipRecordWriter, Record};
use crate::scorer::CandidateId;

const CMD_MANIFEST: u8 = b'M';
const CMD_HOOK: u8 = b'F';
const CMD_END: u8 = b'E';

/// Decides which fingerprints are sampled into the sparse index.
///
/// A fingerprint is a hook when its top `bits` bits are all set, so on
/// average one block in `2^bits` is sampled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HookPolicy {
    pub bits: u8,
}

impl Default for HookPolicy {
    fn default() -> Self {
        Self { bits: 4 }
    }
}

impl HookPolicy {
    pub fn is_hook(&self, fingerprint: u64) -> bool {
        match self.bits {
            0 => true,
            bits @ 1..=63 => fingerprint >> (64 - u32::from(bits)) == (1u64 << bits) - 1,
            _ => fingerprint == u64::MAX,
        }
    }
}

/// Hook fingerprint to the candidates containing it.
#[derive(Debug, Default)]
pub struct SparseIndex {
    hooks: HashMap<u64, Vec<CandidateId>>,
}

impl SparseIndex {
    pub fn insert(&mut self, hook: u64, candidate: CandidateId) {
        let candidates = self.hooks.entry(hook).or_default();
        if candidates.last() != Some(&candidate) {
            candidates.push(candidate);
        }
    }

    pub fn get(&self, hook: u64) -> Option<&[CandidateId]> {
        self.hooks.get(&hook).map(Vec::as_slice)
    }

    /// Number of distinct hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// One candidate as stored in a sparse index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseEntry {
    pub manifest: PathBuf,
    pub hooks: BTreeSet<u64>,
}

/// Samples the hooks of a finished backup from its manifest.
pub async fn hooks_of(manifest: &Path, policy: HookPolicy) -> Result<BTreeSet<u64>> {
    let mut entries = pin!(manifest::entries(manifest).await?);
    let mut hooks = BTreeSet::new();
    while let Some(entry) = entries.next().await {
        if let ManifestEntry::Block { sig, .. } = entry? {
            if policy.is_hook(sig.fingerprint) {
                hooks.insert(sig.fingerprint);
            }
        }
    }
    Ok(hooks)
}

/// Reads a sparse index file. A missing file is an empty index.
///
/// Every update ends with an end record. A torn trailing update, or anything
/// unreadable after the last complete one, is skipped with a warning.
pub async fn read_sparse_file(path: &Path) -> Result<Vec<SparseEntry>> {
    Ok(read_entries(path).await?.0)
}

/// Reads a sparse index file and rewrites it without a torn tail, so later
/// appends stay readable.
pub async fn repair_sparse_file(path: &Path) -> Result<Vec<SparseEntry>> {
    let (entries, torn) = read_entries(path).await?;
    if torn {
        let tmp = path.with_extension("tmp");
        let mut writer = GzipRecordWriter::create(&tmp).await?;
        for entry in &entries {
            write_entry(&mut writer, entry).await?;
        }
        writer.finish().await?;
        tokio::fs::rename(&tmp, path).await?;
        info!(path = ?path, candidates = entries.len(), "rewrote sparse index without its torn tail");
    }
    Ok(entries)
}

async fn read_entries(path: &Path) -> Result<(Vec<SparseEntry>, bool)> {
    if !tokio::fs::try_exists(path).await? {
        return Ok((vec![], false));
    }
    let mut records = pin!(records(open_gzip(path).await?));
    let mut entries = vec![];
    let mut pending: Vec<SparseEntry> = vec![];
    while let Some(record) = records.next().await {
        match record.and_then(|record| apply_record(&mut pending, &record)) {
            Ok(true) => entries.append(&mut pending),
            Ok(false) => {}
            Err(err) => {
                warn!(path = ?path, %err, discarded = pending.len(), "sparse index ends in a torn update");
                return Ok((entries, true));
            }
        }
    }
    if !pending.is_empty() {
        warn!(path = ?path, discarded = pending.len(), "sparse index ends in an unfinished update");
        return Ok((entries, true));
    }
    Ok((entries, false))
}

/// Applies one record to the entries of the update being read. Returns
/// whether the record closed the update.
fn apply_record(pending: &mut Vec<SparseEntry>, record: &Record) -> Result<bool> {
    match record.cmd {
        CMD_MANIFEST => pending.push(SparseEntry {
            manifest: PathBuf::from(record.text()?),
            hooks: BTreeSet::new(),
        }),
        CMD_HOOK => {
            let text = record.text()?;
            let hook = (text.len() == 16)
                .then(|| u64::from_str_radix(text, 16).ok())
                .flatten()
                .ok_or_else(|| Error::record(format!("bad hook {text:?}")))?;
            let entry = pending
                .last_mut()
                .ok_or_else(|| Error::record("hook before any manifest"))?;
            entry.hooks.insert(hook);
        }
        CMD_END => return Ok(true),
        cmd => {
            return Err(Error::record(format!(
                "unexpected sparse record {:?}",
                cmd as char
            )))
        }
    }
    Ok(false)
}

async fn write_entry(writer: &mut GzipRecordWriter, entry: &SparseEntry) -> Result<()> {
    let manifest = entry
        .manifest
        .to_str()
        .ok_or_else(|| Error::record(format!("manifest path {:?} is not utf-8", entry.manifest)))?;
    writer.write(CMD_MANIFEST, manifest.as_bytes()).await?;
    // BTreeSet iteration keeps the hooks sorted and unique.
    for hook in &entry.hooks {
        writer.write(CMD_HOOK, format!("{hook:016X}").as_bytes()).await?;
    }
    writer.write(CMD_END, b"").await
}

/// Appends a candidate to a sparse index file as a new gzip member.
///
/// A failed append truncates the file back to where it started.
pub async fn append_sparse_file(path: &Path, entry: &SparseEntry) -> Result<()> {
    let start = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
        Err(err) => return Err(err.into()),
    };
    let result = async {
        let mut writer = GzipRecordWriter::append(path).await?;
        write_entry(&mut writer, entry).await?;
        writer.finish().await
    }
    .await;
    if result.is_err() {
        let truncated = async {
            let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
            file.set_len(start).await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = truncated {
            warn!(path = ?path, %err, "could not roll back a failed sparse index append");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Signature;
    use crate::dpth::Location;
    use crate::manifest::ManifestWriter;
    use crate::records::MAX_RECORD_LEN;

    #[test]
    fn hook_sampling() {
        let policy = HookPolicy { bits: 4 };
        assert!(policy.is_hook(0xF000_0000_0000_0000));
        assert!(policy.is_hook(0xFFFF_FFFF_FFFF_FFFF));
        assert!(!policy.is_hook(0xE000_0000_0000_0000));
        assert!(!policy.is_hook(0x0FFF_FFFF_FFFF_FFFF));

        assert!(HookPolicy { bits: 0 }.is_hook(0));
        assert!(HookPolicy { bits: 64 }.is_hook(u64::MAX));
        assert!(!HookPolicy { bits: 64 }.is_hook(u64::MAX - 1));
    }

    #[test]
    fn index_keeps_one_entry_per_candidate() {
        let mut index = SparseIndex::default();
        index.insert(1, CandidateId(0));
        index.insert(1, CandidateId(0));
        index.insert(1, CandidateId(1));
        index.insert(2, CandidateId(1));
        assert_eq!(index.get(1), Some(&[CandidateId(0), CandidateId(1)][..]));
        assert_eq!(index.get(3), None);
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn sparse_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.gz");
        assert!(read_sparse_file(&path).await.unwrap().is_empty());

        let first = SparseEntry {
            manifest: "backups/one/manifest.gz".into(),
            hooks: [0xF000_0000_0000_0001, 0xF100_0000_0000_0000].into(),
        };
        let second = SparseEntry {
            manifest: "backups/two/manifest.gz".into(),
            hooks: BTreeSet::new(),
        };
        append_sparse_file(&path, &first).await.unwrap();
        append_sparse_file(&path, &second).await.unwrap();

        let read = read_sparse_file(&path).await.unwrap();
        assert_eq!(read, vec![first, second]);
    }

    fn candidate(name: &str, hooks: &[u64]) -> SparseEntry {
        SparseEntry {
            manifest: format!("backups/{name}/manifest.gz").into(),
            hooks: hooks.iter().copied().collect(),
        }
    }

    async fn file_len(path: &Path) -> u64 {
        tokio::fs::metadata(path).await.unwrap().len()
    }

    #[tokio::test]
    async fn torn_update_is_dropped_and_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.gz");
        let first = candidate("one", &[0xF000_0000_0000_0001]);
        let second = candidate("two", &[0xF000_0000_0000_0002, 0xF000_0000_0000_0003]);

        append_sparse_file(&path, &first).await.unwrap();
        let intact = file_len(&path).await;
        append_sparse_file(&path, &second).await.unwrap();
        let full = file_len(&path).await;

        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(intact + (full - intact) / 2).unwrap();
        drop(file);

        assert_eq!(read_sparse_file(&path).await.unwrap(), vec![first.clone()]);
        assert_eq!(repair_sparse_file(&path).await.unwrap(), vec![first.clone()]);

        let third = candidate("three", &[]);
        append_sparse_file(&path, &third).await.unwrap();
        assert_eq!(read_sparse_file(&path).await.unwrap(), vec![first, third]);
    }

    #[tokio::test]
    async fn failed_append_leaves_the_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse.gz");
        let first = candidate("one", &[0xF000_0000_0000_0001]);
        append_sparse_file(&path, &first).await.unwrap();
        let before = file_len(&path).await;

        let oversized = SparseEntry {
            manifest: "x".repeat(MAX_RECORD_LEN + 1).into(),
            hooks: BTreeSet::new(),
        };
        let err = append_sparse_file(&path, &oversized).await.unwrap_err();
        assert!(matches!(err, Error::Record(_)), "{err}");

        assert_eq!(file_len(&path).await, before);
        assert_eq!(read_sparse_file(&path).await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn hooks_are_sampled_from_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.gz");
        let mut writer = ManifestWriter::create(&path).await.unwrap();
        for (i, fingerprint) in [0xF000_0000_0000_0002u64, 0x1234, 0xF000_0000_0000_0002, 0xFF00_0000_0000_0000]
            .into_iter()
            .enumerate()
        {
            let entry = ManifestEntry::Block {
                sig: Signature::of(fingerprint, format!("{i}").as_bytes()),
                location: Some(Location::new(0, 0, i as u16)),
            };
            writer.write(&entry).await.unwrap();
        }
        writer.finish().await.unwrap();

        let hooks = hooks_of(&path, HookPolicy::default()).await.unwrap();
        assert_eq!(
            hooks.into_iter().collect::<Vec<_>>(),
            [0xF000_0000_0000_0002, 0xFF00_0000_0000_0000]
        );
    }
}
