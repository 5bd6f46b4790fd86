use std::collections::HashMap;
use std::path::Path;
use std::pin::pin;

use futures_util::StreamExt;

use crate::block::StrongHash;
use crate::dpth::Location;
use crate::error::Result;
use crate::manifest::{self, ManifestEntry};

/// The outcome of looking up a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Hit(Location),
    /// The weak hash is known but none of its strong hashes match.
    Collision,
    Miss,
}

/// Exact-match index from weak fingerprint to the strong hashes stored for it.
#[derive(Debug, Default)]
pub struct HashStore {
    entries: HashMap<u64, Vec<(StrongHash, Location)>>,
    len: usize,
}

impl HashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a block location. An existing entry for the same content wins.
    pub fn insert(&mut self, fingerprint: u64, strong: StrongHash, location: Location) -> bool {
        let strongs = self.entries.entry(fingerprint).or_default();
        if strongs.iter().any(|(existing, _)| *existing == strong) {
            return false;
        }
        strongs.push((strong, location));
        self.len += 1;
        true
    }

    pub fn probe(&self, fingerprint: u64, strong: &StrongHash) -> Probe {
        let Some(strongs) = self.entries.get(&fingerprint) else {
            return Probe::Miss;
        };
        strongs
            .iter()
            .find(|(existing, _)| existing == strong)
            .map_or(Probe::Collision, |(_, location)| Probe::Hit(*location))
    }

    pub fn lookup(&self, fingerprint: u64, strong: &StrongHash) -> Option<Location> {
        match self.probe(fingerprint, strong) {
            Probe::Hit(location) => Some(location),
            Probe::Collision | Probe::Miss => None,
        }
    }

    /// Streams every stored block of a candidate manifest into the store.
    ///
    /// Returns the number of new entries.
    pub async fn load(&mut self, manifest: &Path) -> Result<usize> {
        let mut entries = pin!(manifest::entries(manifest).await?);
        let mut inserted = 0;
        while let Some(entry) = entries.next().await {
            if let ManifestEntry::Block {
                sig,
                location: Some(location),
            } = entry?
            {
                if self.insert(sig.fingerprint, sig.strong, location) {
                    inserted += 1;
                }
            }
        }
        Ok(inserted)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Signature;
    use crate::manifest::ManifestWriter;

    #[test]
    fn lookup_returns_inserted_location() {
        let mut store = HashStore::new();
        let blocks: Vec<_> = (0..100u16)
            .map(|i| {
                let data = format!("block number {i}");
                (Signature::of(u64::from(i) % 7, data.as_bytes()), Location::new(0, 0, i))
            })
            .collect();
        for (sig, location) in &blocks {
            assert!(store.insert(sig.fingerprint, sig.strong, *location));
        }
        assert_eq!(store.len(), 100);

        for (sig, location) in &blocks {
            assert_eq!(store.lookup(sig.fingerprint, &sig.strong), Some(*location));
        }
    }

    #[test]
    fn collisions_are_not_found() {
        let mut store = HashStore::new();
        let stored = StrongHash::of(b"stored");
        let other = StrongHash::of(b"other");
        store.insert(42, stored, Location::new(1, 2, 3));

        assert_eq!(store.probe(42, &other), Probe::Collision);
        assert_eq!(store.lookup(42, &other), None);
        assert_eq!(store.probe(43, &stored), Probe::Miss);
        assert_eq!(store.probe(42, &stored), Probe::Hit(Location::new(1, 2, 3)));
    }

    #[test]
    fn earlier_entries_win() {
        let mut store = HashStore::new();
        let strong = StrongHash::of(b"same");
        assert!(store.insert(1, strong, Location::new(0, 0, 1)));
        assert!(!store.insert(1, strong, Location::new(0, 0, 2)));
        assert_eq!(store.lookup(1, &strong), Some(Location::new(0, 0, 1)));
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.probe(1, &strong), Probe::Miss);
    }

    #[tokio::test]
    async fn loads_manifest_locations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.gz");
        let mut writer = ManifestWriter::create(&path).await.unwrap();
        writer
            .write(&ManifestEntry::File {
                file_index: 0,
                path: "a".into(),
            })
            .await
            .unwrap();
        let one = Signature::of(10, b"one");
        let two = Signature::of(10, b"two");
        for (sig, location) in [
            (one, Some(Location::new(0, 0, 0))),
            (two, Some(Location::new(0, 0, 1))),
            (one, Some(Location::new(0, 0, 0))),
            (Signature::of(0, b""), None),
        ] {
            writer
                .write(&ManifestEntry::Block { sig, location })
                .await
                .unwrap();
        }
        writer.finish().await.unwrap();

        let mut store = HashStore::new();
        assert_eq!(store.load(&path).await.unwrap(), 2);
        assert_eq!(store.lookup(10, &one.strong), Some(Location::new(0, 0, 0)));
        assert_eq!(store.lookup(10, &two.strong), Some(Location::new(0, 0, 1)));

        assert!(store.load(&dir.path().join("missing.gz")).await.is_err());
    }
}
