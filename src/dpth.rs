//! Placement of new block data.
//!
//! A location is a three level counter, each level a base-65536 digit, which
//! maps onto nested directories under the pool's data root. The counter is
//! shared by every session writing into the same pool; each session holds a
//! [`Dpth`] handle that tracks the reservations it still owes a write for.

use core::fmt;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::{fs, io};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Each level holds at most this many entries.
pub const LEVEL_LIMIT: u32 = 1 << 16;

#[derive(Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub prim: u16,
    pub seco: u16,
    pub tert: u16,
}

impl Location {
    pub const fn new(prim: u16, seco: u16, tert: u16) -> Self {
        Self { prim, seco, tert }
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(format!("{:04X}", self.prim))
            .join(format!("{:04X}", self.seco))
            .join(format!("{:04X}", self.tert))
    }

    /// The next location, or `None` when the most significant level overflows.
    fn successor(self, max_per_level: u32) -> Option<Self> {
        let Self { prim, seco, tert } = self;
        if u32::from(tert) + 1 < max_per_level {
            return Some(Self::new(prim, seco, tert + 1));
        }
        if u32::from(seco) + 1 < max_per_level {
            return Some(Self::new(prim, seco + 1, 0));
        }
        if u32::from(prim) + 1 < max_per_level {
            return Some(Self::new(prim + 1, 0, 0));
        }
        None
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Location({self})")
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}/{:04X}/{:04X}", self.prim, self.seco, self.tert)
    }
}

impl FromStr for Location {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/').map(parse_level);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(Some(prim)), Some(Some(seco)), Some(Some(tert)), None) => {
                Ok(Self::new(prim, seco, tert))
            }
            _ => Err(Error::record(format!("invalid location {s:?}"))),
        }
    }
}

fn parse_level(name: &str) -> Option<u16> {
    if name.len() != 4 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(name, 16).ok()
}

struct Pool {
    root: PathBuf,
    max_per_level: u32,
    cursor: Location,
    looped: u32,
    reserved: HashSet<Location>,
}

impl Pool {
    fn advance(&mut self) {
        match self.cursor.successor(self.max_per_level) {
            Some(next) => self.cursor = next,
            None => {
                self.cursor = Location::default();
                self.looped += 1;
                warn!(root = ?self.root, looped = self.looped, "data path namespace wrapped around");
            }
        }
    }

    /// Reserves the location under the cursor. The flag says whether the
    /// cursor has wrapped, in which case the caller must check the disk.
    fn reserve_next(&mut self) -> Result<(Location, bool)> {
        loop {
            if self.looped > 1 {
                return Err(Error::Exhausted {
                    root: self.root.clone(),
                });
            }
            let location = self.cursor;
            // Until the first wrap everything at or past the cursor is free.
            let wrapped = self.looped > 0;
            self.advance();
            if wrapped && self.reserved.contains(&location) {
                continue;
            }
            self.reserved.insert(location);
            return Ok((location, wrapped));
        }
    }

    fn apply_scan(&mut self, start: Option<Location>) {
        if self.looped > 0 {
            return;
        }
        match start {
            Some(start) if start > self.cursor => {
                debug!(from = %self.cursor, to = %start, "dpth cursor moved forward to match disk");
                self.cursor = start;
            }
            Some(_) => {}
            None => {
                self.cursor = Location::default();
                self.looped = 1;
                warn!(root = ?self.root, "data path namespace is full on disk, wrapping around");
            }
        }
    }
}

/// Finds the first location past everything present on disk.
///
/// Descends into the highest numbered entry of each level. Returns `None` when
/// the very last location of the namespace is in use.
fn scan_start(root: &Path, max_per_level: u32) -> io::Result<Option<Location>> {
    let Some(prim) = highest_entry(root, max_per_level)? else {
        return Ok(Some(Location::default()));
    };
    let prim_dir = root.join(format!("{prim:04X}"));
    let Some(seco) = highest_entry(&prim_dir, max_per_level)? else {
        return Ok(Some(Location::new(prim, 0, 0)));
    };
    let seco_dir = prim_dir.join(format!("{seco:04X}"));
    let Some(tert) = highest_entry(&seco_dir, max_per_level)? else {
        return Ok(Some(Location::new(prim, seco, 0)));
    };
    Ok(Location::new(prim, seco, tert).successor(max_per_level))
}

fn highest_entry(dir: &Path, max_per_level: u32) -> io::Result<Option<u16>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut highest = None;
    for entry in entries {
        let entry = entry?;
        let Some(level) = entry.file_name().to_str().and_then(parse_level) else {
            continue;
        };
        if u32::from(level) < max_per_level {
            highest = highest.max(Some(level));
        }
    }
    Ok(highest)
}

/// The pool-wide placement counter.
#[derive(Clone)]
pub struct DataPathAllocator {
    inner: Arc<Mutex<Pool>>,
}

impl DataPathAllocator {
    /// Opens the allocator for `root`, seeding the cursor from what is on disk.
    pub async fn open(root: impl Into<PathBuf>, max_per_level: u32) -> Result<Self> {
        if !(1..=LEVEL_LIMIT).contains(&max_per_level) {
            return Err(Error::Config(format!(
                "max_per_level must be between 1 and {LEVEL_LIMIT}, got {max_per_level}"
            )));
        }
        let pool = Pool {
            root: root.into(),
            max_per_level,
            cursor: Location::default(),
            looped: 0,
            reserved: HashSet::new(),
        };
        let allocator = Self {
            inner: Arc::new(Mutex::new(pool)),
        };
        allocator.resync().await?;
        info!(root = ?allocator.root(), cursor = %allocator.cursor(), "opened data path allocator");
        Ok(allocator)
    }

    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> PathBuf {
        self.lock().root.clone()
    }

    pub fn cursor(&self) -> Location {
        self.lock().cursor
    }

    pub fn looped(&self) -> u32 {
        self.lock().looped
    }

    /// Locations reserved by any session and not yet released.
    pub fn reserved(&self) -> usize {
        self.lock().reserved.len()
    }

    /// Re-seeds the cursor to one past the highest location on disk.
    ///
    /// A crash may leave data behind the in-memory cursor, so this runs at the
    /// start of every session. The cursor only ever moves forward here.
    pub async fn resync(&self) -> Result<()> {
        let (root, max_per_level) = {
            let pool = self.lock();
            if pool.looped > 0 {
                return Ok(());
            }
            (pool.root.clone(), pool.max_per_level)
        };
        let start = tokio::task::spawn_blocking(move || scan_start(&root, max_per_level))
            .await
            .map_err(io::Error::other)??;
        self.lock().apply_scan(start);
        Ok(())
    }

    /// Starts a session's reservation scope.
    pub async fn session(&self) -> Result<Dpth> {
        self.resync().await?;
        Ok(Dpth {
            pool: self.clone(),
            held: BTreeSet::new(),
        })
    }
}

/// A session's view of the allocator.
///
/// Dropping the handle releases whatever it still holds.
pub struct Dpth {
    pool: DataPathAllocator,
    held: BTreeSet<Location>,
}

impl Dpth {
    pub fn root(&self) -> PathBuf {
        self.pool.root()
    }

    /// Reserves the next free location.
    pub async fn allocate(&mut self) -> Result<Location> {
        loop {
            let (location, wrapped) = self.pool.lock().reserve_next()?;
            self.held.insert(location);
            if !wrapped {
                return Ok(location);
            }
            match tokio::fs::try_exists(location.path(&self.root())).await {
                Ok(false) => return Ok(location),
                Ok(true) => {
                    self.release(location);
                }
                Err(err) => {
                    self.release(location);
                    return Err(err.into());
                }
            }
        }
    }

    /// Gives up the reservation once the block data is durably written.
    pub fn release(&mut self, location: Location) -> bool {
        if !self.held.remove(&location) {
            return false;
        }
        self.pool.lock().reserved.remove(&location);
        true
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Ends the session's scope.
    ///
    /// # Panics
    ///
    /// When any reservation other than `in_flight` is still held; that means a
    /// block was allocated and then lost track of.
    pub fn finish(mut self, in_flight: Option<Location>) {
        let leaked: Vec<_> = self
            .held
            .iter()
            .filter(|location| Some(**location) != in_flight)
            .collect();
        assert!(
            leaked.is_empty(),
            "session ended with unreleased data path reservations: {leaked:?}"
        );
        self.abort();
    }

    /// Releases every reservation without any checks.
    pub fn abort(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let mut pool = self.pool.lock();
        for location in std::mem::take(&mut self.held) {
            pool.reserved.remove(&location);
        }
    }
}

impl Drop for Dpth {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, location: Location) {
        let path = location.path(root);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn location_rendering() {
        let location = Location::new(0x1, 0xab, 0xFFFF);
        assert_eq!(location.to_string(), "0001/00AB/FFFF");
        assert_eq!("0001/00AB/FFFF".parse::<Location>().unwrap(), location);
        assert_eq!("0001/00ab/ffff".parse::<Location>().unwrap(), location);
        assert!("0001/00AB".parse::<Location>().is_err());
        assert!("0001/00AB/FFFF/0000".parse::<Location>().is_err());
        assert!("1/2/3".parse::<Location>().is_err());
        assert_eq!(
            location.path(Path::new("/data")),
            Path::new("/data/0001/00AB/FFFF")
        );
    }

    #[tokio::test]
    async fn allocations_are_distinct_until_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = DataPathAllocator::open(dir.path(), 2).await.unwrap();
        let mut dpth = allocator.session().await.unwrap();

        let mut seen = HashSet::new();
        for _ in 0..8 {
            assert!(seen.insert(dpth.allocate().await.unwrap()));
        }
        assert_eq!(allocator.looped(), 1);

        // Every slot is still reserved, so the second loop finds nothing.
        let err = dpth.allocate().await.unwrap_err();
        assert!(matches!(err, Error::Exhausted { .. }));
        assert!(err.is_fatal());
        dpth.abort();
    }

    #[tokio::test]
    async fn counter_carries_between_levels() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = DataPathAllocator::open(dir.path(), 2).await.unwrap();
        let mut dpth = allocator.session().await.unwrap();

        let mut allocated = vec![];
        for _ in 0..4 {
            allocated.push(dpth.allocate().await.unwrap());
        }
        assert_eq!(
            allocated,
            [
                Location::new(0, 0, 0),
                Location::new(0, 0, 1),
                Location::new(0, 1, 0),
                Location::new(0, 1, 1),
            ]
        );
        assert_eq!(dpth.allocate().await.unwrap(), Location::new(1, 0, 0));
        dpth.abort();
    }

    #[tokio::test]
    async fn wrapped_allocation_skips_used_slots() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = DataPathAllocator::open(dir.path(), 2).await.unwrap();
        let mut dpth = allocator.session().await.unwrap();

        for _ in 0..8 {
            let location = dpth.allocate().await.unwrap();
            // leave 0001/0000/0001 free
            if location != Location::new(1, 0, 1) {
                touch(dir.path(), location);
            }
            dpth.release(location);
        }
        assert_eq!(dpth.allocate().await.unwrap(), Location::new(1, 0, 1));
        assert!(matches!(dpth.allocate().await, Err(Error::Exhausted { .. })));
        dpth.abort();
    }

    #[tokio::test]
    async fn resync_starts_past_disk_contents() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), Location::new(0, 0, 5));
        touch(dir.path(), Location::new(0, 3, 1));
        fs::create_dir_all(dir.path().join("0000/0003/not-a-location")).unwrap();
        fs::write(dir.path().join("0000/0003/0009.tmp"), b"").unwrap();

        let allocator = DataPathAllocator::open(dir.path(), LEVEL_LIMIT).await.unwrap();
        assert_eq!(allocator.cursor(), Location::new(0, 3, 2));

        // An empty highest directory is a valid place to continue from.
        fs::create_dir_all(dir.path().join("0002")).unwrap();
        allocator.resync().await.unwrap();
        assert_eq!(allocator.cursor(), Location::new(2, 0, 0));
    }

    #[tokio::test]
    async fn resync_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = DataPathAllocator::open(dir.path(), LEVEL_LIMIT).await.unwrap();
        let mut dpth = allocator.session().await.unwrap();
        for _ in 0..10 {
            let location = dpth.allocate().await.unwrap();
            dpth.release(location);
        }
        // nothing was written, the disk is behind the cursor
        let other = allocator.session().await.unwrap();
        assert_eq!(allocator.cursor(), Location::new(0, 0, 10));
        drop(other);
    }

    #[tokio::test]
    async fn full_disk_wraps_on_open() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), Location::new(1, 1, 1));
        let allocator = DataPathAllocator::open(dir.path(), 2).await.unwrap();
        assert_eq!(allocator.looped(), 1);

        let mut dpth = allocator.session().await.unwrap();
        assert_eq!(dpth.allocate().await.unwrap(), Location::new(0, 0, 0));
        dpth.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sessions_never_share_locations() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = DataPathAllocator::open(dir.path(), LEVEL_LIMIT).await.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = allocator.clone();
                tokio::spawn(async move {
                    let mut dpth = allocator.session().await.unwrap();
                    let mut locations = Vec::with_capacity(100);
                    for _ in 0..100 {
                        locations.push(dpth.allocate().await.unwrap());
                    }
                    dpth.abort();
                    locations
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for location in handle.await.unwrap() {
                assert!(seen.insert(location));
            }
        }
        assert_eq!(seen.len(), 400);
    }

    #[tokio::test]
    async fn finish_allows_the_in_flight_reservation() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = DataPathAllocator::open(dir.path(), LEVEL_LIMIT).await.unwrap();
        let mut dpth = allocator.session().await.unwrap();

        let done = dpth.allocate().await.unwrap();
        let in_flight = dpth.allocate().await.unwrap();
        assert!(dpth.release(done));
        assert!(!dpth.release(done));
        assert_eq!(dpth.held(), 1);
        assert_eq!(allocator.reserved(), 1);
        dpth.finish(Some(in_flight));
        assert_eq!(allocator.reserved(), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "unreleased data path reservations")]
    async fn finish_panics_on_leaked_reservations() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = DataPathAllocator::open(dir.path(), LEVEL_LIMIT).await.unwrap();
        let mut dpth = allocator.session().await.unwrap();

        dpth.allocate().await.unwrap();
        dpth.allocate().await.unwrap();
        dpth.finish(None);
    }

    #[tokio::test]
    async fn rejects_bad_level_limits() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DataPathAllocator::open(dir.path(), 0).await.is_err());
        assert!(DataPathAllocator::open(dir.path(), LEVEL_LIMIT + 1).await.is_err());
    }
}
