//! The champion chooser.
//!
//! Given a window of incoming hook fingerprints, rank the candidate backups by
//! how many of those hooks they share and pick a few champions whose full
//! manifests are then loaded for exact matching. This approximates "find the
//! prior backup most similar to this stretch of input" at a cost bounded by the
//! window size rather than by the number of candidates.

use std::path::{Path, PathBuf};

use tracing::trace;

use crate::sparse::SparseIndex;

/// Index of a candidate, and of its slot in the score table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandidateId(pub u32);

impl CandidateId {
    fn slot(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    manifest: PathBuf,
}

impl Candidate {
    pub fn manifest(&self) -> &Path {
        &self.manifest
    }
}

/// One counter per candidate, cleared wholesale between passes.
///
/// A score counts window hooks, and a window holds at most `u16::MAX` of
/// them, so the counters cannot overflow.
#[derive(Debug, Default)]
struct Scores(Vec<u16>);

impl Scores {
    fn reset(&mut self) {
        self.0.fill(0);
    }

    fn push(&mut self) {
        self.0.push(0);
    }

    fn increment(&mut self, candidate: CandidateId) -> u16 {
        let score = &mut self.0[candidate.slot()];
        debug_assert!(*score < u16::MAX, "score exceeds the window capacity");
        *score += 1;
        *score
    }

    fn decrement(&mut self, candidate: CandidateId) {
        let score = &mut self.0[candidate.slot()];
        debug_assert!(*score > 0);
        *score -= 1;
    }

    fn get(&self, candidate: CandidateId) -> u16 {
        self.0[candidate.slot()]
    }
}

/// Hook fingerprints awaiting a scoring pass.
#[derive(Debug, Clone)]
pub struct IncomingWindow {
    fingerprints: Vec<u64>,
    /// Set once a chosen champion covers the fingerprint.
    found: Vec<bool>,
    capacity: u16,
}

impl IncomingWindow {
    pub fn new(capacity: u16) -> Self {
        Self {
            fingerprints: Vec::new(),
            found: Vec::new(),
            capacity,
        }
    }

    /// Adds a hook. Returns `false` when the window is already full.
    pub fn push(&mut self, fingerprint: u64) -> bool {
        if self.is_full() {
            return false;
        }
        self.fingerprints.push(fingerprint);
        self.found.push(false);
        true
    }

    pub fn is_full(&self) -> bool {
        self.fingerprints.len() >= usize::from(self.capacity)
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    pub fn fingerprints(&self) -> &[u64] {
        &self.fingerprints
    }

    pub fn is_found(&self, position: usize) -> bool {
        self.found[position]
    }

    pub fn clear(&mut self) {
        self.fingerprints.clear();
        self.found.clear();
    }
}

/// Owns every candidate, the sparse index over them and the score table.
#[derive(Debug)]
pub struct ChampChooser {
    candidates: Vec<Candidate>,
    sparse: SparseIndex,
    scores: Scores,
    champs_max: usize,
}

impl ChampChooser {
    pub fn new(champs_max: usize) -> Self {
        Self {
            candidates: Vec::new(),
            sparse: SparseIndex::default(),
            scores: Scores::default(),
            champs_max,
        }
    }

    /// Registers a candidate and its hooks, growing the score table with it.
    pub fn add_candidate(
        &mut self,
        manifest: impl Into<PathBuf>,
        hooks: impl IntoIterator<Item = u64>,
    ) -> CandidateId {
        let id = CandidateId(self.candidates.len() as u32);
        self.candidates.push(Candidate {
            manifest: manifest.into(),
        });
        self.scores.push();
        for hook in hooks {
            self.sparse.insert(hook, id);
        }
        id
    }

    pub fn candidate(&self, id: CandidateId) -> &Candidate {
        &self.candidates[id.slot()]
    }

    pub fn candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn hooks(&self) -> usize {
        self.sparse.len()
    }

    pub fn champs_max(&self) -> usize {
        self.champs_max
    }

    /// The score a candidate reached in the most recent pass.
    pub fn score(&self, id: CandidateId) -> u16 {
        self.scores.get(id)
    }

    /// One scoring pass.
    ///
    /// Hooks shared with `last`, the previous champion, are marked found and
    /// stop counting for everyone. The increments already made for such a hook
    /// to candidates listed before `last` are rolled back, along with any
    /// change of `best` they caused.
    pub fn choose_champion(
        &mut self,
        window: &mut IncomingWindow,
        last: Option<CandidateId>,
    ) -> Option<CandidateId> {
        debug_assert_eq!(self.scores.0.len(), self.candidates.len());
        self.scores.reset();

        let mut best = None;
        let mut best_score = 0;
        for position in 0..window.fingerprints.len() {
            if window.found[position] {
                continue;
            }
            let Some(candidates) = self.sparse.get(window.fingerprints[position]) else {
                continue;
            };

            let (saved_best, saved_score) = (best, best_score);
            for (i, &candidate) in candidates.iter().enumerate() {
                if Some(candidate) == last {
                    window.found[position] = true;
                    for &earlier in &candidates[..i] {
                        self.scores.decrement(earlier);
                    }
                    (best, best_score) = (saved_best, saved_score);
                    break;
                }
                let score = self.scores.increment(candidate);
                if score > best_score {
                    best = Some(candidate);
                    best_score = score;
                }
            }
        }
        if let Some(best) = best {
            trace!(candidate = best.0, score = best_score, "best candidate of pass");
        }
        best
    }

    /// Picks up to `champs_max` distinct champions for the window, best first.
    pub fn choose_champions(&mut self, window: &mut IncomingWindow) -> Vec<CandidateId> {
        let mut champions = Vec::new();
        let mut last = None;
        while champions.len() < self.champs_max {
            let Some(champion) = self.choose_champion(window, last) else {
                break;
            };
            debug_assert!(!champions.contains(&champion));
            champions.push(champion);
            last = Some(champion);
        }
        champions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_of(hooks: impl IntoIterator<Item = u64>) -> IncomingWindow {
        let mut window = IncomingWindow::new(u16::MAX);
        for hook in hooks {
            assert!(window.push(hook));
        }
        window
    }

    #[test]
    fn larger_overlap_wins() {
        let mut chooser = ChampChooser::new(10);
        let b = chooser.add_candidate("b", 100..103);
        let a = chooser.add_candidate("a", 0..10);
        chooser.add_candidate("unrelated", 1000..1100);

        let mut window = window_of((0..10).chain(100..103).chain(500..510));
        let champions = chooser.choose_champions(&mut window);
        assert_eq!(champions, [a, b]);
    }

    #[test]
    fn first_pass_scores() {
        let mut chooser = ChampChooser::new(1);
        let a = chooser.add_candidate("a", 0..10);
        let b = chooser.add_candidate("b", 5..8);

        let mut window = window_of(0..20);
        assert_eq!(chooser.choose_champion(&mut window, None), Some(a));
        assert_eq!(chooser.score(a), 10);
        assert_eq!(chooser.score(b), 3);
    }

    #[test]
    fn empty_window_has_no_champion() {
        let mut chooser = ChampChooser::new(10);
        chooser.add_candidate("a", 0..10);

        let mut window = IncomingWindow::new(16);
        assert!(chooser.choose_champions(&mut window).is_empty());

        let mut window = window_of(20..30);
        assert!(chooser.choose_champions(&mut window).is_empty());
    }

    #[test]
    fn ties_go_to_the_earliest_maximum() {
        let mut chooser = ChampChooser::new(1);
        let a = chooser.add_candidate("a", [1, 2]);
        chooser.add_candidate("b", [1, 2]);

        let mut window = window_of([1, 2]);
        assert_eq!(chooser.choose_champions(&mut window), [a]);
    }

    #[test]
    fn champions_are_limited_and_distinct() {
        let mut chooser = ChampChooser::new(5);
        // candidate `i` shares `i + 1` hooks of its own with the window
        let hooks_of = |i: u64| (i * 100)..=(i * 100 + i);
        let ids: Vec<_> = (0..20u64)
            .map(|i| chooser.add_candidate(format!("c{i}"), hooks_of(i)))
            .collect();

        let mut window = window_of((0..20).flat_map(hooks_of));
        let champions = chooser.choose_champions(&mut window);
        assert_eq!(champions.len(), 5);
        let mut unique = champions.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 5);
        assert_eq!(champions, [ids[19], ids[18], ids[17], ids[16], ids[15]]);

        // a single candidate covering everything leaves nothing for others
        let everything = chooser.add_candidate("everything", (0..20).flat_map(hooks_of));
        let mut window = window_of((0..20).flat_map(hooks_of));
        assert_eq!(chooser.choose_champions(&mut window), [everything]);
    }

    #[test]
    fn covered_hooks_stop_counting() {
        let mut chooser = ChampChooser::new(10);
        // b is listed before a on the shared hooks, so its increments there
        // have to be rolled back once a is the champion
        let b = chooser.add_candidate("b", [1, 2, 3, 4, 7]);
        let a = chooser.add_candidate("a", [1, 2, 3, 4, 5, 6]);
        let c = chooser.add_candidate("c", [7, 8]);

        let mut window = window_of(1..=8);
        assert_eq!(chooser.choose_champion(&mut window, None), Some(a));
        assert_eq!(chooser.score(b), 5);

        assert_eq!(chooser.choose_champion(&mut window, Some(a)), Some(c));
        assert_eq!(chooser.score(b), 1);
        assert_eq!(chooser.score(c), 2);
        assert!((0..6).all(|position| window.is_found(position)));
        assert!(!window.is_found(6));

        assert_eq!(chooser.choose_champion(&mut window, Some(c)), None);

        let mut window = window_of(1..=8);
        assert_eq!(chooser.choose_champions(&mut window), [a, c]);
    }

    #[test]
    fn rollback_restores_the_previous_best() {
        let mut chooser = ChampChooser::new(10);
        let b = chooser.add_candidate("b", [1, 2]);
        let a = chooser.add_candidate("a", [1, 9]);
        let c = chooser.add_candidate("c", [3]);

        // pass two: hook 1 would make b the best, but a covers it
        let mut window = window_of([9, 1, 3, 2]);
        let champions = chooser.choose_champions(&mut window);
        assert_eq!(champions[0], a);
        assert_eq!(chooser.candidate(champions[1]).manifest(), Path::new("c"));
        assert_eq!(champions, [a, c, b]);
    }

    #[test]
    fn window_capacity() {
        let mut window = IncomingWindow::new(2);
        assert!(window.push(1));
        assert!(!window.is_full());
        assert!(window.push(2));
        assert!(window.is_full());
        assert!(!window.push(3));
        assert_eq!(window.fingerprints(), [1, 2]);
        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.capacity(), 2);
    }
}
