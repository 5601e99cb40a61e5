//! Ordered candidate space
//!
//! Candidates are addressed by their position in a fixed order. The space
//! proposes midpoints, narrows ranges from classified outcomes, and remembers
//! which positions are unusable (skipped, or enclosed by a named skip range).
//!
//! Dependency graphs are linearized once with a deterministic topological
//! order; the midpoint of a graph range is the floor midpoint of that order.

use crate::config::{OrderingDirection, SkipSide};
use crate::error::CandidateSpaceError;
use crate::types::{Candidate, CandidateDescriptor, CandidateId, Outcome, OutcomeKind, SearchRange};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Ordered, addressable set of candidates
#[derive(Debug, Clone)]
pub struct CandidateSpace {
    candidates: Vec<Candidate>,
    positions: HashMap<CandidateId, usize>,
    skip_side: SkipSide,
    skipped: BTreeSet<usize>,
    skip_ranges: BTreeMap<String, BTreeSet<usize>>,
}

impl CandidateSpace {
    /// Build a linear space.
    ///
    /// With [`OrderingDirection::NewestFirst`] the list is reversed so that
    /// position 0 is always the known-good end.
    ///
    /// # Errors
    /// - `EmptyRange` with fewer than two candidates
    /// - `DuplicateCandidate` if an id repeats
    pub fn new(
        mut candidates: Vec<Candidate>,
        ordering: OrderingDirection,
    ) -> Result<Self, CandidateSpaceError> {
        if candidates.len() < 2 {
            return Err(CandidateSpaceError::EmptyRange(candidates.len()));
        }
        if ordering == OrderingDirection::NewestFirst {
            candidates.reverse();
        }

        let mut positions = HashMap::with_capacity(candidates.len());
        for (idx, candidate) in candidates.iter().enumerate() {
            if positions.insert(candidate.id.clone(), idx).is_some() {
                return Err(CandidateSpaceError::DuplicateCandidate(candidate.id.clone()));
            }
        }

        Ok(Self {
            candidates,
            positions,
            skip_side: SkipSide::default(),
            skipped: BTreeSet::new(),
            skip_ranges: BTreeMap::new(),
        })
    }

    /// Build a space from a dependency graph.
    ///
    /// `edges` are `(before, after)` pairs. Nodes keep their insertion order
    /// wherever the graph leaves the order free.
    ///
    /// # Errors
    /// - `UnknownCandidate` for an edge endpoint not among `nodes`
    /// - `CyclicGraph` if the edges form a cycle
    /// - any error of [`CandidateSpace::new`]
    pub fn from_graph(
        nodes: Vec<Candidate>,
        edges: &[(CandidateId, CandidateId)],
    ) -> Result<Self, CandidateSpaceError> {
        let mut lookup = HashMap::with_capacity(nodes.len());
        for (idx, node) in nodes.iter().enumerate() {
            if lookup.insert(node.id.clone(), idx).is_some() {
                return Err(CandidateSpaceError::DuplicateCandidate(node.id.clone()));
            }
        }

        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
        for idx in 0..nodes.len() {
            graph.add_node(idx);
        }
        for (before, after) in edges {
            let from = *lookup
                .get(before)
                .ok_or_else(|| CandidateSpaceError::UnknownCandidate(before.clone()))?;
            let to = *lookup
                .get(after)
                .ok_or_else(|| CandidateSpaceError::UnknownCandidate(after.clone()))?;
            graph.add_edge(from, to, ());
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            CandidateSpaceError::CyclicGraph(nodes[cycle.node_id()].id.clone())
        })?;

        let mut slots: Vec<Option<Candidate>> = nodes.into_iter().map(Some).collect();
        let ordered = order
            .into_iter()
            .filter_map(|idx| slots[idx].take())
            .collect();
        Self::new(ordered, OrderingDirection::OldestFirst)
    }

    /// With skip side heuristic
    #[inline]
    #[must_use]
    pub fn with_skip_side(mut self, side: SkipSide) -> Self {
        self.skip_side = side;
        self
    }

    /// Number of candidates
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Always false: construction rejects empty spaces
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Candidates in search order
    #[inline]
    #[must_use]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Candidate at a position
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Candidate> {
        self.candidates.get(index)
    }

    /// Position of a candidate id
    #[inline]
    #[must_use]
    pub fn position(&self, id: &CandidateId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Serializable descriptor for the build capability
    ///
    /// # Errors
    /// `OutOfBounds` for a position outside the space.
    pub fn descriptor(&self, index: usize) -> Result<CandidateDescriptor, CandidateSpaceError> {
        let candidate = self.candidate_at(index)?;
        Ok(CandidateDescriptor {
            id: candidate.id.clone(),
            index,
            summary: candidate.summary.clone(),
        })
    }

    /// SHA-256 over the ordered ids; changes whenever the ordering does
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for candidate in &self.candidates {
            hasher.update(candidate.id.as_str().as_bytes());
            hasher.update([0]);
        }
        hex::encode(hasher.finalize())
    }

    /// Outermost range: first candidate good, last candidate bad
    #[inline]
    #[must_use]
    pub fn bounds(&self) -> SearchRange {
        SearchRange::new(0, self.candidates.len().saturating_sub(1))
    }

    /// Whether the search must avoid this position
    #[must_use]
    pub fn is_unusable(&self, index: usize) -> bool {
        if self.skipped.contains(&index) {
            return true;
        }
        self.skip_ranges.values().any(|markers| {
            match (markers.first(), markers.last()) {
                (Some(&first), Some(&last)) => first <= index && index <= last,
                _ => false,
            }
        })
    }

    /// Next position to test, or `None` when nothing usable is left.
    ///
    /// The natural midpoint is the floor of the index midpoint. If it is
    /// unusable, neighbours are probed according to the skip side.
    #[must_use]
    pub fn midpoint(&self, range: &SearchRange) -> Option<usize> {
        if range.interior_len() == 0 {
            return None;
        }
        let mid = range.lower + (range.upper - range.lower) / 2;
        if !self.is_unusable(mid) {
            return Some(mid);
        }

        let below = (range.lower + 1..mid).rev();
        let above = mid + 1..range.upper;
        match self.skip_side {
            SkipSide::Lower => below.chain(above).find(|&idx| !self.is_unusable(idx)),
            SkipSide::Upper => above.chain(below).find(|&idx| !self.is_unusable(idx)),
            SkipSide::Nearest => {
                let reach = (mid - range.lower).max(range.upper - mid);
                (1..reach)
                    .flat_map(|distance| {
                        let low = mid.checked_sub(distance).filter(|&idx| idx > range.lower);
                        let high = Some(mid + distance).filter(|&idx| idx < range.upper);
                        low.into_iter().chain(high)
                    })
                    .find(|&idx| !self.is_unusable(idx))
            }
        }
    }

    /// Apply a classified outcome to the range.
    ///
    /// Re-applying an already recorded outcome leaves the range unchanged.
    /// `Skip` and `Inconclusive` never move the bounds.
    ///
    /// # Errors
    /// - `OutOfBounds` for a position outside the space
    /// - `InvalidOrdering` for a `Good` at or above the bad bound, or a
    ///   `Bad` at or below the good bound
    pub fn narrow(
        &mut self,
        range: SearchRange,
        index: usize,
        outcome: &Outcome,
    ) -> Result<SearchRange, CandidateSpaceError> {
        self.candidate_at(index)?;
        let invalid = || CandidateSpaceError::InvalidOrdering {
            index,
            outcome: outcome.kind(),
            lower: range.lower,
            upper: range.upper,
        };

        match outcome.kind() {
            OutcomeKind::Good => {
                if index >= range.upper {
                    return Err(invalid());
                }
                Ok(SearchRange::new(range.lower.max(index), range.upper))
            }
            OutcomeKind::Bad => {
                if index <= range.lower {
                    return Err(invalid());
                }
                Ok(SearchRange::new(range.lower, range.upper.min(index)))
            }
            OutcomeKind::Skip => {
                self.skipped.insert(index);
                if let Some(label) = outcome.skip_label() {
                    self.skip_ranges
                        .entry(label.to_string())
                        .or_default()
                        .insert(index);
                }
                Ok(range)
            }
            OutcomeKind::Inconclusive => Ok(range),
        }
    }

    /// True when no usable candidate lies strictly between the bounds
    #[inline]
    #[must_use]
    pub fn is_converged(&self, range: &SearchRange) -> bool {
        self.midpoint(range).is_none()
    }

    /// Unusable positions strictly between the bounds
    #[must_use]
    pub fn undecided(&self, range: &SearchRange) -> Vec<usize> {
        (range.lower + 1..range.upper)
            .filter(|&idx| self.is_unusable(idx))
            .collect()
    }

    /// Progress estimate for the current range
    #[must_use]
    pub fn progress(&self, range: &SearchRange) -> Progress {
        let usable = (range.lower + 1..range.upper)
            .filter(|&idx| !self.is_unusable(idx))
            .count();
        // every usable interior position plus the bad bound may be the first bad one
        Progress::from_suspects(usable + 1)
    }

    fn candidate_at(&self, index: usize) -> Result<&Candidate, CandidateSpaceError> {
        self.candidates
            .get(index)
            .ok_or(CandidateSpaceError::OutOfBounds {
                index,
                len: self.candidates.len(),
            })
    }
}

/// Rough count of what is left, in the style of `git bisect`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Candidates still possibly first-bad
    pub suspects: usize,
    /// Candidates left to test after the next one
    pub left_after_next: usize,
    /// Approximate steps after the next one
    pub steps_after_next: u32,
}

impl Progress {
    fn from_suspects(suspects: usize) -> Self {
        let steps = if suspects <= 1 { 0 } else { suspects.ilog2() };
        Self {
            suspects,
            left_after_next: suspects.saturating_sub(1).div_ceil(2),
            steps_after_next: steps.saturating_sub(1),
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bisecting: {} revisions left to test after this (roughly {} steps)",
            self.left_after_next, self.steps_after_next
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Diagnostic;

    fn space(n: usize) -> CandidateSpace {
        let candidates = (0..n).map(|i| Candidate::new(format!("c{i}"))).collect();
        CandidateSpace::new(candidates, OrderingDirection::OldestFirst).unwrap()
    }

    fn skip() -> Outcome {
        Outcome::skip(Diagnostic::default())
    }

    fn bad() -> Outcome {
        Outcome::bad(Diagnostic::default())
    }

    #[test]
    fn rejects_single_candidate() {
        let result = CandidateSpace::new(vec![Candidate::new("a")], OrderingDirection::OldestFirst);
        assert_eq!(result.unwrap_err(), CandidateSpaceError::EmptyRange(1));
    }

    #[test]
    fn rejects_duplicates() {
        let result = CandidateSpace::new(
            vec![Candidate::new("a"), Candidate::new("b"), Candidate::new("a")],
            OrderingDirection::OldestFirst,
        );
        assert!(matches!(result, Err(CandidateSpaceError::DuplicateCandidate(_))));
    }

    #[test]
    fn newest_first_is_reversed() {
        let space = CandidateSpace::new(
            vec![Candidate::new("new"), Candidate::new("mid"), Candidate::new("old")],
            OrderingDirection::NewestFirst,
        )
        .unwrap();
        assert_eq!(space.get(0).unwrap().id.as_str(), "old");
        assert_eq!(space.position(&CandidateId::new("new")), Some(2));
    }

    #[test]
    fn midpoint_is_floor() {
        let space = space(11);
        assert_eq!(space.midpoint(&SearchRange::new(0, 10)), Some(5));
        assert_eq!(space.midpoint(&SearchRange::new(0, 3)), Some(1));
        assert_eq!(space.midpoint(&SearchRange::new(4, 5)), None);
    }

    #[test]
    fn narrow_moves_bounds() {
        let mut space = space(11);
        let range = space.bounds();
        let range = space.narrow(range, 5, &Outcome::Good).unwrap();
        assert_eq!(range, SearchRange::new(5, 10));
        let range = space.narrow(range, 7, &bad()).unwrap();
        assert_eq!(range, SearchRange::new(5, 7));
    }

    #[test]
    fn narrow_is_idempotent() {
        let mut space = space(11);
        let once = space.narrow(space.bounds(), 4, &Outcome::Good).unwrap();
        let twice = space.narrow(once, 4, &Outcome::Good).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn narrow_rejects_inversion() {
        let mut space = space(11);
        let range = SearchRange::new(3, 6);
        assert!(matches!(
            space.narrow(range, 6, &Outcome::Good),
            Err(CandidateSpaceError::InvalidOrdering { .. })
        ));
        assert!(matches!(
            space.narrow(range, 2, &bad()),
            Err(CandidateSpaceError::InvalidOrdering { .. })
        ));
    }

    #[test]
    fn narrow_out_of_bounds() {
        let mut space = space(3);
        assert!(matches!(
            space.narrow(space.bounds(), 9, &Outcome::Good),
            Err(CandidateSpaceError::OutOfBounds { index: 9, len: 3 })
        ));
    }

    #[test]
    fn skip_keeps_bounds_and_moves_midpoint() {
        let mut space = space(11);
        let range = space.bounds();
        let after = space.narrow(range, 5, &skip()).unwrap();
        assert_eq!(after, range);
        assert_eq!(space.midpoint(&range), Some(4));
    }

    #[test]
    fn skip_side_upper_prefers_above() {
        let mut space = space(11).with_skip_side(SkipSide::Upper);
        let range = space.bounds();
        space.narrow(range, 5, &skip()).unwrap();
        assert_eq!(space.midpoint(&range), Some(6));
    }

    #[test]
    fn skip_side_lower_falls_back_to_upper() {
        let mut space = space(6).with_skip_side(SkipSide::Lower);
        let range = SearchRange::new(0, 5);
        space.narrow(range, 1, &skip()).unwrap();
        space.narrow(range, 2, &skip()).unwrap();
        assert_eq!(space.midpoint(&range), Some(3));
    }

    #[test]
    fn nearest_alternates_sides() {
        let mut space = space(11);
        let range = space.bounds();
        space.narrow(range, 5, &skip()).unwrap();
        space.narrow(range, 4, &skip()).unwrap();
        assert_eq!(space.midpoint(&range), Some(6));
        space.narrow(range, 6, &skip()).unwrap();
        assert_eq!(space.midpoint(&range), Some(3));
    }

    #[test]
    fn named_skip_range_covers_interval() {
        let mut space = space(11);
        let range = space.bounds();
        let labelled = Outcome::skip_range("eval", Diagnostic::default());
        space.narrow(range, 3, &labelled).unwrap();
        space.narrow(range, 7, &labelled).unwrap();
        for idx in 3..=7 {
            assert!(space.is_unusable(idx), "position {idx} should be covered");
        }
        assert!(!space.is_unusable(2));
        assert_eq!(space.midpoint(&range), Some(2));
    }

    #[test]
    fn converged_when_only_skips_remain() {
        let mut space = space(5);
        let range = SearchRange::new(1, 4);
        space.narrow(range, 2, &skip()).unwrap();
        space.narrow(range, 3, &skip()).unwrap();
        assert!(space.is_converged(&range));
        assert_eq!(space.undecided(&range), vec![2, 3]);
    }

    #[test]
    fn graph_linearization_respects_edges() {
        let nodes = vec![
            Candidate::new("d"),
            Candidate::new("b"),
            Candidate::new("a"),
            Candidate::new("c"),
        ];
        let edges = vec![
            (CandidateId::new("a"), CandidateId::new("b")),
            (CandidateId::new("a"), CandidateId::new("c")),
            (CandidateId::new("b"), CandidateId::new("d")),
            (CandidateId::new("c"), CandidateId::new("d")),
        ];
        let space = CandidateSpace::from_graph(nodes, &edges).unwrap();
        let pos = |id: &str| space.position(&CandidateId::new(id)).unwrap();
        assert_eq!(pos("a"), 0);
        assert_eq!(pos("d"), 3);
        assert!(pos("b") < pos("d") && pos("c") < pos("d"));
    }

    #[test]
    fn graph_cycle_rejected() {
        let nodes = vec![Candidate::new("a"), Candidate::new("b")];
        let edges = vec![
            (CandidateId::new("a"), CandidateId::new("b")),
            (CandidateId::new("b"), CandidateId::new("a")),
        ];
        assert!(matches!(
            CandidateSpace::from_graph(nodes, &edges),
            Err(CandidateSpaceError::CyclicGraph(_))
        ));
    }

    #[test]
    fn fingerprint_tracks_order() {
        let a = space(4);
        let reversed = CandidateSpace::new(
            (0..4).rev().map(|i| Candidate::new(format!("c{i}"))).collect(),
            OrderingDirection::OldestFirst,
        )
        .unwrap();
        assert_eq!(a.fingerprint(), space(4).fingerprint());
        assert_ne!(a.fingerprint(), reversed.fingerprint());
    }

    #[test]
    fn progress_line() {
        let space = space(11);
        let progress = space.progress(&space.bounds());
        assert_eq!(progress.suspects, 10);
        assert_eq!(
            progress.to_string(),
            "Bisecting: 5 revisions left to test after this (roughly 2 steps)"
        );
    }
}
