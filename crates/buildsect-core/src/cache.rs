//! Result cache
//!
//! Memoizes the outcome of every tested candidate for the lifetime of a run.
//! `Good` and `Bad` are final. `Inconclusive` entries count attempts and are
//! demoted to `Skip` once the retry budget is spent. Entries are never
//! evicted; the only removal is an explicit [`ResultCache::invalidate`].

use crate::types::{CandidateId, Diagnostic, Outcome, OutcomeKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One memoized outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Candidate the outcome belongs to
    pub candidate: CandidateId,
    /// Effective outcome
    pub outcome: Outcome,
    /// When the outcome was recorded
    pub timestamp: DateTime<Utc>,
    /// Number of builds that produced this entry
    pub attempts: u32,
    /// Insertion order within the run
    pub sequence: u64,
    /// Free-form note (e.g. demotion reason)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// What the engine should do about a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    /// Final outcome known; do not build
    Hit(&'a Outcome),
    /// Previous attempts were inconclusive; build again
    Retry {
        /// Attempts so far
        attempts: u32,
    },
    /// Never tested
    Miss,
}

/// Outcome memo for one run
#[derive(Debug, Clone, Default)]
pub struct ResultCache {
    entries: BTreeMap<CandidateId, CacheEntry>,
    max_retries: u32,
    next_sequence: u64,
}

impl ResultCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_retries,
            next_sequence: 0,
        }
    }

    /// Rebuild a cache from persisted entries
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = CacheEntry>, max_retries: u32) -> Self {
        let mut cache = Self::new(max_retries);
        for entry in entries {
            cache.next_sequence = cache.next_sequence.max(entry.sequence + 1);
            cache.entries.insert(entry.candidate.clone(), entry);
        }
        cache
    }

    /// Recorded outcome, including inconclusive ones
    #[must_use]
    pub fn get(&self, candidate: &CandidateId) -> Option<&Outcome> {
        self.entries.get(candidate).map(|entry| &entry.outcome)
    }

    /// Full entry
    #[must_use]
    pub fn entry(&self, candidate: &CandidateId) -> Option<&CacheEntry> {
        self.entries.get(candidate)
    }

    /// Decide whether a candidate needs a build
    #[must_use]
    pub fn lookup(&self, candidate: &CandidateId) -> Lookup<'_> {
        match self.entries.get(candidate) {
            None => Lookup::Miss,
            Some(entry) if entry.outcome.kind() == OutcomeKind::Inconclusive => Lookup::Retry {
                attempts: entry.attempts,
            },
            Some(entry) => Lookup::Hit(&entry.outcome),
        }
    }

    /// Record an outcome and return the outcome that is now in effect.
    ///
    /// A `Good`/`Bad` entry is never replaced. An inconclusive outcome past
    /// the retry budget is stored as `Skip`.
    pub fn put(&mut self, candidate: CandidateId, outcome: Outcome) -> Outcome {
        let previous = self.entries.get(&candidate);

        if let Some(existing) = previous.filter(|e| e.outcome.kind().is_decisive()) {
            if existing.outcome.kind() != outcome.kind() {
                warn!(
                    candidate = %candidate,
                    recorded = %existing.outcome,
                    observed = %outcome,
                    "ignoring conflicting result for an already decided candidate"
                );
            }
            return existing.outcome.clone();
        }

        let attempts = match previous {
            Some(e) if e.outcome.kind() == OutcomeKind::Inconclusive => e.attempts + 1,
            _ => 1,
        };

        let exhausted = outcome.kind() == OutcomeKind::Inconclusive && attempts > self.max_retries;
        let (outcome, note) = if exhausted {
            warn!(
                candidate = %candidate,
                attempts,
                "retries exhausted; skipping candidate"
            );
            let diagnostic = outcome.diagnostic().cloned().unwrap_or_default();
            let note = format!("inconclusive after {attempts} attempts");
            (Outcome::skip(demoted(diagnostic, &note)), Some(note))
        } else {
            (outcome, None)
        };

        debug!(candidate = %candidate, %outcome, attempts, "caching outcome");
        let entry = CacheEntry {
            candidate: candidate.clone(),
            outcome: outcome.clone(),
            timestamp: Utc::now(),
            attempts,
            sequence: self.next_sequence,
            note,
        };
        self.next_sequence += 1;
        self.entries.insert(candidate, entry);
        outcome
    }

    /// Record an outcome that was given rather than observed
    pub fn assume(&mut self, candidate: CandidateId, outcome: Outcome) -> Outcome {
        let effective = self.put(candidate.clone(), outcome);
        if let Some(entry) = self.entries.get_mut(&candidate) {
            entry.attempts = 0;
            entry.note = Some("assumed".to_string());
        }
        effective
    }

    /// Forget a candidate so it is built again
    pub fn invalidate(&mut self, candidate: &CandidateId) -> Option<CacheEntry> {
        let removed = self.entries.remove(candidate);
        if removed.is_some() {
            debug!(candidate = %candidate, "invalidated cached outcome");
        }
        removed
    }

    /// Entries in the order they were recorded
    #[must_use]
    pub fn entries(&self) -> Vec<&CacheEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    /// Number of cached candidates
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retry budget for inconclusive candidates
    #[inline]
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

fn demoted(diagnostic: Diagnostic, note: &str) -> Diagnostic {
    let combined = match &diagnostic.note {
        Some(existing) => format!("{existing}; {note}"),
        None => note.to_string(),
    };
    diagnostic.with_note(combined)
}
