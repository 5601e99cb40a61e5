//! Session state store
//!
//! A session is the durable record of one bisection run: the candidate
//! ordering, the current bounds, every cached outcome and the configuration
//! it ran with. The engine is the only writer. Loads fail closed on any
//! schema version other than [`SESSION_SCHEMA_VERSION`].

use crate::cache::CacheEntry;
use crate::candidate::CandidateSpace;
use crate::config::{BisectConfig, OrderingDirection};
use crate::error::{CandidateSpaceError, PersistenceError};
use crate::types::{Candidate, CandidateId, OutcomeKind, SearchRange};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Schema version written by this build
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// Lifecycle of a persisted run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    /// Search in progress or interrupted
    Active,
    /// Converged to an adjacent pair
    Converged,
    /// Endpoints did not bracket a transition
    NoTransition,
}

impl SessionStatus {
    /// Whether the run is finished
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Persisted form of a bisection run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Schema version tag
    pub schema_version: u32,
    /// Unique id of the run
    pub run_id: Uuid,
    /// Lifecycle status
    pub status: SessionStatus,
    /// When the run started
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
    /// SHA-256 of the candidate ordering
    pub fingerprint: String,
    /// Candidate ordering, known-good end first
    pub candidates: Vec<Candidate>,
    /// Current bounds
    pub range: SearchRange,
    /// Cached outcomes, in recording order
    pub entries: Vec<CacheEntry>,
    /// Configuration snapshot
    pub config: BisectConfig,
}

impl SessionState {
    /// Fresh session for a candidate ordering
    #[must_use]
    pub fn new(
        candidates: Vec<Candidate>,
        fingerprint: String,
        range: SearchRange,
        config: BisectConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            run_id: Uuid::new_v4(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            fingerprint,
            candidates,
            range,
            entries: Vec::new(),
            config,
        }
    }

    /// Cached entry for a candidate
    #[must_use]
    pub fn entry(&self, candidate: &CandidateId) -> Option<&CacheEntry> {
        self.entries.iter().find(|e| &e.candidate == candidate)
    }

    /// Drop the cached outcome of a candidate and widen the range to what
    /// the remaining outcomes support. Returns whether an entry existed.
    pub fn forget(&mut self, candidate: &CandidateId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.candidate != candidate);
        let removed = self.entries.len() != before;
        if removed {
            self.status = SessionStatus::Active;
            self.range = self.recorded_range();
        }
        removed
    }

    /// Last good and first bad position among the cached outcomes.
    /// Endpoint outcomes never move their own bound.
    #[must_use]
    pub fn recorded_range(&self) -> SearchRange {
        let last = self.candidates.len().saturating_sub(1);
        let mut range = SearchRange::new(0, last);
        for (idx, candidate) in self.candidates.iter().enumerate() {
            match self.entry(&candidate.id).map(|e| e.outcome.kind()) {
                Some(OutcomeKind::Good) if idx < last => range.lower = range.lower.max(idx),
                Some(OutcomeKind::Bad) if idx > 0 => range.upper = range.upper.min(idx),
                _ => {}
            }
        }
        range
    }

    /// Rebuild the candidate space, with skip markers restored
    ///
    /// # Errors
    /// - `OrderingChanged` if the candidates do not match the fingerprint
    /// - `UnknownCandidate` if an entry names a foreign candidate
    pub fn space(&self) -> Result<CandidateSpace, CandidateSpaceError> {
        // stored candidates are already normalized to known-good first
        let mut space = CandidateSpace::new(self.candidates.clone(), OrderingDirection::OldestFirst)?
            .with_skip_side(self.config.skip_side);
        let actual = space.fingerprint();
        if actual != self.fingerprint {
            return Err(CandidateSpaceError::OrderingChanged {
                expected: self.fingerprint.clone(),
                actual,
            });
        }

        for entry in &self.entries {
            let index = space
                .position(&entry.candidate)
                .ok_or_else(|| CandidateSpaceError::UnknownCandidate(entry.candidate.clone()))?;
            if entry.outcome.kind() == OutcomeKind::Skip {
                space.narrow(self.range, index, &entry.outcome)?;
            }
        }
        Ok(space)
    }

    /// Encode as JSON
    ///
    /// # Errors
    /// Returns `PersistenceError::Serialize` if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode from JSON, rejecting unknown schema versions
    ///
    /// # Errors
    /// - `UnsupportedSessionVersion` if the version tag is missing or unknown
    /// - `Serialize` for malformed content
    pub fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        let found = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0);
        if found != SESSION_SCHEMA_VERSION {
            return Err(PersistenceError::UnsupportedSessionVersion {
                found,
                supported: SESSION_SCHEMA_VERSION,
            });
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Durable home of a session
pub trait SessionStore: Send + Sync {
    /// Load the stored session, if any
    ///
    /// # Errors
    /// Any `PersistenceError`; an unknown schema version fails closed.
    fn load(&self) -> Result<Option<SessionState>, PersistenceError>;

    /// Replace the stored session atomically
    ///
    /// # Errors
    /// Any `PersistenceError`.
    fn save(&self, state: &SessionState) -> Result<(), PersistenceError>;

    /// Delete the stored session
    ///
    /// # Errors
    /// Any `PersistenceError`.
    fn clear(&self) -> Result<(), PersistenceError>;
}

/// JSON file, replaced atomically on every write
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    /// Store at `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the session file
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn directory(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<SessionState>, PersistenceError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => SessionState::decode(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PersistenceError::io_error(&self.path, e)),
        }
    }

    fn save(&self, state: &SessionState) -> Result<(), PersistenceError> {
        let bytes = state.encode()?;
        let dir = self.directory();
        let io = |e: std::io::Error| PersistenceError::io_error(&self.path, e);

        // a reader sees either the old file or the new one, never a torn write
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io)?;
        tmp.write_all(&bytes).map_err(io)?;
        tmp.as_file().sync_all().map_err(io)?;
        tmp.persist(&self.path).map_err(|e| io(e.error))?;
        tracing::trace!(path = %self.path.display(), "session saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::io_error(&self.path, e)),
        }
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    state: Mutex<Option<SessionState>>,
    writes: Mutex<u64>,
}

impl MemorySessionStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with a session
    #[must_use]
    pub fn with_state(state: SessionState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            writes: Mutex::new(0),
        }
    }

    /// Copy of the stored session
    #[must_use]
    pub fn snapshot(&self) -> Option<SessionState> {
        self.state.lock().clone()
    }

    /// Number of successful saves
    #[must_use]
    pub fn writes(&self) -> u64 {
        *self.writes.lock()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<SessionState>, PersistenceError> {
        let guard = self.state.lock();
        match guard.as_ref() {
            // round-trip through the codec so the version check applies here too
            Some(state) => SessionState::decode(&state.encode()?).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, state: &SessionState) -> Result<(), PersistenceError> {
        *self.state.lock() = Some(state.clone());
        *self.writes.lock() += 1;
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        *self.state.lock() = None;
        Ok(())
    }
}

impl<S: SessionStore + ?Sized> SessionStore for std::sync::Arc<S> {
    fn load(&self) -> Result<Option<SessionState>, PersistenceError> {
        (**self).load()
    }

    fn save(&self, state: &SessionState) -> Result<(), PersistenceError> {
        (**self).save(state)
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        (**self).clear()
    }
}
