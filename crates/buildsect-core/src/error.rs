//! Error types for buildsect
//!
//! Only infrastructure failures are errors. A candidate whose build fails is
//! data (a `Bad` outcome), and a range without a transition is a report, not
//! an error.

use crate::engine::EngineState;
use crate::types::{CandidateId, OutcomeKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ordering and range invariant violations. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CandidateSpaceError {
    /// Nothing to search between the bounds
    #[error("empty range: need at least two candidates, got {0}")]
    EmptyRange(usize),

    /// A narrowing step would invert the bounds
    #[error("invalid ordering: {outcome} at position {index} contradicts range [{lower}..{upper}]")]
    InvalidOrdering {
        /// Position that was classified
        index: usize,
        /// Outcome that was applied
        outcome: OutcomeKind,
        /// Lower bound at the time
        lower: usize,
        /// Upper bound at the time
        upper: usize,
    },

    /// Candidate id is not part of the space
    #[error("unknown candidate: {0}")]
    UnknownCandidate(CandidateId),

    /// Candidate id appears twice in the ordering
    #[error("duplicate candidate: {0}")]
    DuplicateCandidate(CandidateId),

    /// Position outside the candidate space
    #[error("position {index} out of bounds for {len} candidates")]
    OutOfBounds {
        /// Requested position
        index: usize,
        /// Number of candidates
        len: usize,
    },

    /// Candidate list differs from the one the session was recorded with
    #[error("candidate ordering changed: session fingerprint {expected}, current {actual}")]
    OrderingChanged {
        /// Fingerprint stored in the session
        expected: String,
        /// Fingerprint of the current space
        actual: String,
    },

    /// Dependency graph contains a cycle
    #[error("dependency graph has a cycle through {0}")]
    CyclicGraph(CandidateId),
}

/// The environment cannot execute builds at all
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Build process could not be launched
    #[error("runner unavailable: failed to launch `{command}`: {source}")]
    Unavailable {
        /// Program or shell line that failed to start
        command: String,
        /// Spawn error
        #[source]
        source: std::io::Error,
    },

    /// I/O failure while supervising a running build
    #[error("runner io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session store read or write failure
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// File system error
    #[error("session io error at {path}: {source}")]
    Io {
        /// Location that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Encoding or decoding failed
    #[error("session encoding error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Session was written by an unknown schema version
    #[error("unsupported session version {found} (supported: {supported})")]
    UnsupportedSessionVersion {
        /// Version found on disk
        found: u32,
        /// Version this build understands
        supported: u32,
    },

    /// Writes kept failing after bounded retries
    #[error("session store failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Number of attempts made
        attempts: u32,
        /// Last error message
        last: String,
    },
}

impl PersistenceError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the operation can help
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Summary of one recently tested candidate, attached to fatal errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentTest {
    /// Candidate id
    pub candidate: CandidateId,
    /// Outcome kind
    pub outcome: OutcomeKind,
    /// Output excerpt, possibly empty
    pub excerpt: String,
}

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum BisectError {
    /// Candidate space invariant violated
    #[error("candidate space error: {0}")]
    CandidateSpace(#[from] CandidateSpaceError),

    /// Builds cannot run
    #[error("{0}")]
    Runner(#[from] RunnerError),

    /// Session store failure
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Engine asked to move between incompatible states
    #[error("illegal engine transition: {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state
        from: EngineState,
        /// Requested state
        to: EngineState,
    },

    /// Run was cancelled; the session holds the last persisted state
    #[error("bisection interrupted")]
    Interrupted,

    /// The build script exited with the abort code
    #[error("build of {candidate} requested abort (exit code {code})")]
    Aborted {
        /// Candidate being built
        candidate: CandidateId,
        /// Exit code observed
        code: i32,
    },

    /// Fatal error with the last few tested candidates
    #[error("{error} (after {} recent candidates)", .recent.len())]
    WithDiagnostics {
        /// Underlying error
        error: Box<BisectError>,
        /// Most recent tests, oldest first
        recent: Vec<RecentTest>,
    },
}

impl BisectError {
    /// Whether the run cannot continue
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Interrupted => false,
            Self::WithDiagnostics { error, .. } => error.is_fatal(),
            _ => true,
        }
    }

    /// Whether retrying the failed operation may help
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Persistence(e) => e.is_transient(),
            Self::WithDiagnostics { error, .. } => error.is_retryable(),
            _ => false,
        }
    }

    /// Strip a diagnostics wrapper
    #[must_use]
    pub fn root(&self) -> &BisectError {
        match self {
            Self::WithDiagnostics { error, .. } => error.root(),
            other => other,
        }
    }

    /// Attach the recent test history
    #[must_use]
    pub fn with_diagnostics(self, recent: Vec<RecentTest>) -> Self {
        match self {
            Self::Interrupted | Self::WithDiagnostics { .. } => self,
            error => Self::WithDiagnostics {
                error: Box::new(error),
                recent,
            },
        }
    }
}

/// Result type alias
pub type BisectResult<T> = Result<T, BisectError>;
