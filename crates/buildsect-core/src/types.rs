//! Core types for buildsect
//!
//! Defines the vocabulary shared by every component:
//! - Candidates and their descriptors
//! - Outcomes and failure categories
//! - Search ranges over the candidate space

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of one candidate (a revision hash, a derivation path, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(pub String);

impl CandidateId {
    /// Create a candidate id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines (first 12 characters)
    #[must_use]
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map_or(self.0.len(), |(idx, _)| idx);
        &self.0[..end]
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CandidateId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One addressable unit under test
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    /// Stable identifier
    pub id: CandidateId,
    /// Optional human readable summary (commit subject, attribute name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Candidate {
    /// Create a candidate without summary
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: CandidateId::new(id),
            summary: None,
        }
    }

    /// With summary
    #[inline]
    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// `[abcdef123456] subject` style rendering
    #[must_use]
    pub fn pretty(&self) -> String {
        match &self.summary {
            Some(summary) => format!("[{}] {}", self.id.short(), summary),
            None => format!("[{}]", self.id.short()),
        }
    }
}

/// Serializable view of a candidate handed to the build capability.
///
/// Carries nothing of the engine's internal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDescriptor {
    /// Candidate id
    pub id: CandidateId,
    /// Position in the ordered candidate space
    pub index: usize,
    /// Optional summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Why a build did not simply succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCategory {
    /// The expression or attribute could not be evaluated
    EvaluationError,
    /// The build itself failed
    BuildError,
    /// A dependency failed to build, not the target
    DependencyFailure,
    /// Build failed but without the required failure line
    FailureWithoutLine,
    /// Environment could not carry the build (disk, memory, fetch)
    Environment,
    /// Wall-clock timeout
    Timeout,
    /// Killed by a signal or cancelled
    Killed,
    /// Nothing recognizable in the result
    Ambiguous,
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EvaluationError => "evaluation-error",
            Self::BuildError => "build-error",
            Self::DependencyFailure => "dependency-failure",
            Self::FailureWithoutLine => "failure-without-line",
            Self::Environment => "environment",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
            Self::Ambiguous => "ambiguous",
        };
        f.write_str(name)
    }
}

/// Diagnostic payload attached to an outcome
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Failure category, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureCategory>,
    /// Process exit code, if the process exited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Short excerpt of the build output
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub excerpt: String,
    /// Free-form note (e.g. retry exhaustion)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Diagnostic {
    /// Diagnostic with only a category
    #[inline]
    #[must_use]
    pub fn category(category: FailureCategory) -> Self {
        Self {
            category: Some(category),
            ..Self::default()
        }
    }

    /// With exit code
    #[inline]
    #[must_use]
    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    /// With output excerpt
    #[inline]
    #[must_use]
    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.excerpt = excerpt.into();
        self
    }

    /// With note
    #[inline]
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Discriminant of an [`Outcome`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    /// Candidate does not exhibit the failure
    Good,
    /// Candidate exhibits the failure
    Bad,
    /// Candidate cannot be judged
    Skip,
    /// Result could not be trusted (timeout, flaky)
    Inconclusive,
}

impl OutcomeKind {
    /// Whether this kind narrows the search range
    #[inline]
    #[must_use]
    pub const fn is_decisive(self) -> bool {
        matches!(self, Self::Good | Self::Bad)
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Good => "good",
            Self::Bad => "bad",
            Self::Skip => "skip",
            Self::Inconclusive => "inconclusive",
        };
        f.write_str(name)
    }
}

/// Classified result of testing one candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Outcome {
    /// Builds fine
    Good,
    /// Exhibits the failure
    Bad {
        /// Why it counts as bad
        #[serde(default)]
        diagnostic: Diagnostic,
    },
    /// Cannot be judged; never narrows the range
    Skip {
        /// Named skip range this candidate belongs to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range: Option<String>,
        /// Why it was skipped
        #[serde(default)]
        diagnostic: Diagnostic,
    },
    /// Untrustworthy result, eligible for retry
    Inconclusive {
        /// What made it ambiguous
        #[serde(default)]
        diagnostic: Diagnostic,
    },
}

impl Outcome {
    /// Bad outcome with a diagnostic
    #[inline]
    #[must_use]
    pub fn bad(diagnostic: Diagnostic) -> Self {
        Self::Bad { diagnostic }
    }

    /// Plain skip
    #[inline]
    #[must_use]
    pub fn skip(diagnostic: Diagnostic) -> Self {
        Self::Skip {
            range: None,
            diagnostic,
        }
    }

    /// Skip belonging to a named skip range
    #[inline]
    #[must_use]
    pub fn skip_range(label: impl Into<String>, diagnostic: Diagnostic) -> Self {
        Self::Skip {
            range: Some(label.into()),
            diagnostic,
        }
    }

    /// Inconclusive outcome
    #[inline]
    #[must_use]
    pub fn inconclusive(diagnostic: Diagnostic) -> Self {
        Self::Inconclusive { diagnostic }
    }

    /// Discriminant
    #[must_use]
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Good => OutcomeKind::Good,
            Self::Bad { .. } => OutcomeKind::Bad,
            Self::Skip { .. } => OutcomeKind::Skip,
            Self::Inconclusive { .. } => OutcomeKind::Inconclusive,
        }
    }

    /// Diagnostic payload, if any
    #[must_use]
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            Self::Good => None,
            Self::Bad { diagnostic }
            | Self::Skip { diagnostic, .. }
            | Self::Inconclusive { diagnostic } => Some(diagnostic),
        }
    }

    /// Skip range label, if any
    #[must_use]
    pub fn skip_label(&self) -> Option<&str> {
        match self {
            Self::Skip { range, .. } => range.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip {
                range: Some(label), ..
            } => write!(f, "skip-range({label})"),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Bounds of the search, as positions in the candidate space.
///
/// `lower` is the last known-good position, `upper` the first known-bad one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchRange {
    /// Known-good position
    pub lower: usize,
    /// Known-bad position
    pub upper: usize,
}

impl SearchRange {
    /// Create a range
    #[inline]
    #[must_use]
    pub const fn new(lower: usize, upper: usize) -> Self {
        Self { lower, upper }
    }

    /// Number of positions strictly between the bounds
    #[inline]
    #[must_use]
    pub const fn interior_len(&self) -> usize {
        self.upper.saturating_sub(self.lower).saturating_sub(1)
    }

    /// Whether `index` lies strictly between the bounds
    #[inline]
    #[must_use]
    pub const fn contains_strictly(&self, index: usize) -> bool {
        index > self.lower && index < self.upper
    }
}

impl fmt::Display for SearchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.lower, self.upper)
    }
}
