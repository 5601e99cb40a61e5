//! Bisection configuration
//!
//! The surface consumed from the CLI / config file. A snapshot of it is
//! persisted with every session so a resumed run behaves identically.

use crate::classifier::ClassifierConfig;
use crate::error::BisectError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which neighbour to try when the natural midpoint cannot be used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipSide {
    /// Closest usable candidate to the midpoint, lower side first on ties
    #[default]
    Nearest,
    /// Walk toward the good bound first
    Lower,
    /// Walk toward the bad bound first
    Upper,
}

/// How the supplied candidate list is ordered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingDirection {
    /// First entry is the known-good end
    #[default]
    OldestFirst,
    /// First entry is the known-bad end (e.g. `git log` order)
    NewestFirst,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BisectConfig {
    /// Wall-clock limit per build, in seconds
    pub timeout_secs: u64,
    /// Retries for an inconclusive candidate before it is skipped
    pub max_retries: u32,
    /// Neighbour selection after a skip
    pub skip_side: SkipSide,
    /// Order of the candidate list
    pub ordering: OrderingDirection,
    /// Build both ends before searching
    pub verify_bounds: bool,
    /// Grace period between SIGTERM and SIGKILL, in milliseconds
    pub kill_grace_ms: u64,
    /// Attempts for each session write
    pub persist_attempts: u32,
    /// Initial backoff between session write attempts, in milliseconds
    pub persist_backoff_ms: u64,
    /// Number of recent tests attached to fatal errors
    pub diagnostic_history: usize,
    /// Capacity of the status event queue
    pub event_buffer: usize,
    /// Shell command that builds one candidate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Working directory for the build command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,
    /// Outcome classification rules
    pub classifier: ClassifierConfig,
}

impl BisectConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With per-build timeout
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// With max retries
    #[inline]
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// With skip side
    #[inline]
    #[must_use]
    pub fn with_skip_side(mut self, side: SkipSide) -> Self {
        self.skip_side = side;
        self
    }

    /// With candidate ordering
    #[inline]
    #[must_use]
    pub fn with_ordering(mut self, ordering: OrderingDirection) -> Self {
        self.ordering = ordering;
        self
    }

    /// With bound verification on or off
    #[inline]
    #[must_use]
    pub fn with_verify_bounds(mut self, verify: bool) -> Self {
        self.verify_bounds = verify;
        self
    }

    /// With build command
    #[inline]
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// With classifier rules
    #[inline]
    #[must_use]
    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    /// With persistence retry policy
    #[inline]
    #[must_use]
    pub fn with_persist_policy(mut self, attempts: u32, backoff: Duration) -> Self {
        self.persist_attempts = attempts;
        self.persist_backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Per-build timeout
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// SIGTERM to SIGKILL grace period
    #[inline]
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Initial persistence backoff
    #[inline]
    #[must_use]
    pub fn persist_backoff(&self) -> Duration {
        Duration::from_millis(self.persist_backoff_ms)
    }

    /// Check the configuration for values the engine cannot work with
    ///
    /// # Errors
    /// Returns `BisectError::Config` for a zero timeout, zero persistence
    /// attempts, an empty event buffer, or invalid classifier patterns.
    pub fn validate(&self) -> Result<(), BisectError> {
        if self.timeout_secs == 0 {
            return Err(BisectError::Config("timeout_secs must be positive".into()));
        }
        if self.persist_attempts == 0 {
            return Err(BisectError::Config(
                "persist_attempts must be at least 1".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(BisectError::Config("event_buffer must be positive".into()));
        }
        self.classifier.validate()
    }
}

impl Default for BisectConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            max_retries: 1,
            skip_side: SkipSide::Nearest,
            ordering: OrderingDirection::OldestFirst,
            verify_bounds: true,
            kill_grace_ms: 5_000,
            persist_attempts: 3,
            persist_backoff_ms: 100,
            diagnostic_history: 5,
            event_buffer: 64,
            command: None,
            workdir: None,
            classifier: ClassifierConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BisectConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.skip_side, SkipSide::Nearest);
        assert_eq!(config.timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn zero_timeout_rejected() {
        let config = BisectConfig {
            timeout_secs: 0,
            ..BisectConfig::default()
        };
        assert!(matches!(config.validate(), Err(BisectError::Config(_))));
    }

    #[test]
    fn builder_methods() {
        let config = BisectConfig::new()
            .with_max_retries(3)
            .with_skip_side(SkipSide::Upper)
            .with_ordering(OrderingDirection::NewestFirst)
            .with_timeout(Duration::from_millis(10))
            .with_command("make");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.skip_side, SkipSide::Upper);
        assert_eq!(config.ordering, OrderingDirection::NewestFirst);
        assert_eq!(config.timeout_secs, 1);
        assert_eq!(config.command.as_deref(), Some("make"));
    }

    #[test]
    fn json_roundtrip_keeps_snapshot() {
        let config = BisectConfig::new().with_skip_side(SkipSide::Lower);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"skip_side\":\"lower\""));
        let back: BisectConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
