//! Outcome classifier
//!
//! Turns a [`RawResult`] into an [`Outcome`] in two steps:
//! 1. derive a [`BuildStatus`] from the termination and the output tail
//! 2. map the status through the [`ActionPolicy`]
//!
//! Classification is a pure function of the configuration and the raw
//! result. The result cache and resumed sessions depend on that.

pub mod signatures;

use crate::error::BisectError;
use crate::runner::{RawResult, Termination};
use crate::types::{Diagnostic, FailureCategory, Outcome};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lines of output kept in an outcome's diagnostic excerpt
const EXCERPT_LINES: usize = 10;

/// What happened to the build, before any bisection decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    /// Build succeeded
    Success,
    /// Build failed (with the failure line, if one is required)
    Failure,
    /// Build failed without the required failure line
    FailureWithoutLine,
    /// A dependency failed
    DependencyFailure,
    /// Evaluation / instantiation failed
    EvaluationFailure,
    /// Environment or resource limit
    ResourceLimit,
    /// Timed out
    Timeout,
    /// Killed by a signal or cancelled
    Killed,
    /// The build script asked for a skip
    SkipRequested,
    /// The build script asked for a skip range
    SkipRangeRequested,
    /// Nothing recognizable
    Unrecognized,
}

impl BuildStatus {
    /// Every status
    pub const ALL: [Self; 11] = [
        Self::Success,
        Self::Failure,
        Self::FailureWithoutLine,
        Self::DependencyFailure,
        Self::EvaluationFailure,
        Self::ResourceLimit,
        Self::Timeout,
        Self::Killed,
        Self::SkipRequested,
        Self::SkipRangeRequested,
        Self::Unrecognized,
    ];

    fn category(self) -> Option<FailureCategory> {
        match self {
            Self::Success | Self::SkipRequested | Self::SkipRangeRequested => None,
            Self::Failure => Some(FailureCategory::BuildError),
            Self::FailureWithoutLine => Some(FailureCategory::FailureWithoutLine),
            Self::DependencyFailure => Some(FailureCategory::DependencyFailure),
            Self::EvaluationFailure => Some(FailureCategory::EvaluationError),
            Self::ResourceLimit => Some(FailureCategory::Environment),
            Self::Timeout => Some(FailureCategory::Timeout),
            Self::Killed => Some(FailureCategory::Killed),
            Self::Unrecognized => Some(FailureCategory::Ambiguous),
        }
    }

    /// Whether a decisive action would hide real ambiguity
    #[inline]
    #[must_use]
    pub const fn is_ambiguous(self) -> bool {
        matches!(self, Self::Timeout | Self::Killed | Self::Unrecognized)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::FailureWithoutLine => "failure-without-line",
            Self::DependencyFailure => "dependency-failure",
            Self::EvaluationFailure => "evaluation-failure",
            Self::ResourceLimit => "resource-limit",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
            Self::SkipRequested => "skip",
            Self::SkipRangeRequested => "skip-range",
            Self::Unrecognized => "unrecognized",
        };
        f.write_str(name)
    }
}

/// Bisection action for a status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Mark good
    Good,
    /// Mark bad
    Bad,
    /// Skip this candidate only
    Skip,
    /// Skip, and treat everything between same-status skips as skipped
    SkipRange,
    /// Retry, then skip
    Inconclusive,
}

/// Status to action mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActionPolicy {
    /// Action on success
    pub on_success: Action,
    /// Action on failure
    pub on_failure: Action,
    /// Action on failure without the required line
    pub on_failure_without_line: Action,
    /// Action on dependency failure
    pub on_dependency_failure: Action,
    /// Action on evaluation failure
    pub on_evaluation_failure: Action,
    /// Action on resource limit
    pub on_resource_limit: Action,
    /// Action on timeout
    pub on_timeout: Action,
    /// Action on killed builds
    pub on_killed: Action,
    /// Action on unrecognized results
    pub on_unrecognized: Action,
}

impl ActionPolicy {
    /// Action for a status
    #[must_use]
    pub fn action(&self, status: BuildStatus) -> Action {
        match status {
            BuildStatus::Success => self.on_success,
            BuildStatus::Failure => self.on_failure,
            BuildStatus::FailureWithoutLine => self.on_failure_without_line,
            BuildStatus::DependencyFailure => self.on_dependency_failure,
            BuildStatus::EvaluationFailure => self.on_evaluation_failure,
            BuildStatus::ResourceLimit => self.on_resource_limit,
            BuildStatus::Timeout => self.on_timeout,
            BuildStatus::Killed => self.on_killed,
            BuildStatus::SkipRequested => Action::Skip,
            BuildStatus::SkipRangeRequested => Action::SkipRange,
            BuildStatus::Unrecognized => self.on_unrecognized,
        }
    }
}

impl Default for ActionPolicy {
    fn default() -> Self {
        Self {
            on_success: Action::Good,
            on_failure: Action::Bad,
            on_failure_without_line: Action::SkipRange,
            on_dependency_failure: Action::SkipRange,
            on_evaluation_failure: Action::SkipRange,
            on_resource_limit: Action::Skip,
            on_timeout: Action::Inconclusive,
            on_killed: Action::Inconclusive,
            on_unrecognized: Action::Inconclusive,
        }
    }
}

/// Classification rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    /// Exit codes that mean success
    pub good_exit_codes: Vec<i32>,
    /// Exit code a build script uses to request a skip
    pub skip_exit_code: Option<i32>,
    /// Exit code a build script uses to request a skip range
    pub skip_range_exit_code: Option<i32>,
    /// Exit code a build script uses to stop the whole bisection
    pub abort_exit_code: Option<i32>,
    /// Literal line that must appear in the output for a failure to count
    pub failure_line: Option<String>,
    /// Include the built-in signatures
    pub default_signatures: bool,
    /// Extra environment-failure patterns
    pub skip_patterns: Vec<String>,
    /// Extra evaluation-failure patterns
    pub evaluation_patterns: Vec<String>,
    /// Extra dependency-failure patterns
    pub dependency_patterns: Vec<String>,
    /// Status to action mapping
    pub actions: ActionPolicy,
}

impl ClassifierConfig {
    /// With required failure line
    #[inline]
    #[must_use]
    pub fn with_failure_line(mut self, line: impl Into<String>) -> Self {
        self.failure_line = Some(line.into());
        self
    }

    /// With action policy
    #[inline]
    #[must_use]
    pub fn with_actions(mut self, actions: ActionPolicy) -> Self {
        self.actions = actions;
        self
    }

    /// Reject uncompilable patterns and ambiguous statuses mapped to decisive actions
    ///
    /// # Errors
    /// Returns `BisectError::Config` describing the first problem found.
    pub fn validate(&self) -> Result<(), BisectError> {
        Classifier::new(self.clone()).map(|_| ())
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            good_exit_codes: vec![0],
            skip_exit_code: Some(125),
            skip_range_exit_code: Some(129),
            abort_exit_code: Some(128),
            failure_line: None,
            default_signatures: true,
            skip_patterns: Vec::new(),
            evaluation_patterns: Vec::new(),
            dependency_patterns: Vec::new(),
            actions: ActionPolicy::default(),
        }
    }
}

/// Compiled classifier
#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
    environment: RegexSet,
    evaluation: RegexSet,
    dependency: RegexSet,
    build_failure: RegexSet,
    build_timeout: RegexSet,
}

impl Classifier {
    /// Compile a classifier
    ///
    /// # Errors
    /// Returns `BisectError::Config` for an invalid pattern, or when a
    /// timeout, killed or unrecognized status is mapped to good or bad.
    pub fn new(config: ClassifierConfig) -> Result<Self, BisectError> {
        for status in BuildStatus::ALL.into_iter().filter(|s| s.is_ambiguous()) {
            if matches!(config.actions.action(status), Action::Good | Action::Bad) {
                return Err(BisectError::Config(format!(
                    "status `{status}` cannot be mapped to good or bad"
                )));
            }
        }

        let defaults = config.default_signatures;
        let compile = |builtin: &[&str], extra: &[String]| -> Result<RegexSet, BisectError> {
            let builtin = builtin.iter().filter(|_| defaults).map(|p| (*p).to_string());
            let patterns: Vec<String> = builtin.chain(extra.iter().cloned()).collect();
            RegexSet::new(&patterns).map_err(|e| BisectError::Config(format!("invalid pattern: {e}")))
        };

        Ok(Self {
            environment: compile(signatures::ENVIRONMENT, &config.skip_patterns)?,
            evaluation: compile(signatures::EVALUATION_FAILURE, &config.evaluation_patterns)?,
            dependency: compile(signatures::DEPENDENCY_FAILURE, &config.dependency_patterns)?,
            build_failure: compile(signatures::BUILD_FAILURE, &[])?,
            build_timeout: compile(signatures::BUILD_TIMEOUT, &[])?,
            config,
        })
    }

    /// Rules this classifier was built from
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Whether the build script asked to stop the bisection.
    /// Such a result is never classified or cached.
    #[must_use]
    pub fn abort_requested(&self, raw: &RawResult) -> bool {
        match raw.termination {
            Termination::Exited(code) => self.config.abort_exit_code == Some(code),
            _ => false,
        }
    }

    /// Derive the build status
    #[must_use]
    pub fn status(&self, raw: &RawResult) -> BuildStatus {
        let code = match raw.termination {
            Termination::TimedOut => return BuildStatus::Timeout,
            Termination::Cancelled | Termination::Signaled(_) => return BuildStatus::Killed,
            Termination::Exited(code) => code,
        };

        if self.config.good_exit_codes.contains(&code) {
            return BuildStatus::Success;
        }
        if self.config.skip_exit_code == Some(code) {
            return BuildStatus::SkipRequested;
        }
        if self.config.skip_range_exit_code == Some(code) {
            return BuildStatus::SkipRangeRequested;
        }

        let output = raw.combined_output();
        if self.environment.is_match(&output) {
            return BuildStatus::ResourceLimit;
        }
        if self.build_timeout.is_match(&output) {
            return BuildStatus::Timeout;
        }
        if self.evaluation.is_match(&output) {
            return BuildStatus::EvaluationFailure;
        }
        if self.dependency.is_match(&output) {
            return BuildStatus::DependencyFailure;
        }

        let recognized_failure = (1..128).contains(&code) || self.build_failure.is_match(&output);
        if !recognized_failure {
            return BuildStatus::Unrecognized;
        }
        match &self.config.failure_line {
            Some(line) if !output.contains(line.as_str()) => BuildStatus::FailureWithoutLine,
            _ => BuildStatus::Failure,
        }
    }

    /// Classify a raw result
    #[must_use]
    pub fn classify(&self, raw: &RawResult) -> Outcome {
        let status = self.status(raw);
        self.outcome_for(status, raw)
    }

    /// Outcome for an already derived status
    #[must_use]
    pub fn outcome_for(&self, status: BuildStatus, raw: &RawResult) -> Outcome {
        let diagnostic = Diagnostic {
            category: status.category(),
            exit_code: raw.termination.exit_code(),
            excerpt: raw.excerpt(EXCERPT_LINES),
            note: Some(format!("build status: {status}")),
        };

        match self.config.actions.action(status) {
            Action::Good => Outcome::Good,
            Action::Bad => Outcome::bad(diagnostic),
            Action::Skip => Outcome::skip(diagnostic),
            Action::SkipRange => Outcome::skip_range(status.to_string(), diagnostic),
            Action::Inconclusive => Outcome::inconclusive(diagnostic),
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default()).unwrap_or_else(|e| {
            unreachable!("built-in signatures must compile: {e}")
        })
    }
}
