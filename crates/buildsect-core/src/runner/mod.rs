//! Build runner
//!
//! The build itself is an opaque capability: anything implementing
//! [`BuildCapability`] can be bisected. [`BuildRunner`] wraps a capability
//! with a hard deadline and cancellation, so a misbehaving capability can
//! never hang the search.

pub mod command;

pub use command::CommandRunner;

use crate::error::RunnerError;
use crate::types::CandidateDescriptor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How a build invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "kebab-case")]
pub enum Termination {
    /// Process exited with a status code
    Exited(i32),
    /// Process was terminated by a signal it did not expect
    Signaled(i32),
    /// Deadline reached; the process group was killed
    TimedOut,
    /// Cancellation requested; the process group was killed
    Cancelled,
}

impl Termination {
    /// Exit code, if the process exited on its own
    #[inline]
    #[must_use]
    pub const fn exit_code(self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(code),
            _ => None,
        }
    }
}

/// Unclassified result of one build invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResult {
    /// How the invocation ended
    pub termination: Termination,
    /// Last lines of standard output
    #[serde(default)]
    pub stdout_tail: Vec<String>,
    /// Last lines of standard error
    #[serde(default)]
    pub stderr_tail: Vec<String>,
    /// Wall-clock duration
    #[serde(default)]
    pub duration_ms: u64,
}

impl RawResult {
    /// Result with no output
    #[inline]
    #[must_use]
    pub fn new(termination: Termination) -> Self {
        Self {
            termination,
            stdout_tail: Vec::new(),
            stderr_tail: Vec::new(),
            duration_ms: 0,
        }
    }

    /// With standard output (split into lines)
    #[must_use]
    pub fn with_stdout(mut self, output: &str) -> Self {
        self.stdout_tail = output.lines().map(str::to_string).collect();
        self
    }

    /// With standard error (split into lines)
    #[must_use]
    pub fn with_stderr(mut self, output: &str) -> Self {
        self.stderr_tail = output.lines().map(str::to_string).collect();
        self
    }

    /// With duration
    #[inline]
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Standard output followed by standard error
    #[must_use]
    pub fn combined_output(&self) -> String {
        self.stdout_tail
            .iter()
            .chain(&self.stderr_tail)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Last `lines` lines of standard error, or of standard output when
    /// standard error is empty
    #[must_use]
    pub fn excerpt(&self, lines: usize) -> String {
        let source = if self.stderr_tail.is_empty() {
            &self.stdout_tail
        } else {
            &self.stderr_tail
        };
        let start = source.len().saturating_sub(lines);
        source[start..].join("\n")
    }
}

/// Shared cancellation signal, awaitable from async code
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a new non-cancelled token
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Signal cancellation
    pub fn cancel(&self) {
        self.state.send_replace(true);
    }

    /// Check if cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolve once cancellation has been requested
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // the sender lives as long as `self`, so this only returns on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// External build/evaluation capability
///
/// Implementations must kill their whole process tree on timeout or
/// cancellation and report it through [`Termination`]. Failing to launch
/// at all is `RunnerError::Unavailable`.
#[async_trait::async_trait]
pub trait BuildCapability: Send + Sync {
    /// Build one candidate
    async fn invoke(
        &self,
        descriptor: &CandidateDescriptor,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<RawResult, RunnerError>;
}

/// Deadline-enforcing wrapper around a capability
#[derive(Clone)]
pub struct BuildRunner {
    capability: Arc<dyn BuildCapability>,
    grace: Duration,
}

impl BuildRunner {
    /// Wrap a capability
    #[must_use]
    pub fn new(capability: Arc<dyn BuildCapability>) -> Self {
        Self {
            capability,
            grace: Duration::from_secs(5),
        }
    }

    /// With the grace period granted past the deadline
    #[inline]
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run one build.
    ///
    /// A capability that overruns `timeout` by more than twice the grace
    /// period is abandoned and reported as timed out. Abandoning drops the
    /// capability's future; [`CommandRunner`] then kills its whole process
    /// group.
    ///
    /// # Errors
    /// Propagates `RunnerError` from the capability.
    pub async fn run(
        &self,
        descriptor: &CandidateDescriptor,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<RawResult, RunnerError> {
        if cancel.is_cancelled() {
            return Ok(RawResult::new(Termination::Cancelled));
        }

        let backstop = timeout + self.grace * 2;
        let invocation = self.capability.invoke(descriptor, timeout, cancel);
        match tokio::time::timeout(backstop, invocation).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    candidate = %descriptor.id,
                    "build capability ignored its deadline; abandoning after {:?}",
                    backstop
                );
                Ok(RawResult::new(Termination::TimedOut).with_duration(backstop))
            }
        }
    }
}

impl std::fmt::Debug for BuildRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildRunner")
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}
