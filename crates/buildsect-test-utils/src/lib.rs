//! Testing utilities for the buildsect workspace
//!
//! Scripted build capabilities, candidate fixtures and a store that fails
//! on demand.

#![allow(missing_docs)]

use buildsect_core::{
    BisectConfig, BuildCapability, CancelToken, Candidate, CandidateDescriptor, MemorySessionStore,
    PersistenceError, RawResult, RunnerError, SessionState, SessionStore, Termination,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Output a failing build prints in scripted runs
pub const FAILURE_OUTPUT: &str = "error: builder for '/nix/store/aaaa-pkg.drv' failed with exit code 2";

/// How a scripted candidate behaves
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Exit 0
    Good,
    /// Exit 1 with a build failure signature
    Bad,
    /// Exit 125
    Skip,
    /// Same raw result every time
    Raw(RawResult),
    /// Time out on every attempt
    Inconclusive,
    /// Time out on the first `n` attempts, then behave as given
    FlakyThen(u32, Box<Behavior>),
    /// Cancel the token while building
    CancelRun(CancelToken),
    /// Block until cancelled or timed out
    Hang,
    /// Fail to launch
    Unavailable,
}

/// Build capability driven by a per-candidate script
#[derive(Debug, Clone)]
pub struct ScriptedBuild {
    script: Arc<Mutex<HashMap<usize, Behavior>>>,
    first_bad: Option<usize>,
    calls: Arc<Mutex<Vec<usize>>>,
    cancel_after: Option<(usize, CancelToken)>,
}

impl ScriptedBuild {
    /// Good below `first_bad`, bad from it on
    pub fn transition_at(first_bad: usize) -> Self {
        Self {
            script: Arc::default(),
            first_bad: Some(first_bad),
            calls: Arc::default(),
            cancel_after: None,
        }
    }

    /// Good everywhere unless scripted
    pub fn all_good() -> Self {
        Self {
            script: Arc::default(),
            first_bad: None,
            calls: Arc::default(),
            cancel_after: None,
        }
    }

    /// Override one candidate
    pub fn with(self, index: usize, behavior: Behavior) -> Self {
        self.script.lock().insert(index, behavior);
        self
    }

    /// Cancel `token` instead of running the build after `builds` builds
    pub fn cancel_after(mut self, builds: usize, token: CancelToken) -> Self {
        self.cancel_after = Some((builds, token));
        self
    }

    /// Positions built, in call order
    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().clone()
    }

    /// How often a position was built
    pub fn calls_for(&self, index: usize) -> usize {
        self.calls.lock().iter().filter(|&&i| i == index).count()
    }

    fn attempts_before(&self, index: usize) -> u32 {
        u32::try_from(self.calls_for(index).saturating_sub(1)).unwrap_or(u32::MAX)
    }

    fn default_behavior(&self, index: usize) -> Behavior {
        match self.first_bad {
            Some(first_bad) if index >= first_bad => Behavior::Bad,
            _ => Behavior::Good,
        }
    }

    fn resolve(behavior: Behavior, attempt: u32) -> Behavior {
        match behavior {
            Behavior::FlakyThen(n, then) if attempt >= n => Self::resolve(*then, attempt),
            Behavior::FlakyThen(..) => Behavior::Inconclusive,
            other => other,
        }
    }
}

#[async_trait::async_trait]
impl BuildCapability for ScriptedBuild {
    async fn invoke(
        &self,
        descriptor: &CandidateDescriptor,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<RawResult, RunnerError> {
        let index = descriptor.index;
        if let Some((limit, token)) = &self.cancel_after {
            if self.calls.lock().len() >= *limit {
                token.cancel();
                return Ok(RawResult::new(Termination::Cancelled));
            }
        }
        self.calls.lock().push(index);
        let scripted = self.script.lock().get(&index).cloned();
        let behavior = scripted.unwrap_or_else(|| self.default_behavior(index));

        let raw = match Self::resolve(behavior, self.attempts_before(index)) {
            Behavior::Good => RawResult::new(Termination::Exited(0)),
            Behavior::Bad => RawResult::new(Termination::Exited(1)).with_stderr(FAILURE_OUTPUT),
            Behavior::Skip => RawResult::new(Termination::Exited(125)),
            Behavior::Raw(raw) => raw,
            Behavior::Inconclusive | Behavior::FlakyThen(..) => RawResult::new(Termination::TimedOut),
            Behavior::CancelRun(token) => {
                token.cancel();
                RawResult::new(Termination::Cancelled)
            }
            Behavior::Hang => {
                tokio::select! {
                    () = cancel.cancelled() => RawResult::new(Termination::Cancelled),
                    () = tokio::time::sleep(timeout) => RawResult::new(Termination::TimedOut),
                }
            }
            Behavior::Unavailable => {
                return Err(RunnerError::Unavailable {
                    command: format!("build {}", descriptor.id),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such builder"),
                });
            }
        };
        Ok(raw)
    }
}

/// `n` candidates named `c000`, `c001`, ...
pub fn candidates(n: usize) -> Vec<Candidate> {
    (0..n)
        .map(|i| Candidate::new(format!("c{i:03}")).with_summary(format!("change {i}")))
        .collect()
}

/// Configuration with short timeouts and no backoff
pub fn fast_config() -> BisectConfig {
    let mut config = BisectConfig::default()
        .with_timeout(Duration::from_secs(5))
        .with_persist_policy(3, Duration::from_millis(1));
    config.kill_grace_ms = 50;
    config
}

/// Memory store that fails a number of saves with a transient error
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemorySessionStore,
    failures_left: Mutex<u32>,
    failed: Mutex<u32>,
}

impl FlakyStore {
    /// Fail the next `failures` saves
    pub fn failing(failures: u32) -> Self {
        Self {
            inner: MemorySessionStore::new(),
            failures_left: Mutex::new(failures),
            failed: Mutex::new(0),
        }
    }

    /// Saves that failed so far
    pub fn failed(&self) -> u32 {
        *self.failed.lock()
    }

    /// Copy of the stored session
    pub fn snapshot(&self) -> Option<SessionState> {
        self.inner.snapshot()
    }
}

impl SessionStore for FlakyStore {
    fn load(&self) -> Result<Option<SessionState>, PersistenceError> {
        self.inner.load()
    }

    fn save(&self, state: &SessionState) -> Result<(), PersistenceError> {
        {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                *self.failed.lock() += 1;
                return Err(PersistenceError::io_error(
                    "memory://session",
                    std::io::Error::other("disk unavailable"),
                ));
            }
        }
        self.inner.save(state)
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        self.inner.clear()
    }
}
