//! Bisection engine
//!
//! Drives the search loop: propose a midpoint, consult the cache, build,
//! classify, record, narrow, persist, report. One candidate is in flight at a
//! time; the cache and the session are only touched from this loop.
//!
//! Ordering per tested candidate:
//! 1. the outcome is recorded in the [`ResultCache`]
//! 2. the range is narrowed in memory
//! 3. cache and range are written to the [`SessionStore`] in one atomic save
//! 4. a [`StatusEvent`] is enqueued
//!
//! A run killed at any point therefore resumes without rebuilding a
//! candidate whose outcome was already observed.

/// Engine lifecycle state machine
pub mod state;

pub use state::{allowed_transitions, validate_transition, EngineState};

use crate::cache::{Lookup, ResultCache};
use crate::candidate::CandidateSpace;
use crate::classifier::{BuildStatus, Classifier};
use crate::config::BisectConfig;
use crate::error::{BisectError, BisectResult, CandidateSpaceError, PersistenceError, RecentTest};
use crate::events::{EventSink, StatusEvent};
use crate::runner::{BuildCapability, BuildRunner, CancelToken};
use crate::session::{SessionState, SessionStatus, SessionStore};
use crate::types::{Candidate, CandidateDescriptor, Outcome, OutcomeKind, SearchRange};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Final answer of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum BisectReport {
    /// Adjacent good/bad pair in the usable order
    Converged {
        /// Last known-good candidate
        last_good: CandidateDescriptor,
        /// First known-bad candidate
        first_bad: CandidateDescriptor,
        /// Skipped candidates between the two that could still be first bad
        undecided: Vec<CandidateDescriptor>,
        /// Builds run by this process
        builds: u64,
    },
    /// The endpoints do not bracket a good to bad transition
    NoTransitionFound {
        /// Known-good end
        lower: CandidateDescriptor,
        /// Outcome observed (or assumed) there
        lower_outcome: OutcomeKind,
        /// Known-bad end
        upper: CandidateDescriptor,
        /// Outcome observed (or assumed) there
        upper_outcome: OutcomeKind,
        /// Builds run by this process
        builds: u64,
    },
}

impl BisectReport {
    /// True when no skipped candidate could be the real first bad
    #[must_use]
    pub fn is_exact(&self) -> bool {
        match self {
            Self::Converged { undecided, .. } => undecided.is_empty(),
            Self::NoTransitionFound { .. } => false,
        }
    }

    /// Builds run by this process
    #[must_use]
    pub fn builds(&self) -> u64 {
        match self {
            Self::Converged { builds, .. } | Self::NoTransitionFound { builds, .. } => *builds,
        }
    }
}

/// Bisection engine
pub struct BisectEngine {
    config: BisectConfig,
    space: CandidateSpace,
    cache: ResultCache,
    classifier: Classifier,
    runner: BuildRunner,
    store: Arc<dyn SessionStore>,
    events: EventSink,
    session: SessionState,
    range: SearchRange,
    state: EngineState,
    recent: VecDeque<RecentTest>,
    builds: u64,
}

impl BisectEngine {
    /// Start a new run over a candidate list.
    ///
    /// The list is ordered according to `config.ordering`.
    ///
    /// # Errors
    /// Invalid configuration or candidate list.
    pub fn new(
        candidates: Vec<Candidate>,
        config: BisectConfig,
        capability: Arc<dyn BuildCapability>,
        store: Arc<dyn SessionStore>,
    ) -> BisectResult<Self> {
        let space = CandidateSpace::new(candidates, config.ordering)?;
        Self::from_space(space, config, capability, store)
    }

    /// Start a new run over an already ordered space (e.g. a linearized graph)
    ///
    /// # Errors
    /// Invalid configuration.
    pub fn from_space(
        space: CandidateSpace,
        config: BisectConfig,
        capability: Arc<dyn BuildCapability>,
        store: Arc<dyn SessionStore>,
    ) -> BisectResult<Self> {
        config.validate()?;
        let space = space.with_skip_side(config.skip_side);
        let range = space.bounds();
        let session = SessionState::new(
            space.candidates().to_vec(),
            space.fingerprint(),
            range,
            config.clone(),
        );
        info!(
            run_id = %session.run_id,
            candidates = space.len(),
            "starting bisection"
        );
        Self::assemble(config, space, session, capability, store, EngineState::Initializing)
    }

    /// Continue a persisted run with the configuration it was started with
    ///
    /// # Errors
    /// - `OrderingChanged` if the stored candidates do not match the fingerprint
    /// - `UnknownCandidate` if a cached entry names a foreign candidate
    /// - `InvalidOrdering` if the stored bounds do not fit the space
    pub fn resume(
        session: SessionState,
        capability: Arc<dyn BuildCapability>,
        store: Arc<dyn SessionStore>,
    ) -> BisectResult<Self> {
        let config = session.config.clone();
        config.validate()?;

        let space = session.space()?;
        let bounds = space.bounds();
        let range = session.range;
        if range.lower >= range.upper || range.upper > bounds.upper {
            return Err(CandidateSpaceError::InvalidOrdering {
                index: range.upper,
                outcome: OutcomeKind::Bad,
                lower: range.lower,
                upper: bounds.upper,
            }
            .into());
        }

        info!(
            run_id = %session.run_id,
            entries = session.entries.len(),
            range = %range,
            "resuming bisection"
        );
        let mut engine =
            Self::assemble(config, space, session, capability, store, EngineState::Suspended)?;
        engine.range = range;
        Ok(engine)
    }

    fn assemble(
        config: BisectConfig,
        space: CandidateSpace,
        session: SessionState,
        capability: Arc<dyn BuildCapability>,
        store: Arc<dyn SessionStore>,
        state: EngineState,
    ) -> BisectResult<Self> {
        let classifier = Classifier::new(config.classifier.clone())?;
        let runner = BuildRunner::new(capability).with_grace(config.kill_grace());
        let cache = ResultCache::from_entries(session.entries.iter().cloned(), config.max_retries);
        Ok(Self {
            range: space.bounds(),
            recent: VecDeque::with_capacity(config.diagnostic_history),
            config,
            space,
            cache,
            classifier,
            runner,
            store,
            events: EventSink::disabled(),
            session,
            state,
            builds: 0,
        })
    }

    /// With a status event sink
    #[must_use]
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Current lifecycle state
    #[inline]
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Current bounds
    #[inline]
    #[must_use]
    pub fn range(&self) -> SearchRange {
        self.range
    }

    /// Ordered candidate space
    #[inline]
    #[must_use]
    pub fn space(&self) -> &CandidateSpace {
        &self.space
    }

    /// Outcome cache
    #[inline]
    #[must_use]
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Session as last persisted
    #[inline]
    #[must_use]
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Builds run so far by this engine
    #[inline]
    #[must_use]
    pub fn builds(&self) -> u64 {
        self.builds
    }

    /// Run until convergence, a negative result, cancellation or a fatal error.
    ///
    /// # Errors
    /// - `Interrupted` when `cancel` fires; the session keeps its last saved state
    /// - fatal errors, wrapped with the most recent tests
    pub async fn run(&mut self, cancel: &CancelToken) -> BisectResult<BisectReport> {
        match self.drive(cancel).await {
            Ok(report) => Ok(report),
            Err(BisectError::Interrupted) => {
                warn!(range = %self.range, "bisection interrupted");
                if self.state != EngineState::Suspended {
                    self.transition(EngineState::Suspended)?;
                }
                Err(BisectError::Interrupted)
            }
            Err(e) => {
                error!("bisection failed: {e}");
                Err(e.with_diagnostics(self.recent.iter().cloned().collect()))
            }
        }
    }

    async fn drive(&mut self, cancel: &CancelToken) -> BisectResult<BisectReport> {
        if self.state == EngineState::Suspended {
            self.transition(EngineState::Searching)?;
        }
        self.persist().await?;

        if let Some(report) = self.establish_bounds(cancel).await? {
            self.session.status = SessionStatus::NoTransition;
            self.persist().await?;
            self.transition(EngineState::Reported)?;
            return Ok(report);
        }
        if self.state == EngineState::Initializing {
            self.transition(EngineState::Searching)?;
        }

        while let Some(index) = self.space.midpoint(&self.range) {
            if cancel.is_cancelled() {
                return Err(BisectError::Interrupted);
            }
            self.step(index, cancel).await?;
        }

        self.transition(EngineState::Converged)?;
        self.session.status = SessionStatus::Converged;
        self.persist().await?;
        let report = self.converged_report()?;
        self.transition(EngineState::Reported)?;
        Ok(report)
    }

    /// Verify (or assume) the endpoints. Returns a report when they do not
    /// bracket a transition.
    async fn establish_bounds(&mut self, cancel: &CancelToken) -> BisectResult<Option<BisectReport>> {
        let bounds = self.space.bounds();
        let (lower, upper) = if self.config.verify_bounds {
            let lower = self.settle(bounds.lower, cancel).await?;
            let upper = self.settle(bounds.upper, cancel).await?;
            (lower, upper)
        } else {
            let lower = self.assume(bounds.lower, Outcome::Good)?;
            let upper = self.assume(bounds.upper, Outcome::bad(Default::default()))?;
            self.persist().await?;
            (lower, upper)
        };

        if lower == OutcomeKind::Good && upper == OutcomeKind::Bad {
            return Ok(None);
        }
        warn!(%lower, %upper, "endpoints do not bracket a transition");
        Ok(Some(BisectReport::NoTransitionFound {
            lower: self.space.descriptor(bounds.lower)?,
            lower_outcome: lower,
            upper: self.space.descriptor(bounds.upper)?,
            upper_outcome: upper,
            builds: self.builds,
        }))
    }

    /// Test an endpoint until its outcome is no longer inconclusive
    async fn settle(&mut self, index: usize, cancel: &CancelToken) -> BisectResult<OutcomeKind> {
        loop {
            if cancel.is_cancelled() {
                return Err(BisectError::Interrupted);
            }
            let (outcome, cached) = self.attempt(index, cancel).await?;
            if !cached {
                self.persist().await?;
            }
            self.emit(index, &outcome, self.range, cached)?;
            if outcome.kind() != OutcomeKind::Inconclusive {
                return Ok(outcome.kind());
            }
        }
    }

    fn assume(&mut self, index: usize, outcome: Outcome) -> BisectResult<OutcomeKind> {
        let descriptor = self.space.descriptor(index)?;
        let effective = match self.cache.get(&descriptor.id) {
            Some(recorded) => recorded.clone(),
            None => self.cache.assume(descriptor.id, outcome),
        };
        Ok(effective.kind())
    }

    /// One search iteration at `index`
    async fn step(&mut self, index: usize, cancel: &CancelToken) -> BisectResult<()> {
        let (outcome, cached) = self.attempt(index, cancel).await?;
        let before = self.range;
        match self.space.narrow(before, index, &outcome) {
            Ok(after) => self.range = after,
            Err(e) => {
                // keep the offending outcome on disk for inspection
                if let Err(persist) = self.persist().await {
                    warn!("could not save session after ordering violation: {persist}");
                }
                return Err(e.into());
            }
        }
        self.persist().await?;
        self.emit(index, &outcome, before, cached)
    }

    /// Produce the effective outcome for a candidate, building it if needed.
    /// Returns whether the outcome came from the cache.
    async fn attempt(&mut self, index: usize, cancel: &CancelToken) -> BisectResult<(Outcome, bool)> {
        let descriptor = self.space.descriptor(index)?;
        match self.cache.lookup(&descriptor.id) {
            Lookup::Hit(outcome) => {
                debug!(candidate = %descriptor.id, %outcome, "cache hit");
                return Ok((outcome.clone(), true));
            }
            Lookup::Retry { attempts } => {
                debug!(candidate = %descriptor.id, attempts, "retrying inconclusive candidate");
            }
            Lookup::Miss => {}
        }

        info!(
            candidate = %descriptor.id,
            index,
            "{}",
            self.space.progress(&self.range)
        );
        let raw = self
            .runner
            .run(&descriptor, self.config.timeout(), cancel)
            .await?;
        if cancel.is_cancelled() {
            // a killed build says nothing about the candidate
            return Err(BisectError::Interrupted);
        }
        if self.classifier.abort_requested(&raw) {
            warn!(candidate = %descriptor.id, "build script requested abort");
            return Err(BisectError::Aborted {
                candidate: descriptor.id,
                code: raw.termination.exit_code().unwrap_or_default(),
            });
        }
        self.builds += 1;

        let status = self.classifier.status(&raw);
        if status == BuildStatus::Unrecognized {
            warn!(
                candidate = %descriptor.id,
                termination = ?raw.termination,
                "build result matches no known signature; treating as inconclusive"
            );
        }
        let observed = self.classifier.outcome_for(status, &raw);
        let outcome = self.cache.put(descriptor.id.clone(), observed);
        info!(candidate = %descriptor.id, %status, %outcome, duration_ms = raw.duration_ms, "tested");

        self.remember(RecentTest {
            candidate: descriptor.id,
            outcome: outcome.kind(),
            excerpt: outcome.diagnostic().map(|d| d.excerpt.clone()).unwrap_or_default(),
        });
        Ok((outcome, false))
    }

    fn remember(&mut self, test: RecentTest) {
        if self.config.diagnostic_history == 0 {
            return;
        }
        if self.recent.len() == self.config.diagnostic_history {
            self.recent.pop_front();
        }
        self.recent.push_back(test);
    }

    fn emit(
        &self,
        index: usize,
        outcome: &Outcome,
        before: SearchRange,
        cached: bool,
    ) -> BisectResult<()> {
        self.events.emit(StatusEvent {
            candidate: self.space.descriptor(index)?,
            outcome: outcome.clone(),
            range_before: before,
            range_after: self.range,
            progress: self.space.progress(&self.range),
            cached,
        });
        Ok(())
    }

    fn converged_report(&self) -> BisectResult<BisectReport> {
        let undecided = self
            .space
            .undecided(&self.range)
            .into_iter()
            .map(|idx| self.space.descriptor(idx))
            .collect::<Result<Vec<_>, _>>()?;
        let last_good = self.space.descriptor(self.range.lower)?;
        let first_bad = self.space.descriptor(self.range.upper)?;
        if undecided.is_empty() {
            info!(first_bad = %first_bad.id, builds = self.builds, "{} is the first bad candidate", first_bad.id);
        } else {
            info!(
                first_bad = %first_bad.id,
                undecided = undecided.len(),
                "only skipped candidates left to test"
            );
        }
        Ok(BisectReport::Converged {
            last_good,
            first_bad,
            undecided,
            builds: self.builds,
        })
    }

    fn transition(&mut self, to: EngineState) -> BisectResult<()> {
        validate_transition(self.state, to)?;
        debug!(from = ?self.state, to = ?to, "engine transition");
        self.state = to;
        Ok(())
    }

    /// Save cache and range, retrying transient failures with backoff
    async fn persist(&mut self) -> BisectResult<()> {
        self.session.range = self.range;
        self.session.entries = self.cache.entries().into_iter().cloned().collect();
        self.session.updated_at = Utc::now();

        let attempts = self.config.persist_attempts.max(1);
        let mut delay = self.config.persist_backoff();
        let mut attempt = 1;
        loop {
            match self.store.save(&self.session) {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_transient() => return Err(e.into()),
                Err(e) if attempt >= attempts => {
                    error!("giving up on session save: {e}");
                    return Err(PersistenceError::Exhausted {
                        attempts,
                        last: e.to_string(),
                    }
                    .into());
                }
                Err(e) => {
                    warn!(attempt, "session save failed, retrying in {:?}: {e}", delay);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }
}

impl std::fmt::Debug for BisectEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BisectEngine")
            .field("state", &self.state)
            .field("range", &self.range)
            .field("candidates", &self.space.len())
            .field("cached", &self.cache.len())
            .field("builds", &self.builds)
            .finish_non_exhaustive()
    }
}
