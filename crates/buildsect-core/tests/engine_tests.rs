//! Engine scenarios: convergence, skips, retries, interruption, persistence
//!
//! Every test drives a `BisectEngine` against a `ScriptedBuild`, so the
//! build outcome of each position is known up front.

use buildsect_core::{
    BisectConfig, BisectEngine, BisectError, BisectReport, CancelToken, CandidateId,
    CandidateSpaceError, EngineState, EventSink, FileSessionStore, MemorySessionStore, OutcomeKind,
    PersistenceError, RawResult, RunnerError, SearchRange, SessionStatus, SessionStore,
    SkipSide, Termination,
};
use buildsect_test_utils::{candidates, fast_config, Behavior, FlakyStore, ScriptedBuild};
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn engine(
    n: usize,
    config: BisectConfig,
    build: &ScriptedBuild,
    store: Arc<dyn SessionStore>,
) -> BisectEngine {
    BisectEngine::new(candidates(n), config, Arc::new(build.clone()), store).unwrap()
}

fn ids(report: &BisectReport) -> (String, String) {
    match report {
        BisectReport::Converged {
            last_good,
            first_bad,
            ..
        } => (last_good.id.to_string(), first_bad.id.to_string()),
        other => panic!("expected convergence, got {other:?}"),
    }
}

fn undecided(report: &BisectReport) -> Vec<String> {
    match report {
        BisectReport::Converged { undecided, .. } => {
            undecided.iter().map(|d| d.id.to_string()).collect()
        }
        other => panic!("expected convergence, got {other:?}"),
    }
}

fn evaluation_failure() -> Behavior {
    Behavior::Raw(
        RawResult::new(Termination::Exited(1)).with_stderr("error: undefined variable 'pkgs'"),
    )
}

/// Tenet: a clean good to bad history converges to the exact adjacent pair.
#[tokio::test]
async fn converges_to_adjacent_pair() {
    let build = ScriptedBuild::transition_at(6);
    let store = Arc::new(MemorySessionStore::new());
    let mut engine = engine(11, fast_config(), &build, store.clone());

    let report = engine.run(&CancelToken::new()).await.unwrap();

    assert_eq!(ids(&report), ("c005".into(), "c006".into()));
    assert!(report.is_exact());
    // endpoints first, then floor midpoints
    assert_eq!(build.calls(), vec![0, 10, 5, 7, 6]);
    assert_eq!(report.builds(), 5);
    assert_eq!(engine.state(), EngineState::Reported);
    assert_eq!(store.snapshot().unwrap().status, SessionStatus::Converged);
}

/// Tenet: both ends good is a definitive negative result, not a crash.
#[tokio::test]
async fn no_transition_when_both_ends_good() {
    let build = ScriptedBuild::all_good();
    let store = Arc::new(MemorySessionStore::new());
    let mut engine = engine(11, fast_config(), &build, store.clone());

    let report = engine.run(&CancelToken::new()).await.unwrap();

    match report {
        BisectReport::NoTransitionFound {
            lower_outcome,
            upper_outcome,
            ..
        } => {
            assert_eq!(lower_outcome, OutcomeKind::Good);
            assert_eq!(upper_outcome, OutcomeKind::Good);
        }
        other => panic!("expected no transition, got {other:?}"),
    }
    assert_eq!(build.calls(), vec![0, 10]);
    assert_eq!(store.snapshot().unwrap().status, SessionStatus::NoTransition);
}

/// Tenet: an unusable endpoint cannot bracket a transition either.
#[tokio::test]
async fn skipped_endpoint_is_no_transition() {
    let build = ScriptedBuild::transition_at(6).with(0, Behavior::Skip);
    let mut engine = engine(11, fast_config(), &build, Arc::new(MemorySessionStore::new()));

    let report = engine.run(&CancelToken::new()).await.unwrap();
    assert!(matches!(
        report,
        BisectReport::NoTransitionFound {
            lower_outcome: OutcomeKind::Skip,
            ..
        }
    ));
}

/// Tenet: a midpoint that always skips is stepped around, never re-tested.
#[tokio::test]
async fn skip_at_midpoint_uses_neighbour() {
    let build = ScriptedBuild::transition_at(8).with(5, Behavior::Skip);
    let config = fast_config().with_verify_bounds(false);
    let mut engine = engine(11, config, &build, Arc::new(MemorySessionStore::new()));

    let report = engine.run(&CancelToken::new()).await.unwrap();

    assert_eq!(ids(&report), ("c007".into(), "c008".into()));
    assert_eq!(build.calls(), vec![5, 4, 7, 8]);
    assert!(report.is_exact());
}

/// Tenet: a skipped candidate next to the answer is reported as undecided.
#[tokio::test]
async fn skip_next_to_transition_is_undecided() {
    let build = ScriptedBuild::transition_at(6).with(5, Behavior::Skip);
    let config = fast_config().with_verify_bounds(false);
    let mut engine = engine(11, config, &build, Arc::new(MemorySessionStore::new()));

    let report = engine.run(&CancelToken::new()).await.unwrap();

    assert_eq!(ids(&report), ("c004".into(), "c006".into()));
    assert_eq!(undecided(&report), vec!["c005".to_string()]);
    assert!(!report.is_exact());
    assert_eq!(build.calls_for(5), 1);
}

/// Tenet: the skip side decides which neighbour replaces a skipped midpoint.
#[tokio::test]
async fn upper_skip_side_probes_toward_bad() {
    let build = ScriptedBuild::transition_at(8).with(5, Behavior::Skip);
    let config = fast_config()
        .with_verify_bounds(false)
        .with_skip_side(SkipSide::Upper);
    let mut engine = engine(11, config, &build, Arc::new(MemorySessionStore::new()));

    engine.run(&CancelToken::new()).await.unwrap();
    assert_eq!(build.calls()[..2], [5, 6]);
}

/// Tenet: candidates enclosed by a named skip range are never built.
#[tokio::test]
async fn named_skip_range_encloses_untested_candidates() {
    let build = ScriptedBuild::transition_at(12)
        .with(10, evaluation_failure())
        .with(14, evaluation_failure());
    let config = fast_config().with_verify_bounds(false);
    let mut engine = engine(21, config, &build, Arc::new(MemorySessionStore::new()));

    let report = engine.run(&CancelToken::new()).await.unwrap();

    assert_eq!(build.calls(), vec![10, 9, 14, 15]);
    assert_eq!(ids(&report), ("c009".into(), "c015".into()));
    assert_eq!(
        undecided(&report),
        vec!["c010", "c011", "c012", "c013", "c014"]
    );
}

/// Tenet: an always-inconclusive candidate is built 1 + max_retries times,
/// then skipped.
#[tokio::test]
async fn retry_exhaustion_demotes_to_skip() {
    for max_retries in [0_u32, 1, 3] {
        let build = ScriptedBuild::transition_at(8).with(5, Behavior::Inconclusive);
        let config = fast_config()
            .with_verify_bounds(false)
            .with_max_retries(max_retries);
        let mut engine = engine(11, config, &build, Arc::new(MemorySessionStore::new()));

        let report = engine.run(&CancelToken::new()).await.unwrap();

        assert_eq!(build.calls_for(5), max_retries as usize + 1, "max_retries={max_retries}");
        assert_eq!(ids(&report), ("c007".into(), "c008".into()));
        let entry = engine.cache().entry(&CandidateId::new("c005")).unwrap();
        assert_eq!(entry.outcome.kind(), OutcomeKind::Skip);
        assert!(entry.note.as_deref().unwrap().starts_with("inconclusive after"));
    }
}

/// Tenet: a flaky candidate that settles on retry counts with its settled outcome.
#[tokio::test]
async fn flaky_candidate_settles_on_retry() {
    let build = ScriptedBuild::transition_at(8)
        .with(5, Behavior::FlakyThen(1, Box::new(Behavior::Good)));
    let config = fast_config().with_verify_bounds(false);
    let mut engine = engine(11, config, &build, Arc::new(MemorySessionStore::new()));

    engine.run(&CancelToken::new()).await.unwrap();

    assert_eq!(build.calls_for(5), 2);
    let entry = engine.cache().entry(&CandidateId::new("c005")).unwrap();
    assert_eq!(entry.outcome.kind(), OutcomeKind::Good);
    assert_eq!(entry.attempts, 2);
}

/// Tenet: cancellation leaves the last persisted state untouched and the run
/// resumes where it stopped.
#[tokio::test]
async fn cancel_then_resume() {
    let cancel = CancelToken::new();
    let build = ScriptedBuild::transition_at(8).with(7, Behavior::CancelRun(cancel.clone()));
    let store = Arc::new(MemorySessionStore::new());
    let config = fast_config().with_verify_bounds(false);
    let mut first = engine(11, config, &build, store.clone());

    let err = first.run(&cancel).await.unwrap_err();
    assert!(matches!(err, BisectError::Interrupted));
    assert_eq!(first.state(), EngineState::Suspended);
    assert_eq!(first.builds(), 1);

    let saved = store.snapshot().unwrap();
    assert_eq!(saved.range, SearchRange::new(5, 10));
    assert!(saved.entry(&CandidateId::new("c007")).is_none());

    let build = ScriptedBuild::transition_at(8);
    let mut resumed = BisectEngine::resume(saved, Arc::new(build.clone()), store.clone()).unwrap();
    assert_eq!(resumed.state(), EngineState::Suspended);
    let report = resumed.run(&CancelToken::new()).await.unwrap();

    assert_eq!(ids(&report), ("c007".into(), "c008".into()));
    assert_eq!(build.calls(), vec![7, 8]);
}

/// Tenet: a build blocked on I/O is stopped by cancellation.
#[tokio::test]
async fn cancel_stops_hanging_build() {
    let cancel = CancelToken::new();
    let build = ScriptedBuild::transition_at(8).with(5, Behavior::Hang);
    let config = fast_config().with_verify_bounds(false);
    let mut engine = engine(11, config, &build, Arc::new(MemorySessionStore::new()));

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = engine.run(&cancel).await.unwrap_err();
    assert!(matches!(err, BisectError::Interrupted));
    assert!(engine.cache().get(&CandidateId::new("c005")).is_none());
    assert_eq!(engine.builds(), 0);
}

/// Tenet: the abort exit code stops the run without recording the candidate.
#[tokio::test]
async fn abort_exit_code_stops_the_run() {
    let build = ScriptedBuild::transition_at(8)
        .with(5, Behavior::Raw(RawResult::new(Termination::Exited(128))));
    let store = Arc::new(MemorySessionStore::new());
    let config = fast_config().with_verify_bounds(false);
    let mut engine = engine(11, config, &build, store.clone());

    let err = engine.run(&CancelToken::new()).await.unwrap_err();
    assert!(err.is_fatal());
    match err.root() {
        BisectError::Aborted { candidate, code } => {
            assert_eq!(candidate.as_str(), "c005");
            assert_eq!(*code, 128);
        }
        other => panic!("expected abort, got {other:?}"),
    }
    assert_eq!(build.calls_for(5), 1);
    assert_eq!(engine.builds(), 0);
    assert!(engine.cache().get(&CandidateId::new("c005")).is_none());
    let saved = store.snapshot().unwrap();
    assert!(saved.entry(&CandidateId::new("c005")).is_none());
    assert_eq!(saved.status, SessionStatus::Active);
}

/// Tenet: failing to launch the build is fatal and carries recent history.
#[tokio::test]
async fn runner_unavailable_is_fatal_with_diagnostics() {
    let build = ScriptedBuild::transition_at(8).with(5, Behavior::Unavailable);
    let mut engine = engine(11, fast_config(), &build, Arc::new(MemorySessionStore::new()));

    let err = engine.run(&CancelToken::new()).await.unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(
        err.root(),
        BisectError::Runner(RunnerError::Unavailable { .. })
    ));
    match err {
        BisectError::WithDiagnostics { recent, .. } => {
            let tested: Vec<_> = recent.iter().map(|t| t.candidate.to_string()).collect();
            assert_eq!(tested, vec!["c000", "c010"]);
        }
        other => panic!("expected diagnostics, got {other:?}"),
    }
    assert_eq!(build.calls_for(5), 1);
}

/// Tenet: transient persistence failures are retried with backoff.
#[tokio::test]
async fn transient_persistence_failures_are_retried() {
    let build = ScriptedBuild::transition_at(6);
    let store = Arc::new(FlakyStore::failing(2));
    let mut engine = engine(11, fast_config(), &build, store.clone());

    let report = engine.run(&CancelToken::new()).await.unwrap();

    assert_eq!(ids(&report), ("c005".into(), "c006".into()));
    assert_eq!(store.failed(), 2);
    assert_eq!(store.snapshot().unwrap().status, SessionStatus::Converged);
}

/// Tenet: persistence that keeps failing is fatal.
#[tokio::test]
async fn persistent_storage_failure_is_fatal() {
    let build = ScriptedBuild::transition_at(6);
    let store = Arc::new(FlakyStore::failing(u32::MAX));
    let mut engine = engine(11, fast_config(), &build, store);

    let err = engine.run(&CancelToken::new()).await.unwrap_err();
    assert!(matches!(
        err.root(),
        BisectError::Persistence(PersistenceError::Exhausted { attempts: 3, .. })
    ));
    assert!(build.calls().is_empty());
}

/// Tenet: one status event per tested candidate, with before/after ranges.
#[tokio::test]
async fn emits_status_events() {
    let build = ScriptedBuild::transition_at(6);
    let (sink, mut rx) = EventSink::channel(64);
    let mut engine =
        engine(11, fast_config(), &build, Arc::new(MemorySessionStore::new())).with_events(sink);

    engine.run(&CancelToken::new()).await.unwrap();
    drop(engine);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(events.len(), 5);
    assert_eq!(events[2].candidate.id.as_str(), "c005");
    assert_eq!(events[2].range_before, SearchRange::new(0, 10));
    assert_eq!(events[2].range_after, SearchRange::new(5, 10));
    assert_eq!(events[4].range_after, SearchRange::new(5, 6));
    assert!(events.iter().all(|e| !e.cached));
}

/// Tenet: a resumed converged session reports again without rebuilding.
#[tokio::test]
async fn resume_of_finished_session_rebuilds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileSessionStore::new(dir.path().join("session.json")));
    let build = ScriptedBuild::transition_at(6);
    let mut first = engine(11, fast_config(), &build, store.clone());
    let expected = first.run(&CancelToken::new()).await.unwrap();

    let saved = store.load().unwrap().unwrap();
    let rebuild = ScriptedBuild::transition_at(6);
    let mut resumed = BisectEngine::resume(saved, Arc::new(rebuild.clone()), store).unwrap();
    let report = resumed.run(&CancelToken::new()).await.unwrap();

    assert_eq!(ids(&report), ids(&expected));
    assert!(rebuild.calls().is_empty());
}

/// Tenet: forgetting a candidate makes the next run build it again.
#[tokio::test]
async fn forgotten_candidate_is_rebuilt() {
    let store = Arc::new(MemorySessionStore::new());
    let build = ScriptedBuild::transition_at(6);
    let mut first = engine(11, fast_config(), &build, store.clone());
    first.run(&CancelToken::new()).await.unwrap();

    let mut saved = store.snapshot().unwrap();
    assert!(saved.forget(&CandidateId::new("c006")));
    assert_eq!(saved.range, SearchRange::new(5, 7));

    let rebuild = ScriptedBuild::transition_at(6);
    let mut resumed = BisectEngine::resume(saved, Arc::new(rebuild.clone()), store).unwrap();
    resumed.run(&CancelToken::new()).await.unwrap();
    assert_eq!(rebuild.calls(), vec![6]);
}

/// Tenet: a tampered candidate list is refused on resume.
#[tokio::test]
async fn resume_rejects_changed_ordering() {
    let store = Arc::new(MemorySessionStore::new());
    let build = ScriptedBuild::transition_at(6);
    let mut first = engine(11, fast_config(), &build, store.clone());
    first.run(&CancelToken::new()).await.unwrap();

    let mut saved = store.snapshot().unwrap();
    saved.candidates.swap(3, 4);
    let err = BisectEngine::resume(saved, Arc::new(build), store).unwrap_err();
    assert!(matches!(
        err,
        BisectError::CandidateSpace(CandidateSpaceError::OrderingChanged { .. })
    ));
}

/// Tenet: an unknown schema version fails closed.
#[test]
fn unknown_session_version_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    std::fs::write(&path, r#"{"schema_version": 99, "range": {"lower": 0, "upper": 1}}"#).unwrap();

    let err = FileSessionStore::new(&path).load().unwrap_err();
    assert!(matches!(
        err,
        PersistenceError::UnsupportedSessionVersion {
            found: 99,
            supported: 1
        }
    ));
}

/// Tenet: newest-first input is normalized so the good end comes first.
#[tokio::test]
async fn newest_first_ordering() {
    let build = ScriptedBuild::transition_at(6);
    let mut list = candidates(11);
    list.reverse();
    let config = fast_config().with_ordering(buildsect_core::OrderingDirection::NewestFirst);
    let mut engine = BisectEngine::new(
        list,
        config,
        Arc::new(build.clone()),
        Arc::new(MemorySessionStore::new()),
    )
    .unwrap();

    let report = engine.run(&CancelToken::new()).await.unwrap();
    assert_eq!(ids(&report), ("c005".into(), "c006".into()));
}
