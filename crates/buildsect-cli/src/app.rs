//! Subcommand execution

use crate::cli::{Action, Cli, RunArgs, Source};
use crate::output;
use crate::settings;
use crate::sources;
use anyhow::{bail, Context, Result};
use buildsect_core::{
    BisectConfig, BisectEngine, BisectError, BisectReport, BuildCapability, CancelToken,
    CandidateId, CandidateSpace, CommandRunner, EventSink, FileSessionStore, OrderingDirection,
    SessionState, SessionStore,
};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Exit code for errors
pub const FAILURE_CODE: i32 = 1;

/// How a successful invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Converged, or a maintenance command finished
    Success,
    /// The endpoints did not bracket a transition
    NoTransition,
    /// Stopped by the user; the session can be resumed
    Interrupted,
}

impl Exit {
    /// Process exit code
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::NoTransition => 2,
            Self::Interrupted => 130,
        }
    }

    /// Exit for a finished bisection
    #[must_use]
    pub fn from_report(report: &BisectReport) -> Self {
        match report {
            BisectReport::Converged { .. } => Self::Success,
            BisectReport::NoTransitionFound { .. } => Self::NoTransition,
        }
    }
}

/// Run a parsed invocation
///
/// # Errors
/// Returns any fatal error; the caller maps it to [`FAILURE_CODE`].
pub async fn execute(cli: Cli) -> Result<Exit> {
    let session = cli.session;
    match cli.action {
        Action::Run(args) => run(&session, args).await,
        Action::Resume { command } => resume(&session, command).await,
        Action::Status => {
            let state = load_existing(&session)?;
            print!("{}", output::render_status(&state)?);
            Ok(Exit::Success)
        }
        Action::Forget { candidates } => {
            forget(&session, &candidates)?;
            Ok(Exit::Success)
        }
        Action::Log => {
            let state = load_existing(&session)?;
            print!("{}", output::render_log(&state));
            Ok(Exit::Success)
        }
        Action::Reset => {
            reset(&session)?;
            println!("session removed");
            Ok(Exit::Success)
        }
    }
}

async fn run(session: &Path, args: RunArgs) -> Result<Exit> {
    let mut config = settings::apply(settings::load(args.config.as_deref())?, &args.overrides)?;
    if let Some(command) = args.command {
        config.command = Some(command);
    }

    let candidates = match &args.source {
        Source::Git { repo, good, bad } => {
            if config.ordering == OrderingDirection::NewestFirst {
                warn!("git ranges are always enumerated oldest first; ignoring --newest-first");
                config.ordering = OrderingDirection::OldestFirst;
            }
            if config.workdir.is_none() {
                config.workdir = Some(repo.clone());
            }
            sources::git_candidates(repo, good, bad).await?
        }
        Source::File(path) => sources::file_candidates(path)?,
    };
    let space = CandidateSpace::new(candidates, config.ordering)?;
    let store = open_store(session)?;

    let engine = match store.load()? {
        Some(existing) if !args.force && existing.fingerprint == space.fingerprint() => {
            if existing.config != config {
                warn!("session was started with a different configuration; keeping the recorded one");
            }
            info!(run_id = %existing.run_id, "continuing existing session");
            let capability = capability(&existing.config)?;
            BisectEngine::resume(existing, capability, store.clone())?
        }
        Some(existing) if !args.force => {
            bail!(
                "session {} at {} was recorded for a different candidate list \
                 (fingerprint {}); run `buildsect reset` or pass --force",
                existing.run_id,
                session.display(),
                existing.fingerprint
            )
        }
        previous => {
            if previous.is_some() {
                warn!("discarding session for a different candidate list");
                discard_log(session)?;
            }
            store.clear()?;
            let capability = capability(&config)?;
            BisectEngine::from_space(space, config, capability, store.clone())?
        }
    };
    drive(engine, session).await
}

async fn resume(session: &Path, command: Option<String>) -> Result<Exit> {
    let mut state = load_existing(session)?;
    if let Some(command) = command {
        info!(%command, "replacing recorded build command");
        state.config.command = Some(command);
    }
    let store = open_store(session)?;
    let capability = capability(&state.config)?;
    let engine = BisectEngine::resume(state, capability, store)?;
    drive(engine, session).await
}

fn forget(session: &Path, candidates: &[String]) -> Result<()> {
    let store = open_store(session)?;
    let mut state = load_existing(session)?;
    let mut forgotten = 0_usize;
    for id in candidates {
        if state.forget(&CandidateId::new(id.as_str())) {
            forgotten += 1;
        } else {
            warn!(candidate = %id, "no cached outcome");
        }
    }
    if forgotten > 0 {
        store.save(&state)?;
    }
    println!("forgot {forgotten} candidate(s); bounds now {}", state.range);
    Ok(())
}

fn reset(session: &Path) -> Result<()> {
    FileSessionStore::new(session).clear()?;
    discard_log(session)
}

fn discard_log(session: &Path) -> Result<()> {
    let log = output::log_path(session);
    match std::fs::remove_file(&log) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", log.display())),
    }
}

fn open_store(session: &Path) -> Result<Arc<FileSessionStore>> {
    if let Some(dir) = session.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    Ok(Arc::new(FileSessionStore::new(session)))
}

fn load_existing(session: &Path) -> Result<SessionState> {
    FileSessionStore::new(session)
        .load()?
        .with_context(|| format!("no session at {}", session.display()))
}

fn capability(config: &BisectConfig) -> Result<Arc<dyn BuildCapability>> {
    let template = config
        .command
        .clone()
        .context("no build command: pass --command or set `command` in the config file")?;
    let mut runner = CommandRunner::new(template).with_kill_grace(config.kill_grace());
    if let Some(dir) = &config.workdir {
        runner = runner.with_workdir(dir.clone());
    }
    Ok(Arc::new(runner))
}

async fn drive(engine: BisectEngine, session: &Path) -> Result<Exit> {
    let (sink, rx) = EventSink::channel(engine.session().config.event_buffer);
    let mut engine = engine.with_events(sink);
    let printer = tokio::spawn(output::consume_events(rx, output::log_path(session)));

    let cancel = CancelToken::new();
    let watcher = watch_interrupt(cancel.clone());
    let result = engine.run(&cancel).await;
    watcher.abort();
    // closes the event channel
    drop(engine);

    match printer.await.context("event printer stopped")? {
        Ok(events) => info!(events, "event stream closed"),
        Err(e) => warn!(error = %format!("{e:#}"), "bisect log incomplete"),
    }

    match result {
        Ok(report) => {
            print!("{}", output::render_report(&report));
            Ok(Exit::from_report(&report))
        }
        Err(BisectError::Interrupted) => {
            eprintln!("bisection interrupted; continue with `buildsect resume`");
            Ok(Exit::Interrupted)
        }
        Err(BisectError::WithDiagnostics { error, recent }) => {
            eprint!("{}", output::render_recent(&recent));
            Err(anyhow::Error::new(*error))
        }
        Err(e) => Err(e.into()),
    }
}

fn watch_interrupt(cancel: CancelToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping the running build");
            cancel.cancel();
        }
    })
}
