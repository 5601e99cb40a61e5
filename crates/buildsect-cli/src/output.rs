//! Terminal output and the bisect log file

use anyhow::{Context, Result};
use buildsect_core::{
    log_line, BisectReport, CandidateDescriptor, RecentTest, SessionState, StatusEvent,
};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Log file kept next to the session file
#[must_use]
pub fn log_path(session: &Path) -> PathBuf {
    session.with_extension("log")
}

/// Print events as they arrive and append their log lines to `log`.
/// Cached events are printed but not logged again.
/// Returns the number of events seen once the engine drops its sink.
///
/// # Errors
/// Returns an error if the log file cannot be written.
pub async fn consume_events(mut rx: mpsc::Receiver<StatusEvent>, log: PathBuf) -> Result<u64> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log)
        .await
        .with_context(|| format!("opening log {}", log.display()))?;

    let mut seen = 0_u64;
    while let Some(event) = rx.recv().await {
        seen += 1;
        println!("{}", event_line(&event));
        if event.cached {
            continue;
        }
        let line = event.log_line();
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .with_context(|| format!("writing log {}", log.display()))?;
    }
    file.flush().await?;
    Ok(seen)
}

/// Terminal line for one event
#[must_use]
pub fn event_line(event: &StatusEvent) -> String {
    let mut line = event.log_line();
    if event.cached {
        line.push_str(" (cached)");
    }
    if event.progress.suspects > 1 {
        let _ = write!(line, "\n{}", event.progress);
    }
    line
}

fn describe(candidate: &CandidateDescriptor) -> String {
    match &candidate.summary {
        Some(summary) => format!("{} ({summary})", candidate.id),
        None => candidate.id.to_string(),
    }
}

/// Final report text
#[must_use]
pub fn render_report(report: &BisectReport) -> String {
    let mut out = String::new();
    match report {
        BisectReport::Converged {
            last_good,
            first_bad,
            undecided,
            builds,
        } => {
            if undecided.is_empty() {
                let _ = writeln!(out, "{} is the first bad candidate", describe(first_bad));
            } else {
                let _ = writeln!(
                    out,
                    "There are only skipped candidates left to test.\n\
                     The first bad candidate could be any of:"
                );
                for candidate in undecided.iter().chain(std::iter::once(first_bad)) {
                    let _ = writeln!(out, "  {}", describe(candidate));
                }
            }
            let _ = writeln!(out, "last good: {}", describe(last_good));
            let _ = writeln!(out, "builds run: {builds}");
        }
        BisectReport::NoTransitionFound {
            lower,
            lower_outcome,
            upper,
            upper_outcome,
            builds,
        } => {
            let _ = writeln!(out, "No good to bad transition found.");
            let _ = writeln!(out, "  {lower_outcome}: {}", describe(lower));
            let _ = writeln!(out, "  {upper_outcome}: {}", describe(upper));
            let _ = writeln!(out, "builds run: {builds}");
        }
    }
    out
}

/// Recently tested candidates attached to a fatal error
#[must_use]
pub fn render_recent(recent: &[RecentTest]) -> String {
    let mut out = String::new();
    if recent.is_empty() {
        return out;
    }
    let _ = writeln!(out, "recently tested:");
    for test in recent {
        let _ = writeln!(out, "  {} {}", test.outcome, test.candidate);
        for line in test.excerpt.lines() {
            let _ = writeln!(out, "    | {line}");
        }
    }
    out
}

/// Session summary for `status`
///
/// # Errors
/// Returns an error if the stored candidates no longer form a valid space.
pub fn render_status(state: &SessionState) -> Result<String> {
    let space = state.space()?;
    let range = state.range;
    let mut out = String::new();
    let _ = writeln!(out, "session {} ({:?})", state.run_id, state.status);
    let _ = writeln!(out, "started {}", state.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(out, "candidates: {}", state.candidates.len());
    let _ = writeln!(
        out,
        "good: {}",
        describe(&space.descriptor(range.lower)?)
    );
    let _ = writeln!(out, "bad:  {}", describe(&space.descriptor(range.upper)?));
    let _ = writeln!(out, "tested: {}", state.entries.len());
    if !state.status.is_terminal() {
        let _ = writeln!(out, "{}", space.progress(&range));
    }
    Ok(out)
}

/// Bisect log reconstructed from the session, in test order
#[must_use]
pub fn render_log(state: &SessionState) -> String {
    let mut out = String::new();
    for entry in &state.entries {
        let summary = state
            .candidates
            .iter()
            .find(|c| c.id == entry.candidate)
            .and_then(|c| c.summary.as_deref());
        out.push_str(&log_line(&entry.outcome, &entry.candidate, summary));
        if let Some(note) = &entry.note {
            let _ = write!(out, " ({note})");
        }
        out.push('\n');
    }
    out
}
