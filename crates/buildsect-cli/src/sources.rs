//! Candidate list sources

use anyhow::{bail, Context, Result};
use buildsect_core::Candidate;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// First-parent commits on the ancestry path from `good` to `bad`, oldest
/// first, with `good` itself as the first entry
///
/// Side branches are represented by their merge commit, so the list stays
/// a single chain even when the range contains merges.
///
/// # Errors
/// Returns an error if git fails or the revisions do not resolve.
pub async fn git_candidates(repo: &Path, good: &str, bad: &str) -> Result<Vec<Candidate>> {
    let head = git(repo, &["log", "-1", "--format=%H%x09%s", good]).await?;
    let path = git(
        repo,
        &[
            "log",
            "--reverse",
            "--first-parent",
            "--ancestry-path",
            "--format=%H%x09%s",
            &format!("{good}..{bad}"),
        ],
    )
    .await?;

    let mut candidates = parse_git_log(&head);
    let after = parse_git_log(&path);
    if after.is_empty() {
        bail!("`{bad}` is not a descendant of `{good}`");
    }
    candidates.extend(after);
    debug!(count = candidates.len(), "enumerated git candidates");
    Ok(candidates)
}

async fn git(repo: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .await
        .context("running git")?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `%H<TAB>%s` lines
#[must_use]
pub fn parse_git_log(text: &str) -> Vec<Candidate> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.split_once('\t') {
            Some((hash, subject)) if !subject.is_empty() => {
                Candidate::new(hash.trim()).with_summary(subject)
            }
            Some((hash, _)) => Candidate::new(hash.trim()),
            None => Candidate::new(line.trim()),
        })
        .collect()
}

/// Read a candidate file
///
/// # Errors
/// Returns an error if the file cannot be read or lists fewer than two candidates.
pub fn file_candidates(path: &Path) -> Result<Vec<Candidate>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading candidates {}", path.display()))?;
    let candidates = parse_candidate_list(&text);
    if candidates.len() < 2 {
        bail!(
            "{} lists {} candidate(s); at least a good and a bad one are needed",
            path.display(),
            candidates.len()
        );
    }
    Ok(candidates)
}

/// One candidate per line: an id, optionally followed by whitespace and a
/// summary. Blank lines and `#` comments are ignored.
#[must_use]
pub fn parse_candidate_list(text: &str) -> Vec<Candidate> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once(char::is_whitespace) {
            Some((id, summary)) => Candidate::new(id).with_summary(summary.trim()),
            None => Candidate::new(line),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildsect_core::CandidateId;
    use pretty_assertions::assert_eq;

    #[test]
    fn git_log_lines() {
        let parsed = parse_git_log("aaaa\tfirst change\nbbbb\t\n\ncccc\n");
        let ids: Vec<_> = parsed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["aaaa", "bbbb", "cccc"]);
        assert_eq!(parsed[0].summary.as_deref(), Some("first change"));
        assert_eq!(parsed[1].summary, None);
    }

    #[test]
    fn candidate_list_skips_comments() {
        let parsed = parse_candidate_list(
            "# nightly channel bumps\n\
             a1b2c3  python3: 3.11 -> 3.12\n\
             \n\
             d4e5f6\n",
        );
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, CandidateId::new("a1b2c3"));
        assert_eq!(parsed[0].summary.as_deref(), Some("python3: 3.11 -> 3.12"));
        assert_eq!(parsed[1].summary, None);
    }

    #[test]
    fn short_candidate_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.txt");
        std::fs::write(&path, "only-one\n").unwrap();
        assert!(file_candidates(&path).is_err());

        std::fs::write(&path, "good\nbad\n").unwrap();
        assert_eq!(file_candidates(&path).unwrap().len(), 2);
    }
}
