//! Command-line surface

use crate::logging::Verbosity;
use anyhow::{bail, Result};
use buildsect_core::SkipSide;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

/// Session file used when `--session` is not given
pub const DEFAULT_SESSION: &str = ".buildsect/session.json";

/// Parsed invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    /// Log verbosity
    pub verbosity: Verbosity,
    /// Disable ANSI colours in logs
    pub no_color: bool,
    /// Session file
    pub session: PathBuf,
    /// Subcommand
    pub action: Action,
}

/// What to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start a bisection, or continue a matching one
    Run(RunArgs),
    /// Continue the stored session
    Resume {
        /// Replacement build command
        command: Option<String>,
    },
    /// Print the stored session
    Status,
    /// Drop cached outcomes
    Forget {
        /// Candidate ids
        candidates: Vec<String>,
    },
    /// Print the bisect log
    Log,
    /// Delete the session and its log
    Reset,
}

/// Arguments of `run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    /// Where the candidate list comes from
    pub source: Source,
    /// Build command template
    pub command: Option<String>,
    /// TOML configuration file
    pub config: Option<PathBuf>,
    /// Flag overrides on top of the file
    pub overrides: Overrides,
    /// Discard an unrelated session instead of refusing
    pub force: bool,
}

/// Candidate list source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// `good..bad` along the ancestry path of a git repository
    Git {
        /// Repository directory
        repo: PathBuf,
        /// Known-good revision
        good: String,
        /// Known-bad revision
        bad: String,
    },
    /// One candidate per line
    File(PathBuf),
}

/// Configuration overrides from flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// `--timeout`
    pub timeout_secs: Option<u64>,
    /// `--max-retries`
    pub max_retries: Option<u32>,
    /// `--skip-side`
    pub skip_side: Option<SkipSide>,
    /// `--newest-first`
    pub newest_first: bool,
    /// `--no-verify`
    pub no_verify: bool,
    /// `--failure-line`
    pub failure_line: Option<String>,
    /// `--workdir`
    pub workdir: Option<PathBuf>,
}

/// Build the clap command tree
#[must_use]
pub fn command() -> Command {
    Command::new("buildsect")
        .version(buildsect_core::VERSION)
        .about("Find the first candidate that breaks a build")
        .subcommand_required(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Show engine progress and build output in logs"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Only log errors"),
        )
        .arg(
            Arg::new("no-color")
                .long("no-color")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Disable coloured log output"),
        )
        .arg(
            Arg::new("session")
                .long("session")
                .global(true)
                .default_value(DEFAULT_SESSION)
                .value_parser(value_parser!(PathBuf))
                .help("Session file"),
        )
        .subcommand(run_command())
        .subcommand(
            Command::new("resume")
                .about("Continue an interrupted bisection")
                .arg(
                    Arg::new("command")
                        .long("command")
                        .help("Replace the recorded build command"),
                ),
        )
        .subcommand(Command::new("status").about("Show the current session"))
        .subcommand(
            Command::new("forget")
                .about("Drop cached outcomes so the candidates are rebuilt")
                .arg(
                    Arg::new("candidates")
                        .required(true)
                        .num_args(1..)
                        .help("Candidate ids"),
                ),
        )
        .subcommand(Command::new("log").about("Print the bisect log"))
        .subcommand(Command::new("reset").about("Delete the session"))
}

fn run_command() -> Command {
    Command::new("run")
        .about("Start a bisection")
        .arg(
            Arg::new("good")
                .long("good")
                .requires("bad")
                .help("Known-good git revision"),
        )
        .arg(
            Arg::new("bad")
                .long("bad")
                .requires("good")
                .help("Known-bad git revision"),
        )
        .arg(
            Arg::new("repo")
                .long("repo")
                .default_value(".")
                .value_parser(value_parser!(PathBuf))
                .help("Git repository"),
        )
        .arg(
            Arg::new("candidates-file")
                .long("candidates-file")
                .conflicts_with_all(["good", "bad"])
                .value_parser(value_parser!(PathBuf))
                .help("File with one candidate per line, known-good first"),
        )
        .arg(
            Arg::new("command")
                .long("command")
                .short('c')
                .help("Build command; {candidate} and {index} are substituted"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_parser(value_parser!(u64).range(1..))
                .help("Per-build timeout in seconds"),
        )
        .arg(
            Arg::new("max-retries")
                .long("max-retries")
                .value_parser(value_parser!(u32))
                .help("Retries for an inconclusive build before skipping it"),
        )
        .arg(
            Arg::new("skip-side")
                .long("skip-side")
                .value_parser(["nearest", "lower", "upper"])
                .help("Neighbour to try when the midpoint is skipped"),
        )
        .arg(
            Arg::new("newest-first")
                .long("newest-first")
                .action(ArgAction::SetTrue)
                .help("Candidate file lists the known-bad end first"),
        )
        .arg(
            Arg::new("no-verify")
                .long("no-verify")
                .action(ArgAction::SetTrue)
                .help("Trust the endpoints instead of building them"),
        )
        .arg(
            Arg::new("failure-line")
                .long("failure-line")
                .help("Only count a failure when this line appears in the output"),
        )
        .arg(
            Arg::new("workdir")
                .long("workdir")
                .value_parser(value_parser!(PathBuf))
                .help("Directory the build command runs in"),
        )
        .arg(
            Arg::new("force")
                .long("force")
                .action(ArgAction::SetTrue)
                .help("Discard a session for a different candidate list"),
        )
}

/// Turn clap matches into a [`Cli`]
///
/// # Errors
/// Returns an error when no subcommand or candidate source was given.
pub fn parse(matches: &ArgMatches) -> Result<Cli> {
    let verbosity = Verbosity::from_flags(matches.get_flag("verbose"), matches.get_flag("quiet"));
    let no_color = matches.get_flag("no-color");
    let session = matches
        .get_one::<PathBuf>("session")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION));

    let action = match matches.subcommand() {
        Some(("run", args)) => Action::Run(parse_run(args)?),
        Some(("resume", args)) => Action::Resume {
            command: args.get_one::<String>("command").cloned(),
        },
        Some(("status", _)) => Action::Status,
        Some(("forget", args)) => Action::Forget {
            candidates: args
                .get_many::<String>("candidates")
                .map(|ids| ids.cloned().collect())
                .unwrap_or_default(),
        },
        Some(("log", _)) => Action::Log,
        Some(("reset", _)) => Action::Reset,
        Some((other, _)) => bail!("unknown subcommand `{other}`"),
        None => bail!("no subcommand given"),
    };

    Ok(Cli {
        verbosity,
        no_color,
        session,
        action,
    })
}

fn parse_run(args: &ArgMatches) -> Result<RunArgs> {
    let source = match (
        args.get_one::<PathBuf>("candidates-file"),
        args.get_one::<String>("good"),
        args.get_one::<String>("bad"),
    ) {
        (Some(file), _, _) => Source::File(file.clone()),
        (None, Some(good), Some(bad)) => Source::Git {
            repo: args
                .get_one::<PathBuf>("repo")
                .cloned()
                .unwrap_or_else(|| PathBuf::from(".")),
            good: good.clone(),
            bad: bad.clone(),
        },
        _ => bail!("give either --good and --bad, or --candidates-file"),
    };

    let skip_side = args
        .get_one::<String>("skip-side")
        .map(|side| match side.as_str() {
            "lower" => SkipSide::Lower,
            "upper" => SkipSide::Upper,
            _ => SkipSide::Nearest,
        });

    Ok(RunArgs {
        source,
        command: args.get_one::<String>("command").cloned(),
        config: args.get_one::<PathBuf>("config").cloned(),
        overrides: Overrides {
            timeout_secs: args.get_one::<u64>("timeout").copied(),
            max_retries: args.get_one::<u32>("max-retries").copied(),
            skip_side,
            newest_first: args.get_flag("newest-first"),
            no_verify: args.get_flag("no-verify"),
            failure_line: args.get_one::<String>("failure-line").cloned(),
            workdir: args.get_one::<PathBuf>("workdir").cloned(),
        },
        force: args.get_flag("force"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_args(args: &[&str]) -> Result<Cli> {
        let matches = command().try_get_matches_from(args)?;
        parse(&matches)
    }

    #[test]
    fn command_tree_is_consistent() {
        command().debug_assert();
    }

    #[test]
    fn run_with_git_range() {
        let cli = parse_args(&[
            "buildsect", "-v", "run", "--good", "v1.0", "--bad", "HEAD", "--command", "make",
            "--timeout", "60", "--skip-side", "upper", "--no-verify",
        ])
        .unwrap();
        assert_eq!(cli.verbosity, Verbosity::Verbose);
        assert_eq!(cli.session, PathBuf::from(DEFAULT_SESSION));
        let Action::Run(run) = cli.action else {
            panic!("expected run");
        };
        assert_eq!(
            run.source,
            Source::Git {
                repo: PathBuf::from("."),
                good: "v1.0".into(),
                bad: "HEAD".into(),
            }
        );
        assert_eq!(run.command.as_deref(), Some("make"));
        assert_eq!(run.overrides.timeout_secs, Some(60));
        assert_eq!(run.overrides.skip_side, Some(SkipSide::Upper));
        assert!(run.overrides.no_verify);
        assert!(!run.force);
    }

    #[test]
    fn run_with_candidate_file() {
        let cli = parse_args(&[
            "buildsect", "run", "--candidates-file", "list.txt", "--session", "/tmp/s.json",
        ])
        .unwrap();
        assert_eq!(cli.session, PathBuf::from("/tmp/s.json"));
        let Action::Run(run) = cli.action else {
            panic!("expected run");
        };
        assert_eq!(run.source, Source::File(PathBuf::from("list.txt")));
    }

    #[test]
    fn run_needs_a_source() {
        assert!(parse_args(&["buildsect", "run", "--command", "make"]).is_err());
        assert!(parse_args(&["buildsect", "run", "--good", "a"]).is_err());
        assert!(parse_args(&[
            "buildsect", "run", "--good", "a", "--bad", "b", "--candidates-file", "x",
        ])
        .is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(parse_args(&["buildsect", "run", "--candidates-file", "x", "--timeout", "0"]).is_err());
    }

    #[test]
    fn forget_takes_several_ids() {
        let cli = parse_args(&["buildsect", "forget", "abc", "def"]).unwrap();
        assert_eq!(
            cli.action,
            Action::Forget {
                candidates: vec!["abc".into(), "def".into()],
            }
        );
    }

    #[test]
    fn maintenance_subcommands() {
        assert_eq!(parse_args(&["buildsect", "status"]).unwrap().action, Action::Status);
        assert_eq!(parse_args(&["buildsect", "log"]).unwrap().action, Action::Log);
        assert_eq!(parse_args(&["buildsect", "reset", "-q"]).unwrap().action, Action::Reset);
        assert_eq!(
            parse_args(&["buildsect", "resume"]).unwrap().action,
            Action::Resume { command: None }
        );
    }
}
