//! `buildsect` command-line front end
//!
//! Parses arguments, loads configuration, enumerates candidates from git or
//! a file, and drives [`buildsect_core::BisectEngine`] with a shell build
//! command. Progress goes to stdout and to a log file next to the session.

pub mod app;
pub mod cli;
pub mod logging;
pub mod output;
pub mod settings;
pub mod sources;

pub use app::{execute, Exit, FAILURE_CODE};
pub use cli::{command, parse, Action, Cli};
