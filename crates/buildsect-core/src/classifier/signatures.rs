//! Default output signatures
//!
//! Recognizes the final error lines of Nix-style builds. Every group can be
//! extended from `ClassifierConfig`.

/// A build step of the target or of a dependency failed
pub const BUILD_FAILURE: &[&str] = &[
    r"builder for '[^']+' failed with exit code \d+",
    r"build of '[^']+'(?:, '[^']+')* failed",
    r"cannot build derivation '[^']+': [^\n]*failed",
];

/// A dependency could not be built, so the target was never attempted
pub const DEPENDENCY_FAILURE: &[&str] = &[
    r"dependencies couldn't be built",
    r"dependency '[^']+' failed",
];

/// The builder hit its own time limit
pub const BUILD_TIMEOUT: &[&str] = &[r"building of '[^']+' timed out after"];

/// The expression could not even be instantiated
pub const EVALUATION_FAILURE: &[&str] = &[
    r"error: while evaluating",
    r"error: undefined variable",
    r"error: attribute '[^']+' missing",
    r"error: (?:syntax error|infinite recursion encountered)",
    r"error: evaluation aborted",
];

/// The machine, not the candidate, is at fault
pub const ENVIRONMENT: &[&str] = &[
    r"No space left on device",
    r"Cannot allocate memory",
    r"unable to download",
    r"Too many open files",
    r"too many rebuilds",
    r"cannot connect to daemon",
];
