//! Configuration file loading and flag overrides

use crate::cli::Overrides;
use anyhow::{Context, Result};
use buildsect_core::{BisectConfig, OrderingDirection};
use std::path::Path;

/// Read a TOML configuration, or the defaults when no file is given
///
/// # Errors
/// Returns an error if the file cannot be read or parsed.
pub fn load(path: Option<&Path>) -> Result<BisectConfig> {
    let Some(path) = path else {
        return Ok(BisectConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse(&text).with_context(|| format!("parsing config {}", path.display()))
}

/// Parse a TOML configuration
///
/// # Errors
/// Returns an error on syntax errors or unknown keys.
pub fn parse(text: &str) -> Result<BisectConfig> {
    Ok(toml::from_str(text)?)
}

/// Apply command-line overrides and validate the result
///
/// # Errors
/// Returns an error if the combined configuration is invalid.
pub fn apply(mut config: BisectConfig, overrides: &Overrides) -> Result<BisectConfig> {
    if let Some(secs) = overrides.timeout_secs {
        config.timeout_secs = secs;
    }
    if let Some(retries) = overrides.max_retries {
        config.max_retries = retries;
    }
    if let Some(side) = overrides.skip_side {
        config.skip_side = side;
    }
    if overrides.newest_first {
        config.ordering = OrderingDirection::NewestFirst;
    }
    if overrides.no_verify {
        config.verify_bounds = false;
    }
    if let Some(line) = &overrides.failure_line {
        config.classifier.failure_line = Some(line.clone());
    }
    if let Some(dir) = &overrides.workdir {
        config.workdir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildsect_core::SkipSide;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_is_default() {
        assert_eq!(parse("").unwrap(), BisectConfig::default());
    }

    #[test]
    fn file_values_are_read() {
        let config = parse(
            r#"
            timeout_secs = 900
            max_retries = 2
            skip_side = "upper"
            ordering = "newest-first"
            command = "nix build .#pkg"

            [classifier]
            failure_line = "error: tests failed"
            skip_patterns = ["No space left on device"]
            "#,
        )
        .unwrap();
        assert_eq!(config.timeout_secs, 900);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.skip_side, SkipSide::Upper);
        assert_eq!(config.ordering, OrderingDirection::NewestFirst);
        assert_eq!(config.command.as_deref(), Some("nix build .#pkg"));
        assert_eq!(
            config.classifier.failure_line.as_deref(),
            Some("error: tests failed")
        );
        assert_eq!(config.classifier.skip_patterns, vec!["No space left on device"]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse("timeout = 5").is_err());
    }

    #[test]
    fn flags_override_the_file() {
        let file = parse("timeout_secs = 900\nverify_bounds = true").unwrap();
        let overrides = Overrides {
            timeout_secs: Some(30),
            no_verify: true,
            skip_side: Some(SkipSide::Lower),
            ..Overrides::default()
        };
        let config = apply(file, &overrides).unwrap();
        assert_eq!(config.timeout_secs, 30);
        assert!(!config.verify_bounds);
        assert_eq!(config.skip_side, SkipSide::Lower);
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load(Some(Path::new("/nonexistent/buildsect.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/buildsect.toml"));
    }
}
