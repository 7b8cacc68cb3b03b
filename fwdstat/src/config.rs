//! This module controls configuration parsing from the end user. A run is
//! configured by an optional YAML file with command line flags layered on
//! top. Command line arguments may themselves come from response files, any
//! argument of the form `@path` being replaced by the lines of `path`.
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{
    report::{self, AckReceivedSource, Format},
    scan::Compression,
};

/// Response files may reference other response files up to this depth.
pub const MAX_RESPONSE_FILE_DEPTH: usize = 8;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// Error reading a response file
    #[error("Failed to read response file {path:?}: {source}")]
    ResponseFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// Response files nest deeper than [`MAX_RESPONSE_FILE_DEPTH`]
    #[error("Response file {0:?} nests too deeply, is there a cycle?")]
    ResponseFileDepth(PathBuf),
    /// Batches must have a size
    #[error("batch_megabytes must be greater than zero")]
    ZeroBatchSize,
}

fn default_batch_megabytes() -> u64 {
    5
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Assumed size of one acknowledged batch, in megabytes
    #[serde(default = "default_batch_megabytes")]
    pub batch_megabytes: u64,
    /// Samples behind the "acks received" average
    #[serde(default)]
    pub acks_received_source: AckReceivedSource,
    /// How the report is emitted
    #[serde(default)]
    pub format: Format,
    /// Compression of the scanned log
    #[serde(default)]
    pub compression: Compression,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_megabytes: default_batch_megabytes(),
            acks_received_source: AckReceivedSource::default(),
            format: Format::default(),
            compression: Compression::default(),
        }
    }
}

/// Command line values that take precedence over the configuration file.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Overrides {
    /// Overrides [`Config::batch_megabytes`]
    pub batch_megabytes: Option<u64>,
    /// Overrides [`Config::acks_received_source`]
    pub acks_received_source: Option<AckReceivedSource>,
    /// Overrides [`Config::format`]
    pub format: Option<Format>,
    /// Overrides [`Config::compression`]
    pub compression: Option<Compression>,
}

impl Config {
    /// Parse a configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is malformed, carries unknown fields or
    /// fails validation.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        // An empty document is a valid, entirely defaulted, configuration.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()
    }

    /// Load a configuration from the YAML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Layer command line `overrides` on top of this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the result fails validation.
    pub fn apply(self, overrides: Overrides) -> Result<Self, Error> {
        let config = Self {
            batch_megabytes: overrides.batch_megabytes.unwrap_or(self.batch_megabytes),
            acks_received_source: overrides
                .acks_received_source
                .unwrap_or(self.acks_received_source),
            format: overrides.format.unwrap_or(self.format),
            compression: overrides.compression.unwrap_or(self.compression),
        };
        config.validate()
    }

    fn validate(self) -> Result<Self, Error> {
        if self.batch_megabytes == 0 {
            return Err(Error::ZeroBatchSize);
        }
        Ok(self)
    }

    /// The reduction options this configuration implies.
    #[must_use]
    pub fn report_options(&self) -> report::Options {
        report::Options {
            batch_megabytes: self.batch_megabytes,
            acks_received_source: self.acks_received_source,
        }
    }
}

/// Expand response files in `args`.
///
/// The first argument is the program name and is passed through. Every other
/// argument starting with `@` names a file whose lines replace it, one
/// argument per line. Blank lines are skipped and expansion recurses.
///
/// # Errors
///
/// Returns an error if a response file cannot be read or response files nest
/// deeper than [`MAX_RESPONSE_FILE_DEPTH`].
pub fn expand_args<I>(args: I) -> Result<Vec<OsString>, Error>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter();
    let mut expanded = Vec::new();
    if let Some(program) = args.next() {
        expanded.push(program);
    }
    for arg in args {
        expand_arg(arg, 0, &mut expanded)?;
    }
    Ok(expanded)
}

fn expand_arg(arg: OsString, depth: usize, out: &mut Vec<OsString>) -> Result<(), Error> {
    let Some(path) = arg.to_str().and_then(|a| a.strip_prefix('@')) else {
        out.push(arg);
        return Ok(());
    };
    let path = PathBuf::from(path);
    if depth >= MAX_RESPONSE_FILE_DEPTH {
        return Err(Error::ResponseFileDepth(path));
    }
    let contents = fs::read_to_string(&path).map_err(|source| Error::ResponseFile {
        path: path.clone(),
        source,
    })?;
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        expand_arg(OsString::from(line), depth + 1, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn config_deserializes() {
        let contents = r"
batch_megabytes: 10
acks_received_source: requested
format: json
compression: zstd
";
        let config = Config::from_yaml(contents).expect("config must parse");
        assert_eq!(
            config,
            Config {
                batch_megabytes: 10,
                acks_received_source: AckReceivedSource::Requested,
                format: Format::Json,
                compression: Compression::Zstd,
            },
        );
    }

    #[test]
    fn empty_config_is_default() {
        assert_eq!(Config::from_yaml("").expect("config must parse"), Config::default());
        assert_eq!(
            Config::from_yaml("format: log\n").expect("config must parse"),
            Config {
                format: Format::Log,
                ..Config::default()
            }
        );
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let err = Config::from_yaml("batch_size: 5\n").expect_err("config must fail");
        assert!(matches!(err, Error::SerdeYaml(_)), "unexpected error: {err}");
    }

    #[test]
    fn config_rejects_zero_batch() {
        let err = Config::from_yaml("batch_megabytes: 0\n").expect_err("config must fail");
        assert!(matches!(err, Error::ZeroBatchSize), "unexpected error: {err}");

        let err = Config::default()
            .apply(Overrides {
                batch_megabytes: Some(0),
                ..Overrides::default()
            })
            .expect_err("config must fail");
        assert!(matches!(err, Error::ZeroBatchSize), "unexpected error: {err}");
    }

    #[test]
    fn overrides_take_precedence() {
        let config = Config::from_yaml("batch_megabytes: 10\nformat: json\n")
            .expect("config must parse")
            .apply(Overrides {
                format: Some(Format::Text),
                compression: Some(Compression::Gzip),
                ..Overrides::default()
            })
            .expect("config must validate");
        assert_eq!(config.batch_megabytes, 10);
        assert_eq!(config.format, Format::Text);
        assert_eq!(config.compression, Compression::Gzip);
        assert_eq!(config.acks_received_source, AckReceivedSource::Received);
        assert_eq!(config.report_options().batch_megabytes, 10);
    }

    #[test]
    fn response_file_expands_in_place() {
        let mut file = NamedTempFile::new().expect("create temp file");
        writeln!(file, "--verbose\n\nforwarder.log").expect("write response file");
        file.flush().expect("flush");

        let at = format!("@{}", file.path().display());
        let expanded = expand_args(os(&["fwdstat", "--format", "json", at.as_str()])).expect("expand");
        assert_eq!(
            expanded,
            os(&["fwdstat", "--format", "json", "--verbose", "forwarder.log"])
        );
    }

    #[test]
    fn program_name_is_not_expanded() {
        let expanded = expand_args(os(&["@fwdstat", "log"])).expect("expand");
        assert_eq!(expanded, os(&["@fwdstat", "log"]));
    }

    #[test]
    fn response_files_nest() {
        let mut inner = NamedTempFile::new().expect("create temp file");
        writeln!(inner, "-v").expect("write response file");
        inner.flush().expect("flush");

        let mut outer = NamedTempFile::new().expect("create temp file");
        writeln!(outer, "@{}\nforwarder.log", inner.path().display()).expect("write response file");
        outer.flush().expect("flush");

        let at = format!("@{}", outer.path().display());
        let expanded = expand_args(os(&["fwdstat", at.as_str()])).expect("expand");
        assert_eq!(expanded, os(&["fwdstat", "-v", "forwarder.log"]));
    }

    #[test]
    fn response_file_cycle_hits_depth_limit() {
        let mut file = NamedTempFile::new().expect("create temp file");
        let at = format!("@{}", file.path().display());
        writeln!(file, "{at}").expect("write response file");
        file.flush().expect("flush");

        let err = expand_args(os(&["fwdstat", at.as_str()])).expect_err("expand must fail");
        assert!(matches!(err, Error::ResponseFileDepth(_)), "unexpected error: {err}");
    }

    #[test]
    fn missing_response_file_fails() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let at = format!("@{}", dir.path().join("absent.args").display());
        let err = expand_args(os(&["fwdstat", at.as_str()])).expect_err("expand must fail");
        assert!(matches!(err, Error::ResponseFile { .. }), "unexpected error: {err}");
    }
}
