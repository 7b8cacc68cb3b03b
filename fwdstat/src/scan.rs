//! Single forward pass over a forwarder log.
//!
//! The log is read line by line through a buffered reader, optionally through
//! a zstd or gzip decoder, and every line is folded into a [`Tally`]. Lines
//! are decoded lossily, a stray invalid byte does not end the scan.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use serde::{Deserialize, Serialize};
use tokio::{
    fs,
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
};
use tracing::{debug, trace};

use crate::classify::{self, Tally};

/// Errors produced while scanning a log.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The log could not be opened
    #[error("Failed to open log {path:?}: {source}")]
    Open {
        /// Log path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// Reading from the log failed
    #[error("Failed to read line {line}: {source}")]
    Read {
        /// 1-based number of the line being read
        line: u64,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// A line could not be classified
    #[error(transparent)]
    Classify(#[from] classify::Error),
}

/// Compression of the log on disk.
#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// Decide from the file extension
    #[default]
    Auto,
    /// Plain text
    None,
    /// zstd frames
    Zstd,
    /// gzip members
    Gzip,
}

impl Compression {
    /// Resolve [`Compression::Auto`] against `path`. Other variants are
    /// returned unchanged.
    #[must_use]
    pub fn resolve(self, path: &Path) -> Self {
        match self {
            Self::Auto => detect(path),
            other => other,
        }
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "auto" => Ok(Self::Auto),
            "none" => Ok(Self::None),
            "zstd" => Ok(Self::Zstd),
            "gzip" => Ok(Self::Gzip),
            _ => Err(format!(
                "unknown compression {input:?}, expected one of: auto, none, zstd, gzip"
            )),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::None => f.write_str("none"),
            Self::Zstd => f.write_str("zstd"),
            Self::Gzip => f.write_str("gzip"),
        }
    }
}

/// Detects the compression of a log from its file extension.
///
/// Logs rotated by logrotate or similar are commonly `.gz` or `.zst`. Anything
/// else is taken to be plain text.
#[must_use]
pub fn detect(path: &Path) -> Compression {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("zst" | "zstd") => Compression::Zstd,
        Some("gz" | "gzip") => Compression::Gzip,
        _ => Compression::None,
    }
}

/// Scans the log at `path`.
///
/// The file is closed once the scan completes or fails.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read, or if a line
/// carries a malformed numeric capture.
pub async fn scan_path(path: &Path, compression: Compression) -> Result<Tally, Error> {
    let compression = compression.resolve(path);
    debug!(path = %path.display(), %compression, "opening log");
    let file = fs::File::open(path).await.map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match compression {
        Compression::Auto | Compression::None => Box::new(BufReader::new(file)),
        Compression::Zstd => {
            let mut decoder = ZstdDecoder::new(BufReader::new(file));
            decoder.multiple_members(true);
            Box::new(BufReader::new(decoder))
        }
        Compression::Gzip => {
            let mut decoder = GzipDecoder::new(BufReader::new(file));
            decoder.multiple_members(true);
            Box::new(BufReader::new(decoder))
        }
    };

    scan_reader(reader).await
}

/// Scans every line of `reader` into a fresh [`Tally`].
///
/// # Errors
///
/// Returns an error if reading fails or if a line carries a malformed numeric
/// capture.
pub async fn scan_reader<R>(mut reader: R) -> Result<Tally, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut tally = Tally::new();
    let mut buf = Vec::with_capacity(512);
    let mut line_number: u64 = 0;

    loop {
        buf.clear();
        let bytes = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|source| Error::Read {
                line: line_number + 1,
                source,
            })?;
        if bytes == 0 {
            break;
        }
        line_number += 1;

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
        let observed = tally.observe(line, line_number)?;
        if observed > 0 {
            trace!(line_number, observed, "recognized line");
        }
    }

    debug!(
        lines = tally.lines(),
        recognized = tally.recognized_lines(),
        "scan complete"
    );
    Ok(tally)
}
