//! Error type shared by the library and the command line tool.
//!
//! Library code returns [`KmerError`]; the binary renders it through `miette`
//! so every fatal condition ends with a diagnostic on stderr and a non-zero
//! exit status.

use std::io;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KmerError {
    /// File system failure, with the path and what we were doing to it.
    #[error("I/O error during {operation} on '{}'", .path.display())]
    #[diagnostic(code(merstore::io))]
    Io {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// A block did not start with the expected magic number.
    #[error(
        "bad block magic in '{}' at byte offset {offset}: expected {expected:?}, found {found:?}",
        .path.display()
    )]
    #[diagnostic(
        code(merstore::format::magic),
        help("the file is corrupt, truncated, or was written by an incompatible version")
    )]
    BadMagic {
        path: PathBuf,
        offset: u64,
        expected: String,
        found: String,
    },

    #[error("'{}' is not a k-mer database (index magic {found:?})", .path.display())]
    #[diagnostic(code(merstore::format::version))]
    UnknownFormat { path: PathBuf, found: String },

    #[error("corrupt k-mer database '{}': {detail}", .path.display())]
    #[diagnostic(code(merstore::format))]
    Format { path: PathBuf, detail: String },

    #[error("mer size mismatch in '{}': expected k={expected}, found k={found}", .path.display())]
    #[diagnostic(
        code(merstore::format::mer_size),
        help("all databases given to one operation must use the same k-mer size")
    )]
    MerSizeMismatch {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    #[error("invalid configuration: {0}")]
    #[diagnostic(code(merstore::config))]
    Config(String),

    #[error("failed to read sequence input '{}': {detail}", .path.display())]
    #[diagnostic(code(merstore::input))]
    Input { path: PathBuf, detail: String },

    #[error("counting pipeline failed: {0}")]
    #[diagnostic(code(merstore::pipeline))]
    Pipeline(String),

    #[error("failed to write CSV output")]
    #[diagnostic(code(merstore::csv))]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, KmerError>;

impl KmerError {
    pub fn format(path: &Path, detail: impl Into<String>) -> Self {
        KmerError::Format {
            path: path.to_path_buf(),
            detail: detail.into(),
        }
    }
}

/// Attach a path and an operation name to an `io::Result`.
pub trait IoContext<T> {
    fn io_context(self, path: &Path, operation: &'static str) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context(self, path: &Path, operation: &'static str) -> Result<T> {
        self.map_err(|source| KmerError::Io {
            path: path.to_path_buf(),
            operation,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_context_keeps_path_and_operation() {
        let err: io::Result<()> = Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
        let err = err.io_context(Path::new("/tmp/x.merylData"), "open").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("open"));
        assert!(msg.contains("/tmp/x.merylData"));
    }

    #[test]
    fn bad_magic_reports_offset_and_both_values() {
        let err = KmerError::BadMagic {
            path: PathBuf::from("db/0x000001.merylData"),
            offset: 4096,
            expected: "merylDataFile00\\n".to_string(),
            found: "garbage".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("4096"));
        assert!(msg.contains("garbage"));
        assert!(msg.contains("merylDataFile00"));
    }
}
