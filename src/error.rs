//! Error types for the Halberd library.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`HalberdError`] enum. The variants follow the failure classes the engine
//! distinguishes at runtime:
//!
//! - per-document failures ([`HalberdError::Analysis`], [`HalberdError::IllegalArgument`])
//!   abort a single document and leave the writer usable,
//! - resource failures ([`HalberdError::Io`], [`HalberdError::Storage`]) abort the
//!   running flush, merge or commit only,
//! - format and corruption failures ([`HalberdError::UnsupportedFormat`],
//!   [`HalberdError::Corruption`]) always reach the caller and carry the offending path,
//! - usage failures ([`HalberdError::AlreadyClosed`], [`HalberdError::Schema`],
//!   [`HalberdError::InvalidOperation`]) are reported at the call site.
//!
//! # Examples
//!
//! ```
//! use halberd::error::{HalberdError, Result};
//!
//! fn example_operation() -> Result<()> {
//!     Err(HalberdError::invalid_argument("Invalid input"))
//! }
//!
//! match example_operation() {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use thiserror::Error;

/// The main error type for Halberd operations.
#[derive(Error, Debug)]
pub enum HalberdError {
    /// I/O errors (file operations, disk full, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Index-related errors
    #[error("Index error: {0}")]
    Index(String),

    /// Schema violations (unknown doc-values field, type change, ...)
    #[error("Schema error: {0}")]
    Schema(String),

    /// Analysis-related errors (tokenization failures)
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// Illegal per-document values (position overflow, oversized terms)
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// A file was written by a format this build cannot handle.
    #[error("Unsupported format in {path}: {detail}")]
    UnsupportedFormat { path: String, detail: String },

    /// Checksum mismatch or truncated file.
    #[error("Corrupt index file {path}: {detail}")]
    Corruption { path: String, detail: String },

    /// No commit could be found in the storage.
    #[error("No index found: {0}")]
    IndexNotFound(String),

    /// The writer or reader has been closed.
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// Invalid operation (illegal state transition, bad call order)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A running merge was aborted by rollback or close.
    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    /// A merge failed; `cause` is the root failure.
    #[error("Merge failed: {message}: {cause}")]
    Merge {
        message: String,
        #[source]
        cause: Box<HalberdError>,
    },

    /// Lock acquisition failed
    #[error("Lock obtain failed: {0}")]
    LockObtainFailed(String),

    /// Thread join errors
    #[error("Thread join error: {0}")]
    ThreadJoinError(String),

    /// Binary serialization errors
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with HalberdError.
pub type Result<T> = std::result::Result<T, HalberdError>;

impl HalberdError {
    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        HalberdError::Index(msg.into())
    }

    /// Create a new schema error.
    pub fn schema<S: Into<String>>(msg: S) -> Self {
        HalberdError::Schema(msg.into())
    }

    /// Create a new analysis error.
    pub fn analysis<S: Into<String>>(msg: S) -> Self {
        HalberdError::Analysis(msg.into())
    }

    /// Create a new illegal argument error.
    pub fn illegal_argument<S: Into<String>>(msg: S) -> Self {
        HalberdError::IllegalArgument(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        HalberdError::Storage(msg.into())
    }

    /// A missing file, reported as an I/O `NotFound` so [`Self::is_not_found`] sees it.
    pub fn file_not_found<S: AsRef<str>>(name: S) -> Self {
        HalberdError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("file not found: {}", name.as_ref()),
        ))
    }

    pub fn lock_obtain_failed<S: Into<String>>(name: S) -> Self {
        HalberdError::LockObtainFailed(name.into())
    }

    /// Create a new unsupported format error for `path`.
    pub fn unsupported_format<P: Into<String>, S: Into<String>>(path: P, detail: S) -> Self {
        HalberdError::UnsupportedFormat {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create a new corruption error for `path`.
    pub fn corruption<P: Into<String>, S: Into<String>>(path: P, detail: S) -> Self {
        HalberdError::Corruption {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Create a new already-closed error.
    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        HalberdError::AlreadyClosed(msg.into())
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        HalberdError::InvalidOperation(msg.into())
    }

    /// Create a new merge-aborted error.
    pub fn merge_aborted<S: Into<String>>(msg: S) -> Self {
        HalberdError::MergeAborted(msg.into())
    }

    /// Wrap the root cause of a failed merge.
    pub fn merge<S: Into<String>>(msg: S, cause: HalberdError) -> Self {
        HalberdError::Merge {
            message: msg.into(),
            cause: Box::new(cause),
        }
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        HalberdError::Other(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        HalberdError::Other(format!("Invalid argument: {}", msg.into()))
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        HalberdError::Other(format!("Invalid configuration: {}", msg.into()))
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        HalberdError::Other(format!("Internal error: {}", msg.into()))
    }

    /// True for failures that only abort the document being indexed.
    pub fn is_per_document(&self) -> bool {
        matches!(
            self,
            HalberdError::Analysis(_) | HalberdError::IllegalArgument(_)
        )
    }

    /// True for format/compatibility failures, looking through merge wrappers.
    pub fn is_format_error(&self) -> bool {
        match self {
            HalberdError::UnsupportedFormat { .. } => true,
            HalberdError::Merge { cause, .. } => cause.is_format_error(),
            _ => false,
        }
    }

    /// True for checksum or truncation failures, looking through merge wrappers.
    pub fn is_corruption(&self) -> bool {
        match self {
            HalberdError::Corruption { .. } => true,
            HalberdError::Merge { cause, .. } => cause.is_corruption(),
            _ => false,
        }
    }

    /// True when a file the operation needed does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, HalberdError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }

    /// A copy of this error for a second observer. Wrapped foreign errors are
    /// re-created from their kind and message.
    pub fn duplicate(&self) -> HalberdError {
        match self {
            HalberdError::Io(e) => HalberdError::Io(io::Error::new(e.kind(), e.to_string())),
            HalberdError::Index(m) => HalberdError::Index(m.clone()),
            HalberdError::Schema(m) => HalberdError::Schema(m.clone()),
            HalberdError::Analysis(m) => HalberdError::Analysis(m.clone()),
            HalberdError::IllegalArgument(m) => HalberdError::IllegalArgument(m.clone()),
            HalberdError::Storage(m) => HalberdError::Storage(m.clone()),
            HalberdError::UnsupportedFormat { path, detail } => HalberdError::UnsupportedFormat {
                path: path.clone(),
                detail: detail.clone(),
            },
            HalberdError::Corruption { path, detail } => HalberdError::Corruption {
                path: path.clone(),
                detail: detail.clone(),
            },
            HalberdError::IndexNotFound(m) => HalberdError::IndexNotFound(m.clone()),
            HalberdError::AlreadyClosed(m) => HalberdError::AlreadyClosed(m.clone()),
            HalberdError::InvalidOperation(m) => HalberdError::InvalidOperation(m.clone()),
            HalberdError::MergeAborted(m) => HalberdError::MergeAborted(m.clone()),
            HalberdError::Merge { message, cause } => HalberdError::Merge {
                message: message.clone(),
                cause: Box::new(cause.duplicate()),
            },
            HalberdError::LockObtainFailed(m) => HalberdError::LockObtainFailed(m.clone()),
            HalberdError::ThreadJoinError(m) => HalberdError::ThreadJoinError(m.clone()),
            HalberdError::Other(m) => HalberdError::Other(m.clone()),
            other => HalberdError::Other(other.to_string()),
        }
    }

    /// Returns the innermost cause of a merge failure.
    pub fn root_cause(&self) -> &HalberdError {
        match self {
            HalberdError::Merge { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}
