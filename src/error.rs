//! Unified error type for the raptor library.
//!
//! Library code returns `RaptorError` with structured context; the CLI layer
//! wraps results with `anyhow` for reporting.
//!
//! # Error Categories
//!
//! - **InvalidArgument**: bad flag, path or value combination
//! - **Io**: file system operations (open, read, write)
//! - **Format**: malformed minimiser, header or index envelope
//! - **VersionMismatch**: unsupported serialized index version
//! - **Corruption**: out-of-range or cyclic HIBF indices
//! - **ShapeMismatch**: recorded minimiser header disagrees with the command
//! - **Internal**: broken invariant, fatal

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
pub enum RaptorError {
    /// Invalid parameter or parameter combination.
    InvalidArgument(String),

    /// I/O error with path context.
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
    },

    /// Invalid file content (magic bytes, truncated payload, bad field).
    Format { path: PathBuf, detail: String },

    /// Serialized index version is not supported by this operation.
    VersionMismatch { path: PathBuf, found: u32 },

    /// Index structure is internally inconsistent (dangling or cyclic links).
    Corruption(String),

    /// A minimiser header records different parameters than the command uses.
    ShapeMismatch { path: PathBuf, detail: String },

    /// Broken invariant; not recoverable.
    Internal(String),
}

impl fmt::Display for RaptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaptorError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            RaptorError::Io {
                path,
                operation,
                source,
            } => {
                write!(
                    f,
                    "I/O error during {} on '{}': {}",
                    operation,
                    path.display(),
                    source
                )
            }
            RaptorError::Format { path, detail } => {
                write!(f, "Invalid format in '{}': {}", path.display(), detail)
            }
            RaptorError::VersionMismatch { path, found } => {
                write!(
                    f,
                    "Unsupported index version {} in '{}'. Check raptor upgrade.",
                    found,
                    path.display()
                )
            }
            RaptorError::Corruption(msg) => write!(f, "Index corruption: {}", msg),
            RaptorError::ShapeMismatch { path, detail } => {
                write!(
                    f,
                    "Minimiser header '{}' disagrees with the command line: {}",
                    path.display(),
                    detail
                )
            }
            RaptorError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RaptorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RaptorError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RaptorError {
    fn from(err: std::io::Error) -> Self {
        RaptorError::Io {
            path: PathBuf::new(),
            operation: "unknown",
            source: err,
        }
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, RaptorError>;

impl RaptorError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        RaptorError::InvalidArgument(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        RaptorError::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    pub fn format(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        RaptorError::Format {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        RaptorError::Corruption(msg.into())
    }

    pub fn shape_mismatch(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        RaptorError::ShapeMismatch {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RaptorError::Internal(msg.into())
    }
}

// ============================================================================
// Shared abort flag for worker pools
// ============================================================================

/// Stores the first error raised by any worker and flags the pool to abort.
///
/// Workers poll `has_error` at record boundaries and finish their current
/// record before returning; the driver retrieves the stored error afterwards.
pub struct FirstErrorCapture {
    has_error: AtomicBool,
    error: Mutex<Option<RaptorError>>,
}

impl FirstErrorCapture {
    pub fn new() -> Self {
        Self {
            has_error: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// Store an error unless one is already present. Returns whether this
    /// error won the race.
    pub fn store(&self, err: RaptorError) -> bool {
        if self
            .has_error
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Ok(mut guard) = self.error.lock() {
                *guard = Some(err);
            }
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> Option<RaptorError> {
        if self.has_error.load(Ordering::SeqCst) {
            self.error.lock().ok().and_then(|mut g| g.take())
        } else {
            None
        }
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }
}

impl Default for FirstErrorCapture {
    fn default() -> Self {
        Self::new()
    }
}
