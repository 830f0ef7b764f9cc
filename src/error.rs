use std::time::Duration;

use thiserror::Error;

/// Failure classes that callers branch on. Everything that is only ever
/// reported upward flows through `anyhow` instead.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The archive's identity bytes are wrong or a record header is
    /// impossible. Fatal to the owning reader handle.
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A spawned utility exited non-zero without its success sentinel.
    #[error("external tool failed: {0}")]
    ExternalTool(String),

    /// An external invocation exceeded its budget. Recoverable; the
    /// pipeline records the file as failed.
    #[error("timed out after {0:?}: {1}")]
    Timeout(Duration, String),
}

impl ToolError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ToolError::MalformedArchive(_))
    }
}
