//! Crate-wide error taxonomy.
//!
//! Individual controllers define their own `thiserror` enums scoped to their
//! file layout (see e.g. [`crate::v2::unified::V2UnifiedError`]); this module
//! is the umbrella kind the status store (and anything that needs to surface
//! a stable, matchable error to a caller rather than a message chain) returns.

use std::path::PathBuf;

use crate::common::WrappedIoError;

/// A crate-wide error kind, matching the taxonomy every controller and the
/// status store are expected to map their failures onto at the boundary
/// where a caller needs to distinguish "not found" from "bad input" from
/// "the kernel said no".
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A semantic violation in caller-supplied input: an id containing `/`,
    /// a unified key containing `/`, `leaf_weight` on a v2 cgroup, a
    /// check-before-update pre-flight failure, and similar.
    #[error("{0}")]
    ConfigInvalid(String),

    /// The controller-availability diagnostic determined the write target's
    /// controller is not mounted/enabled at the resolved path.
    #[error("controller {controller} is not available under {path}")]
    ControllerUnavailable { controller: String, path: PathBuf },

    /// A controller write failed with an errno that isn't one of the
    /// documented retry cases.
    #[error("kernel rejected write to {path}: {source}")]
    KernelRejected {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `pid` exists but its recorded start-time diverges from what
    /// `/proc/<pid>/stat` reports now. The liveness check folds this into
    /// "stopped" rather than propagating it, but the kind exists so callers
    /// that want to distinguish "never existed" from "PID got reused" can.
    #[error("pid {pid} start time does not match recorded status (recorded {recorded}, observed {observed})")]
    IdentityMismatch {
        pid: i32,
        recorded: u64,
        observed: u64,
    },

    /// The container (or the file being read) does not exist.
    #[error("{0}")]
    NotFound(String),

    /// A read/write/rename/open failure outside of a controller write.
    #[error("io error: {0}")]
    IOError(#[from] std::io::Error),

    /// Malformed JSON or malformed `/proc/<pid>/stat` content.
    #[error("{0}")]
    ParseError(String),
}

impl From<WrappedIoError> for Error {
    fn from(err: WrappedIoError) -> Self {
        let path = match &err {
            WrappedIoError::Open { path, .. }
            | WrappedIoError::Write { path, .. }
            | WrappedIoError::Read { path, .. } => path.clone(),
        };
        let source = std::io::Error::new(err.inner().kind(), err.to_string());
        Error::KernelRejected { path, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
