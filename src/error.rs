//! Error kinds shared by every module in this crate.

use std::path::PathBuf;

use nix::errno::Errno;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while maintaining the claim index, the stable-name
/// symlinks, or the device node's permissions and labels.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `stable_name` does not lie under the device filesystem root.
    #[error("stable name {path:?} is not under devfs root {root:?}")]
    InvalidArgument { path: PathBuf, root: PathBuf },

    /// A real device-node inode sits where a symlink was requested; we must
    /// not clobber it.
    #[error("refusing to replace device node at {path:?}")]
    ConflictingNode { path: PathBuf },

    /// The convergence loop in the link updater ran out of retries without
    /// observing a stable claim set.
    #[error("link update for {path:?} did not converge after {attempts} attempts")]
    ConvergenceExhausted { path: PathBuf, attempts: u32 },

    /// A device node or a parent directory vanished mid-operation. Callers
    /// that can recover locally (see §4.2, §4.6 of the design) do so; this
    /// variant is for the cases that bubble all the way up.
    #[error("{path:?} vanished during the operation")]
    TransientMissing { path: PathBuf },

    /// Any other syscall failure, with the original errno attached.
    #[error("{context} on {path:?}: {source}")]
    Fatal {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: Errno,
    },

    /// Any other syscall failure that isn't naturally path-scoped.
    #[error("{context}: {source}")]
    FatalNoPath {
        context: &'static str,
        #[source]
        source: Errno,
    },

    /// A path could not be represented as UTF-8 or contained an interior
    /// NUL where a C string was required.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// The writer could not compute a relative target between two paths.
    #[error("no relative path from {from:?} to {to:?}")]
    NoRelativePath { from: PathBuf, to: PathBuf },
}

impl Error {
    /// Best-effort errno for callers that want to pattern-match on it (for
    /// example, treating `ENOENT` as "someone already cleaned this up").
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Fatal { source, .. } => Some(*source),
            Error::FatalNoPath { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub(crate) fn fatal(context: &'static str, path: impl Into<PathBuf>, source: Errno) -> Error {
        Error::Fatal {
            context,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn fatal_no_path(context: &'static str, source: Errno) -> Error {
        Error::FatalNoPath { context, source }
    }
}
