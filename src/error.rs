//! Error types.

use std::{error::Error as StdError, fmt, io, path::PathBuf, result};

/// Type alias to use this library's `Error` type in a Result.
pub type Result<T> = result::Result<T, Error>;

/// Error kinds.
#[derive(Debug)]
pub enum ErrorKind {
    /// The OS notification primitive could not be created, or the pump
    /// thread never reported readiness.
    StartupFailed(String),

    /// The path is already covered by a live watch point.
    AlreadyWatching,

    /// The path is not covered by any watch point.
    NotWatching,

    /// The path does not name a directory.
    NotADirectory,

    /// An unexpected OS error.
    Io(io::Error),

    /// The pump thread failed to acknowledge a command within the
    /// configured timeout. This usually means the pump is wedged inside an
    /// embedder sink callback.
    CommandTimedOut,

    /// The server has been closed, or its pump terminated after a fatal
    /// fault; no further commands are accepted.
    Closed,

    /// A failure inside the pump that has no more precise classification.
    BackendFault(String),
}

/// Notification error, containing the failure kind and the paths it
/// concerns, where known.
#[derive(Debug)]
pub struct Error {
    /// Kind of the error.
    pub kind: ErrorKind,

    /// Relevant paths, if any.
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Creates a new Error with the given `ErrorKind` and no paths.
    pub fn new(kind: ErrorKind) -> Self {
        Error {
            kind,
            paths: Vec::new(),
        }
    }

    /// Returns a copy of this error with `path` attached.
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Creates an error from a failure to bring up the backend.
    pub fn startup_failed(reason: impl Into<String>) -> Self {
        Error::new(ErrorKind::StartupFailed(reason.into()))
    }

    /// Creates an `AlreadyWatching` error.
    pub fn already_watching() -> Self {
        Error::new(ErrorKind::AlreadyWatching)
    }

    /// Creates a `NotWatching` error.
    pub fn not_watching() -> Self {
        Error::new(ErrorKind::NotWatching)
    }

    /// Creates a `NotADirectory` error.
    pub fn not_a_directory() -> Self {
        Error::new(ErrorKind::NotADirectory)
    }

    /// Wraps an OS error.
    pub fn io(err: io::Error) -> Self {
        Error::new(ErrorKind::Io(err))
    }

    /// Creates a `CommandTimedOut` error.
    pub fn command_timed_out() -> Self {
        Error::new(ErrorKind::CommandTimedOut)
    }

    /// Creates a `Closed` error.
    pub fn closed() -> Self {
        Error::new(ErrorKind::Closed)
    }

    /// Creates an unclassified backend error.
    pub fn backend_fault(reason: impl Into<String>) -> Self {
        Error::new(ErrorKind::BackendFault(reason.into()))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ErrorKind::StartupFailed(reason) => {
                write!(f, "failed to start the change server: {reason}")?
            }
            ErrorKind::AlreadyWatching => f.write_str("path is already being watched")?,
            ErrorKind::NotWatching => f.write_str("path is not being watched")?,
            ErrorKind::NotADirectory => f.write_str("path is not a directory")?,
            ErrorKind::Io(err) => write!(f, "{err}")?,
            ErrorKind::CommandTimedOut => {
                f.write_str("the change server did not acknowledge the command in time")?
            }
            ErrorKind::Closed => f.write_str("the change server has been shut down")?,
            ErrorKind::BackendFault(reason) => write!(f, "backend fault: {reason}")?,
        }
        if !self.paths.is_empty() {
            write!(f, " about {:?}", self.paths)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &self.kind {
            ErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err)
    }
}

#[cfg(feature = "crossbeam-channel")]
impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(_: crossbeam_channel::SendError<T>) -> Self {
        Error::closed()
    }
}

#[cfg(feature = "crossbeam-channel")]
impl From<crossbeam_channel::RecvError> for Error {
    fn from(_: crossbeam_channel::RecvError) -> Self {
        Error::closed()
    }
}

impl<T> From<std::sync::mpsc::SendError<T>> for Error {
    fn from(_: std::sync::mpsc::SendError<T>) -> Self {
        Error::closed()
    }
}

impl From<std::sync::mpsc::RecvError> for Error {
    fn from(_: std::sync::mpsc::RecvError) -> Self {
        Error::closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn display_includes_paths() {
        let err = Error::already_watching().add_path(PathBuf::from("/watched/root"));
        let rendered = err.to_string();
        assert!(rendered.contains("already being watched"), "{rendered}");
        assert!(rendered.contains("/watched/root"), "{rendered}");
    }

    #[test]
    fn io_errors_keep_their_source() {
        let err = Error::io(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(err.source().is_some());
        assert!(matches!(err.kind, ErrorKind::Io(_)));
    }

    #[test]
    fn send_failure_means_closed() {
        let (tx, rx) = std::sync::mpsc::channel::<u8>();
        drop(rx);
        let err: Error = tx.send(1).unwrap_err().into();
        assert!(matches!(err.kind, ErrorKind::Closed));
    }

    #[test]
    fn paths_accumulate() {
        let err = Error::not_a_directory()
            .add_path(Path::new("/a").to_path_buf())
            .add_path(Path::new("/b").to_path_buf());
        assert_eq!(err.paths.len(), 2);
    }
}
