//! Cross-platform filesystem change notification service
//!
//! # Installation
//!
//! ```toml
//! [dependencies]
//! pathwatch = "0.1"
//! ```
//!
//! A [`WatchServer`] owns one background pump thread that observes the
//! native notification substrate (inotify on Linux, FSEvents on macOS,
//! `ReadDirectoryChangesW` on Windows) and delivers [`ChangeEvent`]s to an
//! embedder-supplied [`ChangeSink`]. Watch roots can be registered and
//! unregistered from any thread while the pump is running.
//!
//! ## Features
//!
//! - `serde` for serialization of events
//! - `crossbeam-channel` enabled by default, see below
//!
//! ### Crossbeam-Channel
//!
//! By default crossbeam-channel is used internally. This can be disabled,
//! falling back to std channels, via
//!
//! ```toml
//! pathwatch = { version = "0.1", default-features = false }
//! ```
//!
//! # Known Problems
//!
//! ### Recursion on Linux
//!
//! inotify watches are per-directory and this library does not auto-expand
//! them; on Linux only the immediate children of each registered root are
//! observed. macOS and Windows watch the whole subtree.
//!
//! ### Sink re-entrancy
//!
//! Sinks run on the pump thread. A sink that calls back into the server
//! synchronously will deadlock, because the pump cannot acknowledge the
//! command it is itself blocked on; re-enter from another thread instead.
//!
//! ### Linux: No space left on device
//!
//! Registration may run into the max-files-watched limits of your user or
//! system. You may increase the limit via
//!
//! ```sh
//! sudo sysctl fs.inotify.max_user_instances=8192 # example number
//! sudo sysctl fs.inotify.max_user_watches=524288 # example number
//! sudo sysctl -p
//! ```
//!
//! # Examples
//!
//! ```rust,no_run
//! use pathwatch::{recommended_server, WatchServer};
//! use std::path::PathBuf;
//!
//! fn main() -> pathwatch::Result<()> {
//!     let server = recommended_server(|res| match res {
//!         Ok(event) => println!("change: {:?}", event),
//!         Err(e) => println!("watch error: {:?}", e),
//!     })?;
//!
//!     server.register(&[PathBuf::from("/some/dir")])?;
//!     // ... the sink now receives changes beneath /some/dir ...
//!     server.close();
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use event::{ChangeEvent, ChangeKind};
use std::path::PathBuf;

#[allow(dead_code)]
#[cfg(feature = "crossbeam-channel")]
pub(crate) type Receiver<T> = crossbeam_channel::Receiver<T>;
#[allow(dead_code)]
#[cfg(not(feature = "crossbeam-channel"))]
pub(crate) type Receiver<T> = std::sync::mpsc::Receiver<T>;

#[allow(dead_code)]
#[cfg(feature = "crossbeam-channel")]
pub(crate) type Sender<T> = crossbeam_channel::Sender<T>;
#[allow(dead_code)]
#[cfg(not(feature = "crossbeam-channel"))]
pub(crate) type Sender<T> = std::sync::mpsc::Sender<T>;

// std limitation
#[allow(dead_code)]
#[cfg(feature = "crossbeam-channel")]
pub(crate) type BoundSender<T> = crossbeam_channel::Sender<T>;
#[allow(dead_code)]
#[cfg(not(feature = "crossbeam-channel"))]
pub(crate) type BoundSender<T> = std::sync::mpsc::SyncSender<T>;

#[allow(dead_code)]
#[inline]
pub(crate) fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    #[cfg(feature = "crossbeam-channel")]
    return crossbeam_channel::unbounded();
    #[cfg(not(feature = "crossbeam-channel"))]
    return std::sync::mpsc::channel();
}

#[allow(dead_code)]
#[inline]
pub(crate) fn bounded<T>(cap: usize) -> (BoundSender<T>, Receiver<T>) {
    #[cfg(feature = "crossbeam-channel")]
    return crossbeam_channel::bounded(cap);
    #[cfg(not(feature = "crossbeam-channel"))]
    return std::sync::mpsc::sync_channel(cap);
}

#[cfg(target_os = "macos")]
pub use crate::fsevent::FsEventServer;
#[cfg(target_os = "linux")]
pub use crate::inotify::InotifyServer;
#[cfg(target_os = "windows")]
pub use crate::windows::ReadDirectoryChangesServer;

#[cfg(target_os = "macos")]
pub mod fsevent;
#[cfg(target_os = "linux")]
pub mod inotify;
#[cfg(target_os = "windows")]
pub mod windows;

pub mod event;

mod config;
mod control;
mod error;
mod paths;
#[cfg(test)]
mod testing;

/// The embedder-supplied destination for change notifications.
///
/// Both methods are invoked exclusively on the server's pump thread, one
/// call at a time; the sink only needs to be safe against that single
/// thread plus whatever the embedder itself does with it. Neither method
/// may call back into the server synchronously, because the pump would be
/// waiting on itself. Re-entry from a separate thread is fine.
///
/// # Example implementation
///
/// ```no_run
/// use pathwatch::{ChangeEvent, ChangeSink};
///
/// /// Prints received events
/// struct EventPrinter;
///
/// impl ChangeSink for EventPrinter {
///     fn on_change(&self, event: ChangeEvent) {
///         println!("change: {:?}", event);
///     }
///
///     fn on_error(&self, message: &str) {
///         eprintln!("watch error: {}", message);
///     }
/// }
/// ```
pub trait ChangeSink: Send + Sync + 'static {
    /// Handles one observed change.
    fn on_change(&self, event: ChangeEvent);

    /// Handles a non-fatal backend error that could not be translated into
    /// a specific event.
    fn on_error(&self, message: &str);
}

impl<F> ChangeSink for F
where
    F: Fn(Result<ChangeEvent>) + Send + Sync + 'static,
{
    fn on_change(&self, event: ChangeEvent) {
        (self)(Ok(event));
    }

    fn on_error(&self, message: &str) {
        (self)(Err(Error::backend_fault(message)));
    }
}

#[cfg(feature = "crossbeam-channel")]
impl ChangeSink for crossbeam_channel::Sender<Result<ChangeEvent>> {
    fn on_change(&self, event: ChangeEvent) {
        let _ = self.send(Ok(event));
    }

    fn on_error(&self, message: &str) {
        let _ = self.send(Err(Error::backend_fault(message)));
    }
}

impl ChangeSink for std::sync::mpsc::Sender<Result<ChangeEvent>> {
    fn on_change(&self, event: ChangeEvent) {
        let _ = self.send(Ok(event));
    }

    fn on_error(&self, message: &str) {
        let _ = self.send(Err(Error::backend_fault(message)));
    }
}

/// Server backend enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ServerKind {
    /// inotify backend (linux)
    Inotify,
    /// FS-Event backend (mac)
    FsEvent,
    /// ReadDirectoryChangesW backend (windows)
    ReadDirectoryChanges,
}

/// A long-running change notification server.
///
/// Implemented once per platform on the best notification substrate
/// available there. All public methods are thread-safe: any number of
/// embedder threads may call them concurrently. Each call enqueues a
/// command for the pump thread and blocks until it is acknowledged,
/// bounded by [`Config::command_timeout`].
pub trait WatchServer {
    /// Opens a server delivering to `sink`.
    ///
    /// Starts the pump thread and blocks until it signals readiness.
    /// Fails with [`ErrorKind::StartupFailed`] if the OS refused to create
    /// the underlying notification object or the pump did not come up
    /// within the command timeout.
    fn open<S: ChangeSink>(sink: S, config: Config) -> Result<Self>
    where
        Self: Sized;

    /// Begins watching the given directories.
    ///
    /// Roots are registered in order; the first failing root aborts the
    /// remainder of the batch while roots registered earlier in the same
    /// call stay active. Duplicate registration fails with
    /// [`ErrorKind::AlreadyWatching`], paths that do not name a directory
    /// with [`ErrorKind::NotADirectory`].
    ///
    /// Only changes occurring after this call returns are delivered.
    fn register(&self, roots: &[PathBuf]) -> Result<()>;

    /// Stops watching the given directories.
    ///
    /// Returns `true` iff every root was previously watched. Unknown roots
    /// yield `false` but do not fail the call, and the remaining roots in
    /// the batch are still removed. Once this call returns, no further
    /// events for the removed roots reach the sink.
    fn unregister(&self, roots: &[PathBuf]) -> Result<bool>;

    /// Shuts the server down, releasing every OS watch handle.
    ///
    /// Blocks until the pump thread has exited; after that no further sink
    /// calls are made. Idempotent, and succeeds even if the pump already
    /// died from an earlier fatal fault. Shutdown errors are logged, never
    /// surfaced.
    fn close(&self);

    /// Returns the backend kind, allowing to perform backend-specific tasks
    fn kind() -> ServerKind
    where
        Self: Sized;
}

/// The recommended `WatchServer` implementation for the current platform
#[cfg(target_os = "linux")]
pub type RecommendedServer = InotifyServer;
/// The recommended `WatchServer` implementation for the current platform
#[cfg(target_os = "macos")]
pub type RecommendedServer = FsEventServer;
/// The recommended `WatchServer` implementation for the current platform
#[cfg(target_os = "windows")]
pub type RecommendedServer = ReadDirectoryChangesServer;

/// Convenience method for opening the `RecommendedServer` for the current
/// platform with the default [`Config`].
pub fn recommended_server<S>(sink: S) -> Result<RecommendedServer>
where
    S: ChangeSink,
{
    RecommendedServer::open(sink, Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_impl() {
        macro_rules! assert_debug_impl {
            ($t:ty) => {{
                trait NeedsDebug: std::fmt::Debug {}
                impl NeedsDebug for $t {}
            }};
        }

        assert_debug_impl!(ChangeEvent);
        assert_debug_impl!(ChangeKind);
        assert_debug_impl!(Config);
        assert_debug_impl!(Error);
        assert_debug_impl!(ErrorKind);
        assert_debug_impl!(RecommendedServer);
        assert_debug_impl!(ServerKind);
    }

    #[test]
    fn channel_sinks_forward_both_sides() {
        let (tx, rx) = std::sync::mpsc::channel::<Result<ChangeEvent>>();
        let sink: &dyn ChangeSink = &tx;

        sink.on_change(ChangeEvent::new(ChangeKind::Created, "/tmp/a"));
        sink.on_error("boom");

        assert!(rx.recv().unwrap().is_ok());
        let err = rx.recv().unwrap().unwrap_err();
        assert!(matches!(err.kind, ErrorKind::BackendFault(_)));
    }
}
