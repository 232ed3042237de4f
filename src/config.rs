//! Configuration types

use std::time::Duration;

const MIN_BUFFER_BYTES: usize = 4 * 1024;
const MAX_BUFFER_BYTES: usize = 64 * 1024 * 1024;
const MAX_LATENCY: Duration = Duration::from_secs(60);

/// Change server configuration
///
/// This contains settings that may relate to only one specific backend,
/// so that a single configuration value works regardless of which backend
/// is selected at compile time. Options for other platforms are ignored.
///
/// ```rust
/// # use std::time::Duration;
/// # use pathwatch::Config;
/// let config = Config::default()
///     .with_latency(Duration::from_millis(500))
///     .with_buffer_bytes(256 * 1024);
/// ```
///
/// All options have to be set before the server is opened; none can be
/// changed during runtime.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct Config {
    /// See [Config::with_latency]
    latency: Duration,

    /// See [Config::with_buffer_bytes]
    buffer_bytes: usize,

    /// See [Config::with_command_timeout]
    command_timeout: Duration,
}

impl Config {
    /// For the [`FsEventServer`](crate::FsEventServer) backend.
    ///
    /// Coalescing latency of the event streams, in the range 0–60 seconds.
    /// Changes occurring closer together than this may be merged by the OS
    /// into a single directory-level notification.
    ///
    /// The default latency is 300 ms. Ignored on other platforms.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency.min(MAX_LATENCY);
        self
    }

    /// Returns current setting
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// For the [`ReadDirectoryChangesServer`](crate::ReadDirectoryChangesServer)
    /// backend.
    ///
    /// Size of the per-root completion buffer handed to the OS, clamped to
    /// 4 KiB – 64 MiB. A larger buffer tolerates longer bursts before the
    /// kernel reports an overflow.
    ///
    /// The default is 64 KiB. Ignored on other platforms.
    pub fn with_buffer_bytes(mut self, buffer_bytes: usize) -> Self {
        self.buffer_bytes = buffer_bytes.clamp(MIN_BUFFER_BYTES, MAX_BUFFER_BYTES);
        self
    }

    /// Returns current setting
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// How long public calls wait for the pump thread.
    ///
    /// This bounds both the readiness wait in `open` and the
    /// acknowledgement wait of every registration command; expiry surfaces
    /// as [`ErrorKind::CommandTimedOut`](crate::ErrorKind::CommandTimedOut)
    /// and usually means the pump is wedged.
    ///
    /// The default is 5 seconds.
    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    /// Returns current setting
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(300),
            buffer_bytes: 64 * 1024,
            command_timeout: Duration::from_secs(5),
        }
    }
}
