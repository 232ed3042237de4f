//! Control plane shared by all backends: the command mailbox entries, the
//! one-shot acknowledgement handles and the server lifecycle word.
//!
//! Public methods never touch backend state directly. They enqueue a
//! [`Command`], wake the pump through a backend-specific mechanism, and
//! block on the command's [`Ack`] with a bounded timeout. The pump applies
//! commands in FIFO order on its own thread, which is also the only thread
//! that handles raw events, so command execution needs no further locking.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::{bounded, BoundSender, Error, Receiver, Result};

#[cfg(feature = "crossbeam-channel")]
use crossbeam_channel::RecvTimeoutError;
#[cfg(not(feature = "crossbeam-channel"))]
use std::sync::mpsc::RecvTimeoutError;

/// A control command submitted to the pump thread.
pub(crate) enum Command {
    /// Add watch points for the given roots. The first per-root failure
    /// aborts the remainder of the batch; roots added earlier in the same
    /// batch stay registered.
    Register(Vec<PathBuf>, Reply<Result<()>>),

    /// Remove watch points. The reply is `true` iff every root was
    /// previously watched; unknown roots are skipped without failing the
    /// rest of the batch.
    Unregister(Vec<PathBuf>, Reply<bool>),

    /// Tear down every watch point and exit the pump loop.
    Terminate(Reply<()>),
}

/// Pump-side half of a command acknowledgement.
pub(crate) struct Reply<T>(BoundSender<T>);

impl<T> Reply<T> {
    /// Completes the command. The submitter may have given up waiting, so a
    /// dropped receiver is not an error.
    pub(crate) fn send(self, value: T) {
        let _ = self.0.send(value);
    }
}

/// Submitter-side half of a command acknowledgement.
pub(crate) struct Ack<T>(Receiver<T>);

impl<T> Ack<T> {
    /// Blocks until the pump completes the command.
    ///
    /// A timeout means the pump is probably wedged; a disconnect means it
    /// exited before reaching the command.
    pub(crate) fn wait(&self, timeout: Duration) -> Result<T> {
        self.0.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::command_timed_out(),
            RecvTimeoutError::Disconnected => Error::closed(),
        })
    }
}

/// Creates a connected one-shot reply pair.
pub(crate) fn oneshot<T>() -> (Reply<T>, Ack<T>) {
    let (tx, rx) = bounded(1);
    (Reply(tx), Ack(rx))
}

/// Lifecycle of a change server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum ServerState {
    Starting = 0,
    Running = 1,
    Terminating = 2,
    Terminated = 3,
}

/// Shared, monotonic [`ServerState`] word.
///
/// Transitions only move forward; concurrent writers cannot revive a
/// terminating server.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell(AtomicU8::new(ServerState::Starting as u8))
    }

    pub(crate) fn get(&self) -> ServerState {
        match self.0.load(Ordering::Acquire) {
            0 => ServerState::Starting,
            1 => ServerState::Running,
            2 => ServerState::Terminating,
            _ => ServerState::Terminated,
        }
    }

    /// Advances to `state` unless the cell is already further along.
    pub(crate) fn advance(&self, state: ServerState) {
        self.0.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// Returns an error unless the server is accepting commands.
    pub(crate) fn ensure_running(&self) -> Result<()> {
        match self.get() {
            ServerState::Running => Ok(()),
            ServerState::Starting => Err(Error::backend_fault("change server is still starting")),
            ServerState::Terminating | ServerState::Terminated => Err(Error::closed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn oneshot_delivers_reply() {
        let (reply, ack) = oneshot::<u32>();
        reply.send(7);
        assert_eq!(ack.wait(Duration::from_secs(1)).unwrap(), 7);
    }

    #[test]
    fn oneshot_times_out() {
        let (_reply, ack) = oneshot::<u32>();
        let err = ack.wait(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::CommandTimedOut));
    }

    #[test]
    fn oneshot_reports_dead_pump() {
        let (reply, ack) = oneshot::<u32>();
        drop(reply);
        let err = ack.wait(Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Closed));
    }

    #[test]
    fn state_is_monotonic() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ServerState::Starting);

        cell.advance(ServerState::Running);
        assert_eq!(cell.get(), ServerState::Running);

        cell.advance(ServerState::Terminated);
        cell.advance(ServerState::Running);
        assert_eq!(cell.get(), ServerState::Terminated);
    }

    #[test]
    fn ensure_running_gates_each_phase() {
        let cell = StateCell::new();
        assert!(cell.ensure_running().is_err());

        cell.advance(ServerState::Running);
        assert!(cell.ensure_running().is_ok());

        cell.advance(ServerState::Terminating);
        let err = cell.ensure_running().unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Closed));
    }
}
