#![allow(dead_code)] // not all helpers are used for all targets

use std::sync::mpsc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::{ChangeEvent, ChangeKind, Error, Result};

/// Creates a sink backed by a channel plus the receiving end wrapped in
/// assertion helpers.
pub(crate) fn channel_sink() -> (mpsc::Sender<Result<ChangeEvent>>, EventStream) {
    let (tx, rx) = mpsc::channel();
    (
        tx,
        EventStream {
            rx,
            timeout: EventStream::DEFAULT_TIMEOUT,
        },
    )
}

pub(crate) fn testdir() -> TempDir {
    tempfile::tempdir().expect("unable to create a test directory")
}

/// Waits for events from the server and provides some helper methods
pub(crate) struct EventStream {
    rx: mpsc::Receiver<Result<ChangeEvent>>,
    timeout: Duration,
}

impl EventStream {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

    pub(crate) fn recv(&self) -> ChangeEvent {
        match self.rx.recv_timeout(self.timeout) {
            Ok(Ok(event)) => event,
            Ok(Err(err)) => panic!("got an error from the server: {err}"),
            Err(err) => panic!("no event within {:?}: {err}", self.timeout),
        }
    }

    pub(crate) fn recv_result(&self) -> Result<ChangeEvent> {
        self.rx
            .recv_timeout(self.timeout)
            .unwrap_or_else(|err| panic!("no event or error within {:?}: {err}", self.timeout))
    }

    /// Waits for the next event and asserts it is exactly `kind` at `path`.
    pub(crate) fn expect_change(&self, kind: ChangeKind, path: impl AsRef<std::path::Path>) {
        let event = self.recv();
        assert_eq!(event, ChangeEvent::new(kind, path.as_ref()));
    }

    /// Asserts that nothing arrives for the whole `window`.
    pub(crate) fn expect_silence(&self, window: Duration) {
        match self.rx.recv_timeout(window) {
            Err(mpsc::RecvTimeoutError::Timeout) | Err(mpsc::RecvTimeoutError::Disconnected) => {}
            Ok(received) => panic!("expected silence, got {received:?}"),
        }
    }

    /// Collects everything delivered until the stream stays quiet for
    /// `window`.
    pub(crate) fn drain(&self, window: Duration) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while let Ok(res) = self.rx.recv_timeout(window) {
            match res {
                Ok(event) => events.push(event),
                Err(err) => panic!("got an error from the server: {err}"),
            }
        }
        events
    }

    /// Collects pending errors, dropping events.
    pub(crate) fn drain_errors(&self, window: Duration) -> Vec<Error> {
        let mut errors = Vec::new();
        while let Ok(res) = self.rx.recv_timeout(window) {
            if let Err(err) = res {
                errors.push(err);
            }
        }
        errors
    }
}
