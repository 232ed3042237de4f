//! Server implementation for the inotify Linux API
//!
//! inotify watches are per-directory: a watch point observes a root and its
//! immediate children, and the kernel delivers one record per change. The
//! pump owns the inotify file descriptor and a wake handle; commands arrive
//! over a channel and are applied between polls, so watch-point mutation and
//! event translation never race.

use inotify as inotify_sys;
use inotify_sys::{EventMask, Inotify, WatchDescriptor, WatchMask};
use std::collections::HashMap;
use std::fs::metadata;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::control::{oneshot, Ack, Command, ServerState, StateCell};
use crate::{
    bounded, paths, unbounded, ChangeEvent, ChangeKind, ChangeSink, Config, Error, Receiver,
    Result, Sender, ServerKind, WatchServer,
};

const INOTIFY: mio::Token = mio::Token(0);
const MESSAGE: mio::Token = mio::Token(1);

/// Kernel-side subscription for one watch root.
///
/// `DONT_FOLLOW` and `ONLYDIR` make the kernel enforce the "absolute
/// directory" contract at registration time; `EXCL_UNLINK` stops events for
/// entries that only survive through open handles after their unlink.
fn watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MODIFY
        | WatchMask::MOVE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::DONT_FOLLOW
        | WatchMask::EXCL_UNLINK
        | WatchMask::ONLYDIR
}

/// Collapses a raw inotify mask into the canonical taxonomy.
///
/// Returns `None` for records that must not produce an event: `IGNORED`
/// (the kernel dropped the watch) and `UNMOUNT`. `MOVE_SELF` deliberately
/// falls through to `Unknown`; the watch is cleaned up by the `IGNORED`
/// record that follows the eventual removal.
fn translate_mask(mask: EventMask) -> Option<ChangeKind> {
    if mask.contains(EventMask::Q_OVERFLOW) {
        return Some(ChangeKind::Overflowed);
    }
    if mask.intersects(EventMask::IGNORED | EventMask::UNMOUNT) {
        return None;
    }
    Some(
        if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
            ChangeKind::Created
        } else if mask.intersects(EventMask::DELETE | EventMask::DELETE_SELF | EventMask::MOVED_FROM)
        {
            ChangeKind::Removed
        } else if mask.contains(EventMask::MODIFY) {
            ChangeKind::Modified
        } else {
            ChangeKind::Unknown
        },
    )
}

// The EventLoop will set up a mio::Poll and use it to wait for the following:
//
// -  commands telling it what to do
//
// -  events telling it that something has happened in one of the watched
//    directories.

struct EventLoop {
    running: bool,
    poll: mio::Poll,
    event_loop_waker: Arc<mio::Waker>,
    event_loop_rx: Receiver<Command>,
    inotify: Option<Inotify>,
    sink: Arc<dyn ChangeSink>,
    state: Arc<StateCell>,
    watch_points: HashMap<PathBuf, WatchPoint>,
    roots: HashMap<WatchDescriptor, PathBuf>,
}

struct WatchPoint {
    wd: WatchDescriptor,
}

impl EventLoop {
    fn new(
        inotify: Inotify,
        sink: Arc<dyn ChangeSink>,
        state: Arc<StateCell>,
        event_loop_rx: Receiver<Command>,
    ) -> io::Result<Self> {
        let poll = mio::Poll::new()?;

        let event_loop_waker = Arc::new(mio::Waker::new(poll.registry(), MESSAGE)?);

        let inotify_fd = inotify.as_raw_fd();
        let mut evented_inotify = mio::unix::SourceFd(&inotify_fd);
        poll.registry()
            .register(&mut evented_inotify, INOTIFY, mio::Interest::READABLE)?;

        Ok(EventLoop {
            running: true,
            poll,
            event_loop_waker,
            event_loop_rx,
            inotify: Some(inotify),
            sink,
            state,
            watch_points: HashMap::new(),
            roots: HashMap::new(),
        })
    }

    fn event_loop_thread(mut self, ready_tx: crate::BoundSender<()>) {
        self.state.advance(ServerState::Running);
        let _ = ready_tx.send(());

        let mut events = mio::Events::with_capacity(16);
        loop {
            match self.poll.poll(&mut events, None) {
                Err(ref e) if matches!(e.kind(), io::ErrorKind::Interrupted) => {
                    // System call was interrupted, we will retry
                }
                Err(e) => {
                    self.sink.on_error(&format!("polling for changes failed: {e}"));
                    self.teardown();
                    break;
                }
                Ok(()) => {}
            }

            for event in &events {
                match event.token() {
                    MESSAGE => self.handle_commands(),
                    INOTIFY => self.handle_inotify(),
                    _ => unreachable!(),
                }
            }

            if !self.running {
                break;
            }
        }
        self.state.advance(ServerState::Terminated);
    }

    fn handle_commands(&mut self) {
        while let Ok(command) = self.event_loop_rx.try_recv() {
            match command {
                Command::Register(roots, reply) => {
                    reply.send(self.register_roots(roots));
                }
                Command::Unregister(roots, reply) => {
                    reply.send(self.unregister_roots(roots));
                }
                Command::Terminate(reply) => {
                    self.teardown();
                    reply.send(());
                    break;
                }
            }
        }
    }

    fn register_roots(&mut self, roots: Vec<PathBuf>) -> Result<()> {
        // First failure aborts the batch; earlier roots stay registered.
        for root in roots {
            self.add_watch(root)?;
        }
        Ok(())
    }

    fn add_watch(&mut self, root: PathBuf) -> Result<()> {
        if self.watch_points.contains_key(&root) {
            return Err(Error::already_watching().add_path(root));
        }
        let meta = metadata(&root).map_err(|e| Error::io(e).add_path(root.clone()))?;
        if !meta.is_dir() {
            return Err(Error::not_a_directory().add_path(root));
        }

        let inotify = match self.inotify.as_mut() {
            Some(inotify) => inotify,
            None => return Err(Error::closed()),
        };

        log::trace!("adding inotify watch: {}", root.display());
        match inotify.watches().add(&root, watch_mask()) {
            Ok(wd) => {
                self.roots.insert(wd.clone(), root.clone());
                self.watch_points.insert(root, WatchPoint { wd });
                Ok(())
            }
            Err(e) => Err(if e.raw_os_error() == Some(libc::ENOTDIR) {
                // the directory turned into something else between the stat
                // and the watch
                Error::not_a_directory()
            } else {
                Error::io(e)
            }
            .add_path(root)),
        }
    }

    fn unregister_roots(&mut self, roots: Vec<PathBuf>) -> bool {
        let mut all_known = true;
        for root in roots {
            match self.watch_points.remove(&root) {
                Some(watch_point) => {
                    log::trace!("removing inotify watch for {root:?}");
                    self.roots.remove(&watch_point.wd);
                    if let Some(inotify) = self.inotify.as_mut() {
                        Self::remove_single_descriptor(&mut inotify.watches(), watch_point.wd);
                    }
                }
                None => {
                    log::debug!("unregister of a root that is not watched: {root:?}");
                    all_known = false;
                }
            }
        }
        all_known
    }

    /// `inotify_rm_watch` may fail with EBADF or EINVAL when the descriptor
    /// has already been invalidated, e.g. by a racing `DELETE_SELF`. Either
    /// way the path is no longer watched, which is what the caller asked
    /// for, so the failure is logged and swallowed.
    fn remove_single_descriptor(watches: &mut inotify_sys::Watches, wd: WatchDescriptor) {
        if let Err(err) = watches.remove(wd) {
            log::info!("unable to remove watch descriptor from inotify: {err:?}");
        }
    }

    fn handle_inotify(&mut self) {
        if let Some(ref mut inotify) = self.inotify {
            let mut buffer = [0u8; 16384];
            // Read all buffers available.
            loop {
                match inotify.read_events(&mut buffer) {
                    Ok(events) => {
                        let mut num_events = 0;
                        for event in events {
                            log::trace!("inotify event: {event:?}");
                            num_events += 1;

                            if event.mask.contains(EventMask::Q_OVERFLOW) {
                                // wd is -1 here; the kernel cannot say which
                                // root lost events, so every root must
                                // re-enumerate.
                                match self.roots.get(&event.wd) {
                                    Some(root) => self.sink.on_change(ChangeEvent::new(
                                        ChangeKind::Overflowed,
                                        root.clone(),
                                    )),
                                    None => {
                                        for root in self.watch_points.keys() {
                                            self.sink.on_change(ChangeEvent::new(
                                                ChangeKind::Overflowed,
                                                root.clone(),
                                            ));
                                        }
                                    }
                                }
                                continue;
                            }

                            let root = match self.roots.get(&event.wd) {
                                Some(root) => root.clone(),
                                None => {
                                    log::debug!(
                                        "inotify event with unknown descriptor: {event:?}"
                                    );
                                    continue;
                                }
                            };

                            if event.mask.contains(EventMask::IGNORED) {
                                // The kernel has already dropped this watch;
                                // clean up internal state without a syscall
                                // and without notifying the sink.
                                self.roots.remove(&event.wd);
                                self.watch_points.remove(&root);
                                continue;
                            }

                            let kind = match translate_mask(event.mask) {
                                Some(kind) => kind,
                                None => continue,
                            };

                            let path = match event.name {
                                Some(name) if !name.is_empty() => root.join(name),
                                _ => root,
                            };
                            self.sink.on_change(ChangeEvent::new(kind, path));
                        }

                        // All events read. Break out.
                        if num_events == 0 {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        // No events read. Break out.
                        break;
                    }
                    Err(e) => {
                        self.sink
                            .on_error(&format!("reading inotify events failed: {e}"));
                        break;
                    }
                }
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(mut inotify) = self.inotify.take() {
            let mut watches = inotify.watches();
            for (wd, root) in self.roots.drain() {
                if let Err(err) = watches.remove(wd) {
                    log::info!("unable to remove watch for {root:?} during shutdown: {err:?}");
                }
            }
            if let Err(err) = inotify.close() {
                log::warn!("unable to close the inotify instance: {err}");
            }
        }
        self.watch_points.clear();
        self.running = false;
    }
}

/// Change server backed by inotify
#[derive(Debug)]
pub struct InotifyServer {
    channel: Sender<Command>,
    waker: Arc<mio::Waker>,
    state: Arc<StateCell>,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
    timeout: Duration,
}

impl InotifyServer {
    fn from_sink(sink: Arc<dyn ChangeSink>, config: &Config) -> Result<Self> {
        let inotify = Inotify::init().map_err(|e| {
            Error::startup_failed(format!("unable to create an inotify instance: {e}"))
        })?;

        let (tx, rx) = unbounded();
        let state = Arc::new(StateCell::new());
        let event_loop = EventLoop::new(inotify, sink, state.clone(), rx)
            .map_err(|e| Error::startup_failed(format!("unable to set up the event loop: {e}")))?;
        let waker = event_loop.event_loop_waker.clone();

        let (ready_tx, ready_rx) = bounded(1);
        let pump = thread::Builder::new()
            .name("pathwatch inotify loop".to_string())
            .spawn(move || event_loop.event_loop_thread(ready_tx))
            .map_err(|e| Error::startup_failed(format!("unable to spawn the pump thread: {e}")))?;

        if ready_rx.recv_timeout(config.command_timeout()).is_err() {
            return Err(Error::startup_failed(
                "the pump thread did not report readiness in time",
            ));
        }

        Ok(InotifyServer {
            channel: tx,
            waker,
            state,
            pump: Mutex::new(Some(pump)),
            timeout: config.command_timeout(),
        })
    }

    fn submit<T>(&self, command: Command, ack: Ack<T>) -> Result<T> {
        self.channel.send(command).map_err(|_| Error::closed())?;
        self.waker.wake().map_err(Error::io)?;
        ack.wait(self.timeout)
    }

    fn absolute_roots(roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
        roots.iter().map(|root| paths::absolute(root)).collect()
    }
}

impl WatchServer for InotifyServer {
    fn open<S: ChangeSink>(sink: S, config: Config) -> Result<Self> {
        Self::from_sink(Arc::new(sink), &config)
    }

    fn register(&self, roots: &[PathBuf]) -> Result<()> {
        self.state.ensure_running()?;
        let roots = Self::absolute_roots(roots)?;
        let (reply, ack) = oneshot();
        self.submit(Command::Register(roots, reply), ack)?
    }

    fn unregister(&self, roots: &[PathBuf]) -> Result<bool> {
        self.state.ensure_running()?;
        let roots = Self::absolute_roots(roots)?;
        let (reply, ack) = oneshot();
        self.submit(Command::Unregister(roots, reply), ack)
    }

    fn close(&self) {
        let pump = {
            let mut guard = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };
        let Some(pump) = pump else {
            return;
        };

        self.state.advance(ServerState::Terminating);
        let (reply, ack) = oneshot();
        if self.channel.send(Command::Terminate(reply)).is_ok() {
            if let Err(err) = self.waker.wake() {
                log::warn!("unable to wake the pump for shutdown: {err}");
            }
            if let Err(err) = ack.wait(self.timeout) {
                log::warn!("shutdown command was not acknowledged: {err}");
            }
        }
        if pump.join().is_err() {
            log::warn!("the pump thread panicked during shutdown");
        }
        self.state.advance(ServerState::Terminated);
    }

    fn kind() -> ServerKind {
        ServerKind::Inotify
    }
}

impl Drop for InotifyServer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::ErrorKind;
    use std::fs;
    use std::path::Path;

    const SILENCE: Duration = Duration::from_millis(250);

    fn server() -> (InotifyServer, EventStream) {
        let (tx, stream) = channel_sink();
        let server = InotifyServer::open(tx, Config::default()).expect("open");
        (server, stream)
    }

    #[test]
    fn server_is_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<InotifyServer>();
    }

    #[test]
    fn translate_creation_masks() {
        assert_eq!(
            translate_mask(EventMask::CREATE),
            Some(ChangeKind::Created)
        );
        assert_eq!(
            translate_mask(EventMask::MOVED_TO),
            Some(ChangeKind::Created)
        );
    }

    #[test]
    fn translate_removal_masks() {
        for mask in [EventMask::DELETE, EventMask::DELETE_SELF, EventMask::MOVED_FROM] {
            assert_eq!(translate_mask(mask), Some(ChangeKind::Removed), "{mask:?}");
        }
    }

    #[test]
    fn translate_modify_and_overflow() {
        assert_eq!(
            translate_mask(EventMask::MODIFY),
            Some(ChangeKind::Modified)
        );
        assert_eq!(
            translate_mask(EventMask::Q_OVERFLOW),
            Some(ChangeKind::Overflowed)
        );
    }

    #[test]
    fn translate_silent_masks() {
        assert_eq!(translate_mask(EventMask::IGNORED), None);
        assert_eq!(translate_mask(EventMask::UNMOUNT), None);
    }

    #[test]
    fn translate_unclassified_masks() {
        assert_eq!(
            translate_mask(EventMask::MOVE_SELF),
            Some(ChangeKind::Unknown)
        );
        assert_eq!(translate_mask(EventMask::ATTRIB), Some(ChangeKind::Unknown));
    }

    #[test]
    fn watch_mask_enforces_the_directory_contract() {
        let mask = watch_mask();
        assert!(mask.contains(WatchMask::ONLYDIR));
        assert!(mask.contains(WatchMask::DONT_FOLLOW));
        assert!(mask.contains(WatchMask::EXCL_UNLINK));
    }

    #[test]
    fn empty_lifetime_delivers_nothing() {
        let tmpdir = testdir();
        let (server, stream) = server();

        server.register(&[tmpdir.path().to_path_buf()]).expect("register");
        stream.expect_silence(Duration::from_millis(100));
        server.close();
        stream.expect_silence(Duration::from_millis(100));
    }

    #[test]
    fn single_create() {
        let tmpdir = testdir();
        let (server, stream) = server();
        server.register(&[tmpdir.path().to_path_buf()]).expect("register");

        let path = tmpdir.path().join("a.txt");
        fs::File::create_new(&path).expect("create");

        stream.expect_change(ChangeKind::Created, &path);
        stream.expect_silence(SILENCE);
    }

    #[test]
    fn write_yields_modified() {
        let tmpdir = testdir();
        let path = tmpdir.path().join("entry");
        fs::File::create_new(&path).expect("create");

        let (server, stream) = server();
        server.register(&[tmpdir.path().to_path_buf()]).expect("register");

        fs::write(&path, b"123").expect("write");

        let events = stream.drain(SILENCE);
        assert!(!events.is_empty());
        for event in events {
            assert_eq!(event.kind, ChangeKind::Modified);
            assert_eq!(event.path, path);
        }
    }

    #[test]
    fn delete_yields_removed() {
        let tmpdir = testdir();
        let path = tmpdir.path().join("entry");
        fs::File::create_new(&path).expect("create");

        let (server, stream) = server();
        server.register(&[tmpdir.path().to_path_buf()]).expect("register");

        fs::remove_file(&path).expect("remove");

        stream.expect_change(ChangeKind::Removed, &path);
        stream.expect_silence(SILENCE);
    }

    #[test]
    fn rename_within_a_root_is_removed_then_created() {
        let tmpdir = testdir();
        let path = tmpdir.path().join("entry");
        let new_path = tmpdir.path().join("renamed");
        fs::File::create_new(&path).expect("create");

        let (server, stream) = server();
        server.register(&[tmpdir.path().to_path_buf()]).expect("register");

        fs::rename(&path, &new_path).expect("rename");

        stream.expect_change(ChangeKind::Removed, &path);
        stream.expect_change(ChangeKind::Created, &new_path);
        stream.expect_silence(SILENCE);
    }

    #[test]
    fn removing_the_root_itself_is_reported_on_the_root() {
        let tmpdir = testdir();
        let root = tmpdir.path().join("sub");
        fs::create_dir(&root).expect("create_dir");

        let (server, stream) = server();
        server.register(&[root.clone()]).expect("register");

        fs::remove_dir(&root).expect("remove_dir");

        stream.expect_change(ChangeKind::Removed, &root);
        stream.expect_silence(SILENCE);

        // The kernel dropped the watch; the root is no longer known.
        assert!(!server.unregister(&[root]).expect("unregister"));
    }

    #[test]
    fn multi_root_events_are_attributed_correctly() {
        let tmpdir = testdir();
        let d1 = tmpdir.path().join("d1");
        let d2 = tmpdir.path().join("d2");
        fs::create_dir(&d1).expect("d1");
        fs::create_dir(&d2).expect("d2");

        let (server, stream) = server();
        server.register(&[d1.clone(), d2.clone()]).expect("register");

        fs::File::create_new(d1.join("a")).expect("create a");
        fs::File::create_new(d2.join("b")).expect("create b");

        let mut events = stream.drain(SILENCE);
        events.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(
            events,
            vec![
                ChangeEvent::new(ChangeKind::Created, d1.join("a")),
                ChangeEvent::new(ChangeKind::Created, d2.join("b")),
            ]
        );
    }

    #[test]
    fn duplicate_registration_fails() {
        let tmpdir = testdir();
        let (server, _stream) = server();
        let root = tmpdir.path().to_path_buf();

        server.register(&[root.clone()]).expect("register");
        let err = server.register(&[root.clone()]).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::AlreadyWatching));
        assert_eq!(err.paths, vec![root]);
    }

    #[test]
    fn duplicate_within_one_batch_fails_but_keeps_the_root() {
        let tmpdir = testdir();
        let (server, stream) = server();
        let root = tmpdir.path().to_path_buf();

        let err = server.register(&[root.clone(), root.clone()]).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::AlreadyWatching));

        // The first occurrence was registered before the batch aborted.
        fs::File::create_new(root.join("present")).expect("create");
        stream.expect_change(ChangeKind::Created, root.join("present"));
    }

    #[test]
    fn registering_a_file_fails() {
        let tmpdir = testdir();
        let file = tmpdir.path().join("plain");
        fs::write(&file, b"").expect("write");

        let (server, _stream) = server();
        let err = server.register(&[file.clone()]).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NotADirectory));
        assert_eq!(err.paths, vec![file]);
    }

    #[test]
    fn registering_a_missing_path_fails_with_io() {
        let (server, _stream) = server();
        let err = server
            .register(&[Path::new("/some/nonexistent/path").to_path_buf()])
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Io(_)));
    }

    #[test]
    fn batch_aborts_on_first_failure_keeping_earlier_roots() {
        let tmpdir = testdir();
        let d1 = tmpdir.path().join("d1");
        let d2 = tmpdir.path().join("d2");
        let file = tmpdir.path().join("plain");
        fs::create_dir(&d1).expect("d1");
        fs::create_dir(&d2).expect("d2");
        fs::write(&file, b"").expect("file");

        let (server, _stream) = server();
        let err = server
            .register(&[d1.clone(), file, d2.clone()])
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NotADirectory));

        assert!(server.unregister(&[d1]).expect("unregister d1"));
        assert!(!server.unregister(&[d2]).expect("unregister d2"));
    }

    #[test]
    fn unregister_reports_unknown_roots_but_removes_the_rest() {
        let tmpdir = testdir();
        let d1 = tmpdir.path().join("d1");
        fs::create_dir(&d1).expect("d1");

        let (server, stream) = server();
        server.register(&[d1.clone()]).expect("register");

        let all_known = server
            .unregister(&[tmpdir.path().join("unknown"), d1.clone()])
            .expect("unregister");
        assert!(!all_known);

        // d1 was still removed despite the unknown sibling.
        fs::File::create_new(d1.join("quiet")).expect("create");
        stream.expect_silence(SILENCE);
    }

    #[test]
    fn no_events_after_unregister_completes() {
        let tmpdir = testdir();
        let (server, stream) = server();
        let root = tmpdir.path().to_path_buf();

        server.register(&[root.clone()]).expect("register");
        assert!(server.unregister(&[root.clone()]).expect("unregister"));

        fs::File::create_new(root.join("quiet")).expect("create");
        stream.expect_silence(SILENCE);
    }

    #[test]
    fn watch_set_is_the_difference_of_registers_and_unregisters() {
        let tmpdir = testdir();
        let a = tmpdir.path().join("a");
        let b = tmpdir.path().join("b");
        let c = tmpdir.path().join("c");
        for dir in [&a, &b, &c] {
            fs::create_dir(dir).expect("create_dir");
        }

        let (server, stream) = server();
        server.register(&[a.clone(), b.clone(), c.clone()]).expect("register");
        assert!(server.unregister(&[b.clone()]).expect("unregister"));

        fs::File::create_new(a.join("x")).expect("a/x");
        fs::File::create_new(b.join("y")).expect("b/y");
        fs::File::create_new(c.join("z")).expect("c/z");

        let mut events = stream.drain(SILENCE);
        events.sort_by(|l, r| l.path.cmp(&r.path));
        assert_eq!(
            events,
            vec![
                ChangeEvent::new(ChangeKind::Created, a.join("x")),
                ChangeEvent::new(ChangeKind::Created, c.join("z")),
            ]
        );
    }

    #[test]
    fn close_is_idempotent() {
        let tmpdir = testdir();
        let (server, _stream) = server();
        server.register(&[tmpdir.path().to_path_buf()]).expect("register");

        server.close();
        server.close();

        let err = server
            .register(&[tmpdir.path().to_path_buf()])
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Closed));
    }

    #[test]
    fn restart_delivers_exactly_one_event_per_cycle() {
        let tmpdir = testdir();
        let root = tmpdir.path().to_path_buf();

        for name in ["first", "second"] {
            let (server, stream) = server();
            server.register(&[root.clone()]).expect("register");

            let path = root.join(name);
            fs::File::create_new(&path).expect("create");

            stream.expect_change(ChangeKind::Created, &path);
            stream.expect_silence(SILENCE);
            server.close();
        }
    }
}
