//! Server implementation for Darwin's FSEvents API
//!
//! FSEvents notifies clients about directories they ought to re-scan in
//! order to keep their internal data structures up-to-date with respect to
//! the true state of the file system. Notifications arrive "in bulk",
//! possibly covering several directories in a single callback, and may be
//! coalesced by the configured latency; the contract here is therefore "at
//! least one event per change, possibly directory-level".
//!
//! The pump owns a `CFRunLoop`. Commands are drained by a run-loop source
//! whose `perform` callback runs on the pump thread; the control side
//! signals the source and wakes the loop. Each watch root owns one
//! `FSEventStream` scheduled on that loop, and a periodic keep-alive timer
//! stops the loop from exiting while the watch set is empty.

#![allow(non_upper_case_globals, dead_code)]

use objc2_core_foundation as cf;
use objc2_core_services as fs;
use std::collections::{HashMap, VecDeque};
use std::ffi::{CStr, OsStr};
use std::fmt;
use std::fs::metadata;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::control::{oneshot, Ack, Command, ServerState, StateCell};
use crate::{
    bounded, paths, ChangeEvent, ChangeKind, ChangeSink, Config, Error, Result, ServerKind,
    WatchServer,
};

/// Fire interval of the keep-alive timer. The timer does no work; its only
/// purpose is to keep the run loop from exiting when no stream is scheduled.
const KEEPALIVE_INTERVAL: cf::CFTimeInterval = 60.0;

bitflags::bitflags! {
  #[repr(C)]
  #[derive(Debug)]
  struct StreamFlags: u32 {
    const NONE = fs::kFSEventStreamEventFlagNone;
    const MUST_SCAN_SUBDIRS = fs::kFSEventStreamEventFlagMustScanSubDirs;
    const USER_DROPPED = fs::kFSEventStreamEventFlagUserDropped;
    const KERNEL_DROPPED = fs::kFSEventStreamEventFlagKernelDropped;
    const IDS_WRAPPED = fs::kFSEventStreamEventFlagEventIdsWrapped;
    const HISTORY_DONE = fs::kFSEventStreamEventFlagHistoryDone;
    const ROOT_CHANGED = fs::kFSEventStreamEventFlagRootChanged;
    const MOUNT = fs::kFSEventStreamEventFlagMount;
    const UNMOUNT = fs::kFSEventStreamEventFlagUnmount;
    const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
    const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
    const INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
    const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
    const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
    const FINDER_INFO_MOD = fs::kFSEventStreamEventFlagItemFinderInfoMod;
    const ITEM_CHANGE_OWNER = fs::kFSEventStreamEventFlagItemChangeOwner;
    const ITEM_XATTR_MOD = fs::kFSEventStreamEventFlagItemXattrMod;
    const IS_FILE = fs::kFSEventStreamEventFlagItemIsFile;
    const IS_DIR = fs::kFSEventStreamEventFlagItemIsDir;
    const IS_SYMLINK = fs::kFSEventStreamEventFlagItemIsSymlink;
    const OWN_EVENT = fs::kFSEventStreamEventFlagOwnEvent;
  }
}

/// Collapses one FSEvents flag word into the canonical taxonomy.
///
/// Returns `None` for the `HistoryDone` sentinel, whose path must be
/// ignored. Drop hints outrank removal, which outranks creation: a path
/// that was recycled within one latency window carries both the created
/// and removed bits, and the consumer has to re-check it either way.
fn translate_flags(flags: StreamFlags) -> Option<ChangeKind> {
    if flags.contains(StreamFlags::HISTORY_DONE) {
        return None;
    }
    Some(
        if flags.intersects(
            StreamFlags::MUST_SCAN_SUBDIRS
                | StreamFlags::USER_DROPPED
                | StreamFlags::KERNEL_DROPPED,
        ) {
            ChangeKind::Overflowed
        } else if flags.intersects(StreamFlags::ITEM_REMOVED | StreamFlags::ROOT_CHANGED) {
            ChangeKind::Removed
        } else if flags.contains(StreamFlags::ITEM_CREATED) {
            ChangeKind::Created
        } else if flags.intersects(
            StreamFlags::ITEM_MODIFIED
                | StreamFlags::INODE_META_MOD
                | StreamFlags::FINDER_INFO_MOD
                | StreamFlags::ITEM_CHANGE_OWNER
                | StreamFlags::ITEM_XATTR_MOD,
        ) {
            ChangeKind::Modified
        } else {
            ChangeKind::Unknown
        },
    )
}

/// Control-plane mailbox drained on the pump thread.
struct Mailbox {
    queue: Mutex<VecDeque<Command>>,
}

impl Mailbox {
    fn new() -> Self {
        Mailbox {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, command: Command) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(command);
    }

    fn pop(&self) -> Option<Command> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

/// Per-stream callback context, owned by the stream itself and freed by
/// `release_context` when the stream is deallocated.
struct StreamContextInfo {
    sink: Arc<dyn ChangeSink>,
}

// Free the context when the stream created by `FSEventStreamCreate` is released.
unsafe extern "C-unwind" fn release_context(info: *const libc::c_void) {
    // Safety:
    // - `FSEventStreamContext.release` is only called when the stream is
    //   deallocated, so it is safe to convert `info` back into a box and
    //   drop it.
    unsafe {
        drop(Box::from_raw(
            info as *const StreamContextInfo as *mut StreamContextInfo,
        ));
    }
}

unsafe extern "C-unwind" fn callback(
    stream_ref: fs::ConstFSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,                          // size_t numEvents
    event_paths: ptr::NonNull<libc::c_void>,           // void *eventPaths
    event_flags: ptr::NonNull<fs::FSEventStreamEventFlags>, // const FSEventStreamEventFlags eventFlags[]
    event_ids: ptr::NonNull<fs::FSEventStreamEventId>, // const FSEventStreamEventId eventIds[]
) {
    unsafe {
        callback_impl(
            stream_ref,
            info,
            num_events,
            event_paths,
            event_flags,
            event_ids,
        )
    }
}

unsafe fn callback_impl(
    _stream_ref: fs::ConstFSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,
    event_paths: ptr::NonNull<libc::c_void>,
    event_flags: ptr::NonNull<fs::FSEventStreamEventFlags>,
    _event_ids: ptr::NonNull<fs::FSEventStreamEventId>,
) {
    let event_paths = event_paths.as_ptr() as *const *const libc::c_char;
    let info = info as *const StreamContextInfo;
    let sink = &(*info).sink;

    for p in 0..num_events {
        let raw = CStr::from_ptr(*event_paths.add(p));
        let path = PathBuf::from(OsStr::from_bytes(raw.to_bytes()));

        let flags = StreamFlags::from_bits_retain(*event_flags.as_ptr().add(p));
        log::trace!("FSEvent: path = `{}`, flags = {:?}", path.display(), flags);

        if let Some(kind) = translate_flags(flags) {
            sink.on_change(ChangeEvent::new(kind, path));
        }
    }
}

unsafe extern "C-unwind" fn keepalive(_timer: *mut cf::CFRunLoopTimer, _info: *mut libc::c_void) {}

unsafe extern "C-unwind" fn drain_commands(info: *mut libc::c_void) {
    let pump = unsafe { &mut *(info as *mut PumpState) };
    pump.drain();
}

/// One registered root: the event stream scheduled on the pump's run loop.
struct WatchPoint {
    stream: fs::FSEventStreamRef,
}

impl WatchPoint {
    /// Creates, schedules and starts a stream for `root`. Runs on the pump
    /// thread, whose current run loop is the scheduling target.
    fn new(root: &Path, latency: cf::CFTimeInterval, sink: Arc<dyn ChangeSink>) -> Result<Self> {
        let meta = metadata(root).map_err(|e| Error::io(e).add_path(root.into()))?;
        if !meta.is_dir() {
            return Err(Error::not_a_directory().add_path(root.into()));
        }

        let cf_path = match path_to_cfstring(root) {
            Some(cf_path) => cf_path,
            // Most likely the directory was deleted, or permissions
            // changed, while the above code was running.
            None => {
                return Err(Error::io(io::Error::from(io::ErrorKind::NotFound))
                    .add_path(root.into()))
            }
        };
        let stream_paths = cf::CFMutableArray::<cf::CFString>::empty();
        stream_paths.append(&cf_path);

        // Owned by the stream; freed by `release_context` on release. This
        // leaks if we panic before reaching `FSEventStreamRelease`.
        let context_info = Box::into_raw(Box::new(StreamContextInfo { sink }));

        let stream_context = fs::FSEventStreamContext {
            version: 0,
            info: context_info as *mut libc::c_void,
            retain: None,
            release: Some(release_context),
            copyDescription: None,
        };

        unsafe {
            let stream = fs::FSEventStreamCreate(
                cf::kCFAllocatorDefault,
                Some(callback),
                &stream_context as *const _ as *mut _,
                stream_paths.as_opaque(),
                fs::kFSEventStreamEventIdSinceNow,
                latency,
                fs::kFSEventStreamCreateFlagNoDefer
                    | fs::kFSEventStreamCreateFlagWatchRoot
                    | fs::kFSEventStreamCreateFlagFileEvents,
            );

            let runloop = cf::CFRunLoop::current().expect("Failed to get current runloop");
            #[allow(deprecated)]
            fs::FSEventStreamScheduleWithRunLoop(
                stream,
                &runloop,
                cf::kCFRunLoopDefaultMode.expect("Failed to get default runloop mode"),
            );
            if !fs::FSEventStreamStart(stream) {
                fs::FSEventStreamInvalidate(stream);
                fs::FSEventStreamRelease(stream);
                return Err(
                    Error::backend_fault("unable to start FSEvent stream").add_path(root.into())
                );
            }

            Ok(WatchPoint { stream })
        }
    }
}

impl Drop for WatchPoint {
    fn drop(&mut self) {
        unsafe {
            fs::FSEventStreamStop(self.stream);
            fs::FSEventStreamInvalidate(self.stream);
            fs::FSEventStreamRelease(self.stream);
        }
    }
}

/// Pump-side state, owned by the pump thread and reached from the run-loop
/// source's `perform` callback.
struct PumpState {
    mailbox: Arc<Mailbox>,
    sink: Arc<dyn ChangeSink>,
    watch_points: HashMap<PathBuf, WatchPoint>,
    latency: cf::CFTimeInterval,
}

impl PumpState {
    fn drain(&mut self) {
        while let Some(command) = self.mailbox.pop() {
            match command {
                Command::Register(roots, reply) => {
                    reply.send(self.register_roots(roots));
                }
                Command::Unregister(roots, reply) => {
                    reply.send(self.unregister_roots(roots));
                }
                Command::Terminate(reply) => {
                    // Streams are invalidated before the acknowledgement,
                    // so no callback can outrun close().
                    self.watch_points.clear();
                    reply.send(());
                    if let Some(runloop) = cf::CFRunLoop::current() {
                        runloop.stop();
                    }
                    break;
                }
            }
        }
    }

    fn register_roots(&mut self, roots: Vec<PathBuf>) -> Result<()> {
        // First failure aborts the batch; earlier roots stay registered.
        for root in roots {
            if self.watch_points.contains_key(&root) {
                return Err(Error::already_watching().add_path(root));
            }
            let watch_point = WatchPoint::new(&root, self.latency, self.sink.clone())?;
            log::trace!("adding FSEvent stream for {}", root.display());
            self.watch_points.insert(root, watch_point);
        }
        Ok(())
    }

    fn unregister_roots(&mut self, roots: Vec<PathBuf>) -> bool {
        let mut all_known = true;
        for root in roots {
            match self.watch_points.remove(&root) {
                Some(_) => log::trace!("removed FSEvent stream for {}", root.display()),
                None => {
                    log::debug!("unregister of a root that is not watched: {root:?}");
                    all_known = false;
                }
            }
        }
        all_known
    }
}

/// Handles the control side needs to reach the pump's run loop.
struct PumpHandles {
    runloop: cf::CFRetained<cf::CFRunLoop>,
    source: cf::CFRetained<cf::CFRunLoopSource>,
}

// Safety:
// - According to the Apple documentation, it's safe to move `CFRunLoop`s
//   and their sources across threads.
//   https://developer.apple.com/library/archive/documentation/Cocoa/Conceptual/Multithreading/ThreadSafetySummary/ThreadSafetySummary.html
unsafe impl Send for PumpHandles {}

/// Change server backed by FSEvents
pub struct FsEventServer {
    mailbox: Arc<Mailbox>,
    handles: PumpHandles,
    state: Arc<StateCell>,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
    timeout: Duration,
}

impl fmt::Debug for FsEventServer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FsEventServer")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

// FsEventServer is not Send/Sync automatically because of the retained
// run-loop handles. It's Send because signalling and waking a CFRunLoop
// from another thread is documented as safe.
unsafe impl Send for FsEventServer {}

// It's Sync because the retained handles are only used through thread-safe
// CF entry points; all other state is behind locks or atomics.
unsafe impl Sync for FsEventServer {}

impl FsEventServer {
    fn from_sink(sink: Arc<dyn ChangeSink>, config: &Config) -> Result<Self> {
        let mailbox = Arc::new(Mailbox::new());
        let state = Arc::new(StateCell::new());
        let latency = config.latency().as_secs_f64();

        let (ready_tx, ready_rx) = bounded::<Result<PumpHandles>>(1);
        let pump = {
            let mailbox = mailbox.clone();
            let state = state.clone();
            thread::Builder::new()
                .name("pathwatch fsevents loop".to_string())
                .spawn(move || {
                    let runloop = cf::CFRunLoop::current().expect("Failed to get current runloop");

                    let mut pump = Box::new(PumpState {
                        mailbox,
                        sink,
                        watch_points: HashMap::new(),
                        latency,
                    });

                    let mut source_context = cf::CFRunLoopSourceContext {
                        version: 0,
                        info: &mut *pump as *mut PumpState as *mut libc::c_void,
                        retain: None,
                        release: None,
                        copyDescription: None,
                        equal: None,
                        hash: None,
                        schedule: None,
                        cancel: None,
                        perform: Some(drain_commands),
                    };
                    let source = match unsafe { cf::CFRunLoopSource::new(None, 0, &mut source_context) }
                    {
                        Some(source) => source,
                        None => {
                            let _ = ready_tx.send(Err(Error::startup_failed(
                                "unable to create the command run-loop source",
                            )));
                            return;
                        }
                    };
                    runloop.add_source(Some(&source), cf::kCFRunLoopDefaultMode);

                    // The run loop exits as soon as it has nothing scheduled;
                    // the timer keeps it alive while the watch set is empty.
                    let timer = match unsafe {
                        cf::CFRunLoopTimer::new(
                            None,
                            cf::CFAbsoluteTimeGetCurrent() + KEEPALIVE_INTERVAL,
                            KEEPALIVE_INTERVAL,
                            0,
                            0,
                            Some(keepalive),
                            ptr::null_mut(),
                        )
                    } {
                        Some(timer) => timer,
                        None => {
                            let _ = ready_tx.send(Err(Error::startup_failed(
                                "unable to create the keep-alive timer",
                            )));
                            return;
                        }
                    };
                    runloop.add_timer(Some(&timer), cf::kCFRunLoopDefaultMode);

                    state.advance(ServerState::Running);
                    let _ = ready_tx.send(Ok(PumpHandles {
                        runloop: runloop.clone(),
                        source: source.clone(),
                    }));

                    // terminated by the CFRunLoop::stop in the Terminate command
                    cf::CFRunLoop::run();

                    timer.invalidate();
                    source.invalidate();
                    pump.watch_points.clear();
                    state.advance(ServerState::Terminated);
                })
                .map_err(|e| {
                    Error::startup_failed(format!("unable to spawn the pump thread: {e}"))
                })?
        };

        let handles = match ready_rx.recv_timeout(config.command_timeout()) {
            Ok(Ok(handles)) => handles,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(Error::startup_failed(
                    "the pump thread did not report readiness in time",
                ))
            }
        };

        Ok(FsEventServer {
            mailbox,
            handles,
            state,
            pump: Mutex::new(Some(pump)),
            timeout: config.command_timeout(),
        })
    }

    fn submit<T>(&self, command: Command, ack: Ack<T>) -> Result<T> {
        self.mailbox.push(command);
        self.handles.source.signal();
        self.handles.runloop.wake_up();
        ack.wait(self.timeout)
    }

    fn absolute_roots(roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
        roots.iter().map(|root| paths::absolute(root)).collect()
    }
}

impl WatchServer for FsEventServer {
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
        if let Err(err) = self.submit(Command::Terminate(reply), ack) {
            log::warn!("shutdown command was not acknowledged: {err}");
        }
        if pump.join().is_err() {
            log::warn!("the pump thread panicked during shutdown");
        }
        self.state.advance(ServerState::Terminated);
    }

    fn kind() -> ServerKind {
        ServerKind::FsEvent
    }
}

impl Drop for FsEventServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Converts a watch root into the CFString spelling FSEvents expects.
fn path_to_cfstring(path: &Path) -> Option<cf::CFRetained<cf::CFString>> {
    let url = cf::CFURL::from_file_path(path)?;
    let url = url.absolute_url()?;
    url.file_system_path(cf::CFURLPathStyle::CFURLPOSIXPathStyle)
}
