//! Server implementation for Windows' directory management APIs
//!
//! For more information see the [ReadDirectoryChangesW reference][ref].
//!
//! Each watch root owns a directory handle opened for overlapped I/O and a
//! chain of asynchronous `ReadDirectoryChangesW` requests. Completion
//! routines are delivered as APCs into the pump thread's alertable wait and
//! re-arm the next read, so commands, completions and translation all run
//! single-threaded. A watch chain moves through the linear states
//! `NotListening → Listening → Cancelled → Finished`; `Finished` is
//! terminal and releases the per-watch completion semaphore.
//!
//! [ref]: https://learn.microsoft.com/en-us/windows/win32/api/winbase/nf-winbase-readdirectorychangesw

use std::alloc;
use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::metadata;
use std::io;
use std::os::raw::c_void;
use std::os::windows::ffi::OsStringExt;
use std::path::PathBuf;
use std::ptr;
use std::rc::Rc;
use std::slice;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_OPERATION_ABORTED, ERROR_SUCCESS,
    HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
    FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE,
    FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreW, ReleaseSemaphore, WaitForSingleObjectEx, INFINITE,
};
use windows_sys::Win32::System::IO::{CancelIoEx, OVERLAPPED};

use crate::control::{oneshot, Ack, Command, ServerState, StateCell};
use crate::paths::wide;
use crate::{
    bounded, paths, unbounded, ChangeEvent, ChangeKind, ChangeSink, Config, Error, Receiver,
    Result, Sender, ServerKind, WatchServer,
};

/// How long termination waits for cancelled watch chains to deliver their
/// aborted completions before leaking the stragglers.
const TERMINATION_WINDOW: Duration = Duration::from_secs(5);

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_CREATION;

/// Collapses a `FILE_NOTIFY_INFORMATION` action into the canonical
/// taxonomy. Renames have no association between their two halves, so they
/// surface as removal of the old name and creation of the new one.
fn translate_action(action: u32) -> ChangeKind {
    match action {
        FILE_ACTION_ADDED | FILE_ACTION_RENAMED_NEW_NAME => ChangeKind::Created,
        FILE_ACTION_REMOVED | FILE_ACTION_RENAMED_OLD_NAME => ChangeKind::Removed,
        FILE_ACTION_MODIFIED => ChangeKind::Modified,
        _ => ChangeKind::Unknown,
    }
}

/// Lifecycle of one asynchronous read chain. Transitions are linear and
/// `Finished` is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WatchState {
    NotListening,
    Listening,
    Cancelled,
    Finished,
}

#[derive(Clone)]
struct ReadData {
    /// Directory that is being watched, in the unprefixed spelling used
    /// for watch-point keys and reported paths.
    root: PathBuf,
    complete_sem: HANDLE,
    state: Rc<Cell<WatchState>>,
    buffer_bytes: usize,
}

struct ReadDirectoryRequest {
    sink: Arc<dyn ChangeSink>,
    buffer: Vec<u8>,
    handle: HANDLE,
    data: ReadData,
    retired_tx: Sender<PathBuf>,
}

/// Issues the next asynchronous read of a watch chain.
///
/// On failure the chain is finished and its semaphore released; the caller
/// decides whether that also retires the watch point.
fn start_read(
    rd: &ReadData,
    sink: Arc<dyn ChangeSink>,
    handle: HANDLE,
    retired_tx: Sender<PathBuf>,
) -> io::Result<()> {
    let request = Box::new(ReadDirectoryRequest {
        sink,
        buffer: vec![0u8; rd.buffer_bytes],
        handle,
        data: rd.clone(),
        retired_tx,
    });

    unsafe {
        let overlapped = alloc::alloc_zeroed(alloc::Layout::new::<OVERLAPPED>()) as *mut OVERLAPPED;
        // When using callback based async requests, we are allowed to use
        // the hEvent member for our own purposes
        let request = Box::leak(request);
        (*overlapped).hEvent = request as *mut ReadDirectoryRequest as HANDLE;

        let ret = ReadDirectoryChangesW(
            handle,
            request.buffer.as_mut_ptr() as *mut c_void,
            request.buffer.len() as u32,
            1, // always watch the whole subtree
            NOTIFY_FILTER,
            &mut 0u32 as *mut u32, // not used for async reqs
            overlapped,
            Some(handle_event),
        );

        if ret == 0 {
            let err = io::Error::from_raw_os_error(GetLastError() as i32);
            // Because of the error, ownership of the `overlapped` alloc and
            // the request was not passed over to the kernel, so we can
            // claim it back and let it drop.
            let request = Box::from_raw(request);
            let _overlapped = Box::from_raw(overlapped);
            request.data.state.set(WatchState::Finished);
            ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
            return Err(err);
        }
        rd.state.set(WatchState::Listening);
    }
    Ok(())
}

/// Finishes a chain whose watch point must also be removed from the table.
fn retire(request: &ReadDirectoryRequest) {
    request.data.state.set(WatchState::Finished);
    unsafe {
        ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
    }
    let _ = request.retired_tx.send(request.data.root.clone());
}

unsafe extern "system" fn handle_event(
    error_code: u32,
    bytes_transferred: u32,
    overlapped: *mut OVERLAPPED,
) {
    let overlapped: Box<OVERLAPPED> = Box::from_raw(overlapped);
    let request: Box<ReadDirectoryRequest> =
        Box::from_raw(overlapped.hEvent as *mut ReadDirectoryRequest);

    match error_code {
        ERROR_OPERATION_ABORTED => {
            // received when the watch is unregistered or the server shuts
            // down; no event, the chain just ends here
            request.data.state.set(WatchState::Finished);
            ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
            return;
        }
        ERROR_ACCESS_DENIED => {
            // This can happen when the watched directory is deleted or
            // trashed. If so, report the root gone and retire the watch,
            // otherwise continue to handle the completion.
            if !request.data.root.exists() {
                request.sink.on_change(ChangeEvent::new(
                    ChangeKind::Removed,
                    request.data.root.clone(),
                ));
                retire(&request);
                return;
            }
        }
        ERROR_SUCCESS => {}
        _ => {
            log::error!(
                "unknown error in ReadDirectoryChangesW for directory {}: {}",
                request.data.root.display(),
                error_code
            );
            request.sink.on_error(&format!(
                "directory read for {} failed with error code {}",
                request.data.root.display(),
                error_code
            ));
            retire(&request);
            return;
        }
    }

    if request.data.state.get() == WatchState::Cancelled {
        // an unregister overtook this completion; do not re-arm
        request.data.state.set(WatchState::Finished);
        ReleaseSemaphore(request.data.complete_sem, 1, ptr::null_mut());
        return;
    }

    // A zero-length completion means the kernel could not fit the burst
    // into the buffer; the whole subtree must be re-enumerated.
    if bytes_transferred == 0 {
        request.sink.on_change(ChangeEvent::new(
            ChangeKind::Overflowed,
            request.data.root.clone(),
        ));
    }

    // Get the next request queued up as soon as possible; the completed
    // buffer stays valid for translation below.
    if let Err(err) = start_read(
        &request.data,
        request.sink.clone(),
        request.handle,
        request.retired_tx.clone(),
    ) {
        log::warn!(
            "unable to re-arm the directory read for {}: {err}",
            request.data.root.display()
        );
        let _ = request.retired_tx.send(request.data.root.clone());
    }

    if bytes_transferred == 0 {
        return;
    }

    // The FILE_NOTIFY_INFORMATION struct has a variable length due to the
    // variable length string as its last member; NextEntryOffset walks the
    // records. Under Wine the records are packed to 16-bit boundaries
    // instead of the required 32-bit ones, so read unaligned.
    let mut cur_offset: *const u8 = request.buffer.as_ptr();
    let mut cur_entry = ptr::read_unaligned(cur_offset as *const FILE_NOTIFY_INFORMATION);
    loop {
        // filename length is size in bytes, so / 2
        let len = cur_entry.FileNameLength as usize / 2;
        let encoded_path: &[u16] = slice::from_raw_parts(
            cur_offset.offset(std::mem::offset_of!(FILE_NOTIFY_INFORMATION, FileName) as isize)
                as _,
            len,
        );
        // prepend root to get a full path
        let path = request
            .data
            .root
            .join(PathBuf::from(OsString::from_wide(encoded_path)));

        log::trace!(
            "Event: path = `{}`, action = {:?}",
            path.display(),
            cur_entry.Action
        );
        request
            .sink
            .on_change(ChangeEvent::new(translate_action(cur_entry.Action), path));

        if cur_entry.NextEntryOffset == 0 {
            break;
        }
        cur_offset = cur_offset.offset(cur_entry.NextEntryOffset as isize);
        cur_entry = ptr::read_unaligned(cur_offset as *const FILE_NOTIFY_INFORMATION);
    }
}

/// One registered root: the directory handle, the chain state and the
/// semaphore its completions signal when the chain finishes.
struct WatchPoint {
    dir_handle: HANDLE,
    complete_sem: HANDLE,
    state: Rc<Cell<WatchState>>,
}

fn stop_watch(watch_point: &WatchPoint) {
    unsafe {
        if watch_point.state.get() == WatchState::Listening {
            CancelIoEx(watch_point.dir_handle, ptr::null());
            watch_point.state.set(WatchState::Cancelled);
        }
        CloseHandle(watch_point.dir_handle);
        if watch_point.state.get() == WatchState::Cancelled {
            // have to wait for the aborted completion, otherwise we leak
            // the memory allocated for the pending read request
            while WaitForSingleObjectEx(watch_point.complete_sem, INFINITE, 1) != WAIT_OBJECT_0 {
                // alertable wait, so the completion APC can be delivered
            }
        }
        CloseHandle(watch_point.complete_sem);
    }
}

struct EventLoop {
    event_loop_rx: Receiver<Command>,
    retired_rx: Receiver<PathBuf>,
    retired_tx: Sender<PathBuf>,
    sink: Arc<dyn ChangeSink>,
    state: Arc<StateCell>,
    watch_points: HashMap<PathBuf, WatchPoint>,
    buffer_bytes: usize,
    wakeup_sem: HANDLE,
}

impl EventLoop {
    fn run(mut self, ready_tx: crate::BoundSender<()>) {
        self.state.advance(ServerState::Running);
        let _ = ready_tx.send(());

        loop {
            self.reap_retired();

            let mut stopped = false;
            while let Ok(command) = self.event_loop_rx.try_recv() {
                match command {
                    Command::Register(roots, reply) => {
                        reply.send(self.register_roots(roots));
                    }
                    Command::Unregister(roots, reply) => {
                        reply.send(self.unregister_roots(roots));
                    }
                    Command::Terminate(reply) => {
                        self.terminate();
                        reply.send(());
                        stopped = true;
                        break;
                    }
                }
            }
            if stopped {
                break;
            }

            unsafe {
                // Alertable infinite wait: completion routines arrive here
                // as APCs, and the control side releases the semaphore
                // after every enqueue.
                WaitForSingleObjectEx(self.wakeup_sem, INFINITE, 1);
            }
        }

        // we have to clean this up, since the facade may be long gone
        unsafe {
            CloseHandle(self.wakeup_sem);
        }
        self.state.advance(ServerState::Terminated);
    }

    /// Closes the handles of watch chains that ended on their own, e.g.
    /// because the watched directory was deleted.
    fn reap_retired(&mut self) {
        while let Ok(root) = self.retired_rx.try_recv() {
            if let Some(watch_point) = self.watch_points.remove(&root) {
                log::trace!("reaping finished watch for {}", root.display());
                unsafe {
                    CloseHandle(watch_point.dir_handle);
                    CloseHandle(watch_point.complete_sem);
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
        let root = wide::strip_long_prefix(&root);
        if self.watch_points.contains_key(&root) {
            return Err(Error::already_watching().add_path(root));
        }
        let meta = metadata(&root).map_err(|e| Error::io(e).add_path(root.clone()))?;
        if !meta.is_dir() {
            return Err(Error::not_a_directory().add_path(root));
        }

        let encoded_path = wide::to_watch_path(&root);
        let handle = unsafe {
            CreateFileW(
                encoded_path.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_DELETE | FILE_SHARE_WRITE,
                ptr::null_mut(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(Error::io(io::Error::last_os_error()).add_path(root));
        }

        // every watch gets its own semaphore to signal chain completion
        let semaphore = unsafe { CreateSemaphoreW(ptr::null_mut(), 0, 1, ptr::null_mut()) };
        if semaphore.is_null() || semaphore == INVALID_HANDLE_VALUE {
            unsafe {
                CloseHandle(handle);
            }
            return Err(Error::backend_fault("failed to create semaphore for watch").add_path(root));
        }

        let rd = ReadData {
            root: root.clone(),
            complete_sem: semaphore,
            state: Rc::new(Cell::new(WatchState::NotListening)),
            buffer_bytes: self.buffer_bytes,
        };
        log::trace!("adding directory watch: {}", root.display());
        if let Err(err) = start_read(&rd, self.sink.clone(), handle, self.retired_tx.clone()) {
            unsafe {
                CloseHandle(handle);
                CloseHandle(semaphore);
            }
            return Err(Error::io(err).add_path(root));
        }

        self.watch_points.insert(
            root,
            WatchPoint {
                dir_handle: handle,
                complete_sem: semaphore,
                state: rd.state,
            },
        );
        Ok(())
    }

    fn unregister_roots(&mut self, roots: Vec<PathBuf>) -> bool {
        let mut all_known = true;
        for root in roots {
            let root = wide::strip_long_prefix(&root);
            match self.watch_points.remove(&root) {
                Some(watch_point) => {
                    log::trace!("removing directory watch for {}", root.display());
                    stop_watch(&watch_point);
                }
                None => {
                    log::debug!("unregister of a root that is not watched: {root:?}");
                    all_known = false;
                }
            }
        }
        all_known
    }

    /// Cancels every listening chain, then drains the aborted completions
    /// within [`TERMINATION_WINDOW`]. Stragglers are leaked with a warning
    /// rather than blocking shutdown.
    fn terminate(&mut self) {
        self.reap_retired();

        for (root, watch_point) in &self.watch_points {
            if watch_point.state.get() == WatchState::Listening {
                log::trace!("cancelling directory watch for {}", root.display());
                unsafe {
                    CancelIoEx(watch_point.dir_handle, ptr::null());
                }
                watch_point.state.set(WatchState::Cancelled);
            }
        }

        let deadline = Instant::now() + TERMINATION_WINDOW;
        let mut leaked = 0usize;
        for (root, watch_point) in self.watch_points.drain() {
            let mut finished = false;
            loop {
                if watch_point.state.get() == WatchState::Finished {
                    finished = true;
                    break;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                unsafe {
                    if WaitForSingleObjectEx(
                        watch_point.complete_sem,
                        remaining.as_millis() as u32,
                        1,
                    ) == WAIT_OBJECT_0
                    {
                        finished = true;
                        break;
                    }
                    // WAIT_IO_COMPLETION means some APC ran; check again
                }
            }
            if finished {
                unsafe {
                    CloseHandle(watch_point.dir_handle);
                    CloseHandle(watch_point.complete_sem);
                }
            } else {
                leaked += 1;
                log::warn!(
                    "watch for {} did not finish within the termination window; leaking its handles",
                    root.display()
                );
            }
        }
        if leaked > 0 {
            log::warn!("{leaked} watch handle(s) leaked at shutdown");
        }
    }
}

/// Change server backed by ReadDirectoryChangesW
#[derive(Debug)]
pub struct ReadDirectoryChangesServer {
    channel: Sender<Command>,
    wakeup_sem: HANDLE,
    state: Arc<StateCell>,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
    timeout: Duration,
}

// `ReadDirectoryChangesServer` is not Send/Sync because of the semaphore
// handle. It is perfectly safe to signal a semaphore from any thread.
unsafe impl Send for ReadDirectoryChangesServer {}
// All shared state behind the handle is owned by the pump thread; the
// facade only enqueues and signals.
unsafe impl Sync for ReadDirectoryChangesServer {}

impl ReadDirectoryChangesServer {
    fn from_sink(sink: Arc<dyn ChangeSink>, config: &Config) -> Result<Self> {
        let wakeup_sem = unsafe { CreateSemaphoreW(ptr::null_mut(), 0, 1, ptr::null_mut()) };
        if wakeup_sem.is_null() || wakeup_sem == INVALID_HANDLE_VALUE {
            return Err(Error::startup_failed("failed to create wakeup semaphore"));
        }

        let (tx, rx) = unbounded();
        let state = Arc::new(StateCell::new());
        let (ready_tx, ready_rx) = bounded(1);
        let buffer_bytes = config.buffer_bytes();

        // it is, in fact, ok to send the semaphore across threads
        let sem_temp = wakeup_sem as u64;
        let pump = thread::Builder::new()
            .name("pathwatch windows loop".to_string())
            .spawn({
                let state = state.clone();
                move || {
                    let wakeup_sem = sem_temp as HANDLE;
                    let (retired_tx, retired_rx) = unbounded();
                    let event_loop = EventLoop {
                        event_loop_rx: rx,
                        retired_rx,
                        retired_tx,
                        sink,
                        state,
                        watch_points: HashMap::new(),
                        buffer_bytes,
                        wakeup_sem,
                    };
                    event_loop.run(ready_tx);
                }
            })
            .map_err(|e| Error::startup_failed(format!("unable to spawn the pump thread: {e}")))?;

        if ready_rx.recv_timeout(config.command_timeout()).is_err() {
            return Err(Error::startup_failed(
                "the pump thread did not report readiness in time",
            ));
        }

        Ok(ReadDirectoryChangesServer {
            channel: tx,
            wakeup_sem,
            state,
            pump: Mutex::new(Some(pump)),
            timeout: config.command_timeout(),
        })
    }

    fn wakeup_pump(&self) {
        unsafe {
            ReleaseSemaphore(self.wakeup_sem, 1, ptr::null_mut());
        }
    }

    fn submit<T>(&self, command: Command, ack: Ack<T>) -> Result<T> {
        self.channel.send(command).map_err(|_| Error::closed())?;
        self.wakeup_pump();
        ack.wait(self.timeout)
    }

    fn absolute_roots(roots: &[PathBuf]) -> Result<Vec<PathBuf>> {
        roots.iter().map(|root| paths::absolute(root)).collect()
    }
}

impl WatchServer for ReadDirectoryChangesServer {
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
            self.wakeup_pump();
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
        ServerKind::ReadDirectoryChanges
    }
}

impl Drop for ReadDirectoryChangesServer {
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

    const SILENCE: Duration = Duration::from_millis(250);

    fn server() -> (ReadDirectoryChangesServer, EventStream) {
        let (tx, stream) = channel_sink();
        let server = ReadDirectoryChangesServer::open(tx, Config::default()).expect("open");
        (server, stream)
    }

    #[test]
    fn server_is_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<ReadDirectoryChangesServer>();
    }

    #[test]
    fn translate_known_actions() {
        assert_eq!(translate_action(FILE_ACTION_ADDED), ChangeKind::Created);
        assert_eq!(
            translate_action(FILE_ACTION_RENAMED_NEW_NAME),
            ChangeKind::Created
        );
        assert_eq!(translate_action(FILE_ACTION_REMOVED), ChangeKind::Removed);
        assert_eq!(
            translate_action(FILE_ACTION_RENAMED_OLD_NAME),
            ChangeKind::Removed
        );
        assert_eq!(translate_action(FILE_ACTION_MODIFIED), ChangeKind::Modified);
    }

    #[test]
    fn translate_unknown_actions() {
        assert_eq!(translate_action(0), ChangeKind::Unknown);
        assert_eq!(translate_action(0xFFFF), ChangeKind::Unknown);
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
    }

    #[test]
    fn rename_is_removed_then_created() {
        let tmpdir = testdir();
        let path = tmpdir.path().join("entry");
        let new_path = tmpdir.path().join("renamed");
        fs::File::create_new(&path).expect("create");

        let (server, stream) = server();
        server.register(&[tmpdir.path().to_path_buf()]).expect("register");

        fs::rename(&path, &new_path).expect("rename");

        stream.expect_change(ChangeKind::Removed, &path);
        stream.expect_change(ChangeKind::Created, &new_path);
    }

    #[test]
    fn long_path_registration_reports_unprefixed_events() {
        let tmpdir = testdir();
        let (server, stream) = server();

        let prefixed = PathBuf::from(format!(r"\\?\{}", tmpdir.path().display()));
        server.register(&[prefixed]).expect("register");

        let path = tmpdir.path().join("a.txt");
        fs::File::create_new(&path).expect("create");

        stream.expect_change(ChangeKind::Created, &path);

        // The watch-point key is the stripped spelling.
        assert!(server
            .unregister(&[tmpdir.path().to_path_buf()])
            .expect("unregister"));
    }

    #[test]
    fn duplicate_registration_fails() {
        let tmpdir = testdir();
        let (server, _stream) = server();
        let root = tmpdir.path().to_path_buf();

        server.register(&[root.clone()]).expect("register");
        let err = server.register(&[root]).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::AlreadyWatching));
    }

    #[test]
    fn registering_a_file_fails() {
        let tmpdir = testdir();
        let file = tmpdir.path().join("plain");
        fs::write(&file, b"").expect("write");

        let (server, _stream) = server();
        let err = server.register(&[file]).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NotADirectory));
    }

    #[test]
    fn registering_a_missing_path_fails_with_io() {
        let tmpdir = testdir();
        let (server, _stream) = server();
        let err = server
            .register(&[tmpdir.path().join("nonexistent")])
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Io(_)));
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
    fn close_is_idempotent() {
        let tmpdir = testdir();
        let (server, _stream) = server();
        server.register(&[tmpdir.path().to_path_buf()]).expect("register");

        server.close();
        server.close();

        let err = server.register(&[tmpdir.path().to_path_buf()]).unwrap_err();
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
            server.close();
        }
    }
}
