//! Continuous scan session.
//!
//! A [`ScanSession`] owns one [`FrameSource`] at a time. `start` opens the
//! device and hands it to a background `cam-worker` thread that pulls frames,
//! publishes them, runs the decode engine and paces itself with the
//! [`ScanTiming`] backoff policy. Observer callbacks run on a separate
//! `cam-events` thread fed through a FIFO channel, so a slow observer never
//! stretches the capture cadence.
//!
//! Whatever ends the loop (a `stop` call, the device going away, a capture
//! error, dropping the session) the device is closed exactly once and a
//! final status event is published.
//!
//! # Example
//!
//! ```rust,no_run
//! use qr_cam_scan::session::{ScanSession, SessionObserver, StatusEvent};
//! use qr_cam_scan::V4L2FrameSource;
//!
//! struct Printer;
//!
//! impl SessionObserver for Printer {
//!     fn on_result(&mut self, text: &str) {
//!         println!("{text}");
//!     }
//!
//!     fn on_status(&mut self, status: &StatusEvent) {
//!         eprintln!("{}", status.message);
//!     }
//! }
//!
//! let session = ScanSession::default();
//! session
//!     .start(|| Some(V4L2FrameSource::new(0)), Printer)
//!     .expect("camera should start");
//! std::thread::sleep(std::time::Duration::from_secs(10));
//! session.stop();
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::decode::{DecodeEngine, DecodeOutcome, RqrrEngine};
use crate::traits::{CameraError, Frame, FrameSource};

/// Pause after a read that produced no frame.
pub const POLL_EMPTY_DELAY: Duration = Duration::from_millis(100);
/// Pause after a frame without a usable code.
pub const RETRY_DELAY: Duration = Duration::from_millis(80);
/// Pause after publishing a decoded result.
pub const DEBOUNCE_DELAY: Duration = Duration::from_millis(1200);

/// Status published when no device could be obtained.
pub const MSG_NO_DEVICE: &str = "No webcam detected.";
/// Status published once the device is open and the loop is running.
pub const MSG_STARTED: &str = "Camera started.";
/// Status published after each decoded result.
pub const MSG_DECODED: &str = "Decoded from camera.";
/// Status published when the loop ends without an error.
pub const MSG_STOPPED: &str = "Camera stopped.";

/// Backoff policy of the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTiming {
    /// Pause when the device had no frame ready.
    pub poll_empty_delay: Duration,
    /// Pause when a frame held no decodable code.
    pub retry_delay: Duration,
    /// Pause after a successful decode, so a code held in view is not
    /// announced on every frame.
    pub debounce_delay: Duration,
}

impl Default for ScanTiming {
    fn default() -> Self {
        Self {
            poll_empty_delay: POLL_EMPTY_DELAY,
            retry_delay: RETRY_DELAY,
            debounce_delay: DEBOUNCE_DELAY,
        }
    }
}

/// Lifecycle of a [`ScanSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Never started.
    Idle = 0,
    /// `start` is obtaining and opening the device.
    Starting = 1,
    /// The capture loop is running.
    Running = 2,
    /// `stop` was requested; the loop is winding down.
    Stopping = 3,
    /// The loop ended normally or no device was found.
    Stopped = 4,
    /// The device failed to open or failed mid-loop.
    Failed = 5,
}

impl SessionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            5 => Self::Failed,
            _ => Self::Idle,
        }
    }

    /// Whether a loop is (or is about to be) active.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

/// Transient status message for the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Human-readable text.
    pub message: String,
    /// Whether this reports a failure.
    pub is_error: bool,
}

impl StatusEvent {
    /// An informational status.
    #[must_use]
    pub fn info<M: Into<String>>(message: M) -> Self {
        Self {
            message: message.into(),
            is_error: false,
        }
    }

    /// An error status.
    #[must_use]
    pub fn error<M: Into<String>>(message: M) -> Self {
        Self {
            message: message.into(),
            is_error: true,
        }
    }
}

/// Consumer of session events.
///
/// All callbacks run on the session's `cam-events` thread, in the order the
/// loop produced them. Adapters that need a UI thread marshal from there.
pub trait SessionObserver: Send + 'static {
    /// A new frame was captured. Called before decoding is attempted.
    fn on_frame(&mut self, frame: &Frame) {
        let _ = frame;
    }

    /// A non-blank code was decoded.
    fn on_result(&mut self, text: &str);

    /// Lifecycle or error status changed.
    fn on_status(&mut self, status: &StatusEvent);
}

/// Why [`ScanSession::start`] refused to start.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The factory produced no device.
    #[error("No webcam detected.")]
    DeviceUnavailable,
    /// A session is already starting or running.
    #[error("A scan session is already running")]
    AlreadyRunning,
    /// The device exists but could not be opened.
    #[error("Camera error: {0}")]
    Open(#[source] CameraError),
    /// The worker threads could not be spawned.
    #[error("Failed to spawn scan thread: {0}")]
    Spawn(#[source] std::io::Error),
}

enum SessionEvent {
    Frame(Arc<Frame>),
    Result(String),
    Status(StatusEvent),
}

enum LoopExit {
    Cancelled,
    DeviceClosed,
    Failed(String),
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    cancelled: AtomicBool,
    last_status: Mutex<Option<StatusEvent>>,
}

impl Shared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Producer side of the observer queue.
struct Events {
    tx: Sender<SessionEvent>,
    shared: Arc<Shared>,
}

impl Events {
    fn frame(&self, frame: Arc<Frame>) {
        let _ = self.tx.send(SessionEvent::Frame(frame));
    }

    fn result(&self, text: String) {
        let _ = self.tx.send(SessionEvent::Result(text));
    }

    fn status(&self, status: StatusEvent) {
        *self
            .shared
            .last_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(status.clone());
        let _ = self.tx.send(SessionEvent::Status(status));
    }
}

/// Interruptible sleeps for the capture loop.
struct Pacer {
    wake: Receiver<()>,
    shared: Arc<Shared>,
}

impl Pacer {
    /// Sleep for `delay`. Returns `false` once cancellation was requested.
    fn pause(&self, delay: Duration) -> bool {
        if self.shared.is_cancelled() {
            return false;
        }
        match self.wake.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => !self.shared.is_cancelled(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

/// Owns an opened device and closes it exactly once, at the latest on drop.
struct DeviceGuard<S: FrameSource> {
    source: S,
    closed: bool,
}

impl<S: FrameSource> DeviceGuard<S> {
    const fn new(source: S) -> Self {
        Self {
            source,
            closed: false,
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if panic::catch_unwind(AssertUnwindSafe(|| self.source.close())).is_err() {
            log::warn!("capture device panicked while closing");
        }
    }
}

impl<S: FrameSource> Drop for DeviceGuard<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Threads backing one started session.
struct Worker {
    // Dropping this sender wakes the loop out of any pause.
    wake: Sender<()>,
    capture: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Worker {
    fn shutdown(self) {
        let Self {
            wake,
            capture,
            dispatcher,
        } = self;
        drop(wake);
        join_quietly(capture);
        join_quietly(dispatcher);
    }
}

fn join_quietly(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("scan").to_owned();
    // An observer may stop or restart the session from inside a callback.
    if handle.thread().id() == thread::current().id() {
        log::debug!("{name} thread is finishing the current callback; not joining itself");
        return;
    }
    if handle.join().is_err() {
        log::warn!("{name} thread panicked");
    }
}

/// Continuous camera scan session. See the module docs.
pub struct ScanSession {
    engine: Arc<dyn DecodeEngine>,
    timing: ScanTiming,
    exclusive: bool,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Default for ScanSession {
    fn default() -> Self {
        Self::new(RqrrEngine)
    }
}

impl std::fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanSession")
            .field("state", &self.state())
            .field("timing", &self.timing)
            .field("exclusive", &self.exclusive)
            .finish_non_exhaustive()
    }
}

impl ScanSession {
    /// Create an idle session with the default backoff policy.
    #[must_use]
    pub fn new<E: DecodeEngine + 'static>(engine: E) -> Self {
        Self::with_timing(engine, ScanTiming::default())
    }

    /// Create an idle session with a custom backoff policy.
    #[must_use]
    pub fn with_timing<E: DecodeEngine + 'static>(engine: E, timing: ScanTiming) -> Self {
        Self {
            engine: Arc::new(engine),
            timing,
            exclusive: true,
            shared: Arc::new(Shared {
                state: AtomicU8::new(SessionState::Idle as u8),
                cancelled: AtomicBool::new(false),
                last_status: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Whether devices are opened in exclusive mode (default `true`).
    #[must_use]
    pub const fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// The backoff policy in use.
    pub const fn timing(&self) -> ScanTiming {
        self.timing
    }

    /// The most recent status event published by this session.
    pub fn last_status(&self) -> Option<StatusEvent> {
        self.shared
            .last_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Obtain a device from `factory`, open it and start scanning.
    ///
    /// Opening happens on the calling thread, bounded by the source's own
    /// timeout; the loop then runs in the background and this returns. Start
    /// failures are also published to `observer` as an error status before
    /// this returns.
    ///
    /// # Errors
    ///
    /// * `AlreadyRunning` if the session is starting, running or stopping.
    ///   No device is requested in that case.
    /// * `DeviceUnavailable` if `factory` returns `None`. The session ends
    ///   in `Stopped`.
    /// * `Open` if the device failed to open. The session ends in `Failed`.
    pub fn start<F, S, O>(&self, factory: F, observer: O) -> Result<(), StartError>
    where
        F: FnOnce() -> Option<S>,
        S: FrameSource + 'static,
        O: SessionObserver,
    {
        let previous = {
            let mut slot = self.slot();
            // Leaving an inactive state only happens here, under the slot lock.
            let current = self.shared.state();
            if current.is_active() || !self.shared.transition(current, SessionState::Starting) {
                return Err(StartError::AlreadyRunning);
            }
            self.shared.cancelled.store(false, Ordering::SeqCst);
            slot.take()
        };
        if let Some(previous) = previous {
            previous.shutdown();
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let dispatcher = match thread::Builder::new()
            .name("cam-events".to_owned())
            .spawn(move || dispatch(&rx, observer))
        {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.set_state(SessionState::Failed);
                return Err(StartError::Spawn(err));
            }
        };
        let events = Events {
            tx,
            shared: Arc::clone(&self.shared),
        };

        let Some(mut source) = factory() else {
            log::warn!("no capture device available");
            events.status(StatusEvent::error(MSG_NO_DEVICE));
            self.shared.set_state(SessionState::Stopped);
            finish_start(events, dispatcher);
            return Err(StartError::DeviceUnavailable);
        };

        if let Err(err) = source.open(self.exclusive) {
            log::error!("failed to open capture device: {err}");
            events.status(StatusEvent::error(format!("Camera error: {err}")));
            self.shared.set_state(SessionState::Failed);
            finish_start(events, dispatcher);
            return Err(StartError::Open(err));
        }
        log::info!("capture device opened");
        let device = DeviceGuard::new(source);

        let mut slot = self.slot();
        if self.shared.is_cancelled() {
            // stop() arrived while the device was opening.
            drop(slot);
            drop(device);
            events.status(StatusEvent::info(MSG_STOPPED));
            self.shared.set_state(SessionState::Stopped);
            finish_start(events, dispatcher);
            return Ok(());
        }

        events.status(StatusEvent::info(MSG_STARTED));
        let (wake_tx, wake_rx) = crossbeam_channel::bounded::<()>(0);
        let pacer = Pacer {
            wake: wake_rx,
            shared: Arc::clone(&self.shared),
        };
        let engine = Arc::clone(&self.engine);
        let timing = self.timing;

        // Running before spawn: the loop is the only writer from here on.
        self.shared.set_state(SessionState::Running);
        let capture = thread::Builder::new()
            .name("cam-worker".to_owned())
            .spawn(move || run_capture(device, engine.as_ref(), timing, &pacer, &events));
        match capture {
            Ok(capture) => {
                *slot = Some(Worker {
                    wake: wake_tx,
                    capture,
                    dispatcher,
                });
                Ok(())
            }
            Err(err) => {
                // The device guard went down with the closure and closed it.
                drop(slot);
                self.shared.set_state(SessionState::Failed);
                join_quietly(dispatcher);
                Err(StartError::Spawn(err))
            }
        }
    }

    /// Stop scanning.
    ///
    /// Idempotent and callable from any thread, including from inside an
    /// observer callback. When it returns the device is closed and no
    /// further callbacks will fire (a callback currently running `stop`
    /// itself finishes normally). Calling it while `start` is still opening
    /// the device makes that `start` close the device before returning.
    pub fn stop(&self) {
        let worker = {
            let mut slot = self.slot();
            let state = self.shared.state();
            if matches!(state, SessionState::Starting | SessionState::Running) {
                self.shared.cancelled.store(true, Ordering::SeqCst);
            }
            if self.shared.transition(SessionState::Running, SessionState::Stopping) {
                log::info!("stopping scan session");
            }
            slot.take()
        };

        if let Some(worker) = worker {
            worker.shutdown();
        }
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Flush the observer queue of a start attempt that never reached the loop.
fn finish_start(events: Events, dispatcher: JoinHandle<()>) {
    drop(events);
    join_quietly(dispatcher);
}

fn dispatch<O: SessionObserver>(rx: &Receiver<SessionEvent>, mut observer: O) {
    for event in rx {
        let delivered = panic::catch_unwind(AssertUnwindSafe(|| match &event {
            SessionEvent::Frame(frame) => observer.on_frame(frame),
            SessionEvent::Result(text) => observer.on_result(text),
            SessionEvent::Status(status) => observer.on_status(status),
        }));
        if delivered.is_err() {
            log::warn!("session observer panicked; event dropped");
        }
    }
}

fn run_capture<S: FrameSource>(
    mut device: DeviceGuard<S>,
    engine: &dyn DecodeEngine,
    timing: ScanTiming,
    pacer: &Pacer,
    events: &Events,
) {
    let exit = scan_frames(&mut device.source, engine, timing, pacer, events);
    device.close();

    match exit {
        LoopExit::Cancelled => {
            log::info!("scan session stopped");
            events.status(StatusEvent::info(MSG_STOPPED));
            events.shared.set_state(SessionState::Stopped);
        }
        LoopExit::DeviceClosed => {
            log::info!("capture device closed; scan session ended");
            events.status(StatusEvent::info(MSG_STOPPED));
            events.shared.set_state(SessionState::Stopped);
        }
        LoopExit::Failed(detail) => {
            log::error!("capture failed: {detail}");
            events.status(StatusEvent::error(format!("Camera error: {detail}")));
            events.shared.set_state(SessionState::Failed);
        }
    }
}

fn scan_frames<S: FrameSource>(
    source: &mut S,
    engine: &dyn DecodeEngine,
    timing: ScanTiming,
    pacer: &Pacer,
    events: &Events,
) -> LoopExit {
    while !pacer.shared.is_cancelled() {
        if !source.is_open() {
            return LoopExit::DeviceClosed;
        }

        let frame = match panic::catch_unwind(AssertUnwindSafe(|| source.read_frame())) {
            Ok(Ok(Some(frame))) => Arc::new(frame),
            Ok(Ok(None)) => {
                if !pacer.pause(timing.poll_empty_delay) {
                    break;
                }
                continue;
            }
            Ok(Err(err)) => return LoopExit::Failed(err.to_string()),
            Err(_) => return LoopExit::Failed("capture device panicked".to_owned()),
        };

        events.frame(Arc::clone(&frame));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.decode(&frame)))
            .unwrap_or_else(|_| {
                log::warn!("decode engine panicked; treating frame as empty");
                DecodeOutcome::NotFound
            });

        let delay = if let Some(text) = outcome.text() {
            log::debug!("decoded {} bytes from frame {}", text.len(), frame.metadata().sequence);
            events.result(text.to_owned());
            events.status(StatusEvent::info(MSG_DECODED));
            timing.debounce_delay
        } else {
            log::trace!("frame {}: {outcome:?}", frame.metadata().sequence);
            timing.retry_delay
        };

        if !pacer.pause(delay) {
            break;
        }
    }
    LoopExit::Cancelled
}
