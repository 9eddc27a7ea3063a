//! The sampling window state machine.
//!
//! ```text
//! Idle -> Starting -> Sampling <-> Flushing
//!                        \            \
//!                         `-> Stopped <-'
//! ```
//!
//! The controller is driven by ticks from an [`IntervalScheduler`]. The
//! first tick after the handshake begins capturing. Every later tick checks
//! whether the current window has run its course; if so the capture is
//! stopped, folded into call trees, uploaded with the new dictionary
//! entries, and restarted before the tick returns. Window boundaries are
//! decided by elapsed wall-clock time since the window began, so tick jitter
//! can delay a flush by at most one tick but never skips one.
//!
//! [`IntervalScheduler`]: crate::scheduler::IntervalScheduler

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use tracing::{debug, error, info, warn};

use crate::calltree::ThreadForest;
use crate::collector::{self, Collector};
use crate::config::WindowPolicy;
use crate::dictionary::MethodDictionary;
use crate::encoder::{self, SessionMetadata, SnapshotInfo};
use crate::error::{EncodeError, InitError, ReportableError};
use crate::frame::FrameCache;
use crate::sample::{CaptureRequest, Recording, SampleKind, SampleSource};
use crate::sink::{SessionCredentials, TelemetrySink};
use crate::thread_state::{ThreadActivityTracker, ThreadHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Starting,
    Sampling,
    Flushing,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// The controller is stopped; the scheduler driving it should be cancelled.
    Halted,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub request: CaptureRequest,
    pub windows: WindowPolicy,
    pub timeline_interval: Duration,
}

/// Why a flush did not complete.
enum FlushError {
    /// Lose this window and keep going.
    Window(anyhow::Error),
    /// Stop the session.
    Fatal(anyhow::Error),
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic>".to_string())
}

fn log_reportable(what: &str, err: &ReportableError) {
    warn!(
        user_message = err.user_message(),
        detail = err.detail(),
        cause = ?std::error::Error::source(err),
        "{what}"
    );
}

pub struct WindowController {
    settings: ControllerSettings,
    state: ControllerState,
    source: Box<dyn SampleSource>,
    sink: Arc<dyn TelemetrySink>,
    tracker: Arc<Mutex<ThreadActivityTracker>>,
    collectors: Vec<Arc<dyn Collector>>,
    dictionary: MethodDictionary,
    session: Option<SessionCredentials>,
    capturing: bool,
    /// The last stop failed, so the source may still be capturing.
    stop_failed: bool,
    armed: HashSet<ThreadHandle>,
    window_started: Option<Instant>,
    windows_flushed: u32,
    ticks: u64,
    last_timeline: Option<Instant>,
    timeline_started_ms: u64,
}

impl WindowController {
    pub fn new(
        settings: ControllerSettings,
        source: Box<dyn SampleSource>,
        sink: Arc<dyn TelemetrySink>,
        tracker: Arc<Mutex<ThreadActivityTracker>>,
        collectors: Vec<Arc<dyn Collector>>,
    ) -> Self {
        Self {
            settings,
            state: ControllerState::Idle,
            source,
            sink,
            tracker,
            collectors,
            dictionary: MethodDictionary::new(),
            session: None,
            capturing: false,
            stop_failed: false,
            armed: HashSet::new(),
            window_started: None,
            windows_flushed: 0,
            ticks: 0,
            last_timeline: None,
            timeline_started_ms: 0,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn windows_flushed(&self) -> u32 {
        self.windows_flushed
    }

    /// Register the session with the sink and start the collectors.
    pub fn begin_session(
        &mut self,
        metadata: &SessionMetadata,
    ) -> Result<SessionCredentials, InitError> {
        match self.state {
            ControllerState::Idle => {}
            ControllerState::Stopped => return Err(InitError::NotRunning),
            _ => return Err(InitError::AlreadyStarted),
        }
        let session = match self.sink.create_session(metadata) {
            Ok(session) => session,
            Err(err) => {
                self.state = ControllerState::Stopped;
                return Err(InitError::Handshake(err));
            }
        };
        info!(session = %session.id, kind = %self.settings.request.kind, "profiling session created");
        self.session = Some(session.clone());
        self.state = ControllerState::Starting;
        self.timeline_started_ms = epoch_ms();
        collector::start_all(&self.collectors);
        Ok(session)
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.tick_at(Instant::now())
    }

    /// Advance the controller as if the clock read `now`.
    ///
    /// Nothing escapes a tick: failures scoped to one window are logged,
    /// anything else shuts the session down and reports [`TickOutcome::Halted`].
    pub fn tick_at(&mut self, now: Instant) -> TickOutcome {
        match self.state {
            ControllerState::Idle => return TickOutcome::Continue,
            ControllerState::Stopped => return TickOutcome::Halted,
            _ => {}
        }
        self.ticks += 1;

        let failure = match panic::catch_unwind(AssertUnwindSafe(|| self.run_tick(now))) {
            Ok(Ok(())) => return TickOutcome::Continue,
            Ok(Err(err)) => err,
            Err(payload) => anyhow!("tick panicked: {}", panic_message(&*payload)),
        };
        error!(error = ?failure, tick = self.ticks, "profiler failed, stopping the session");
        self.shutdown_after_failure();
        TickOutcome::Halted
    }

    fn run_tick(&mut self, now: Instant) -> anyhow::Result<()> {
        match self.state {
            ControllerState::Starting => {
                self.last_timeline = Some(now);
                self.start_window(now);
                self.state = ControllerState::Sampling;
            }
            ControllerState::Sampling => {
                self.arm_new_threads();
                if self
                    .last_timeline
                    .is_some_and(|last| now.duration_since(last) >= self.settings.timeline_interval)
                {
                    self.last_timeline = Some(now);
                    self.send_timeline();
                }
                let window = self.settings.windows.window_after(self.windows_flushed);
                if self
                    .window_started
                    .is_some_and(|started| now.duration_since(started) >= window)
                {
                    self.flush_window(now)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn tracker(&self) -> MutexGuard<'_, ThreadActivityTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_window(&mut self, now: Instant) {
        let threads = self.tracker().active_threads();
        self.window_started = Some(now);
        match self.begin_capture(&threads) {
            Ok(()) => {
                debug!(threads = threads.len(), window = self.windows_flushed + 1, "capture started");
                self.capturing = true;
                self.armed = threads.into_iter().collect();
            }
            Err(err) => {
                // Try again when this window would have ended.
                warn!(error = ?err, "failed to start capture, skipping this window");
                self.capturing = false;
                self.armed.clear();
            }
        }
    }

    /// Begin a capture, stopping once and retrying if the previous stop
    /// failed and left the source running.
    fn begin_capture(&mut self, threads: &[ThreadHandle]) -> anyhow::Result<()> {
        let err = match self.source.begin(&self.settings.request, threads) {
            Ok(()) => {
                self.stop_failed = false;
                return Ok(());
            }
            Err(err) => err,
        };
        if !std::mem::take(&mut self.stop_failed) {
            return Err(err);
        }
        debug!(error = ?err, "begin failed after a failed stop, stopping again");
        if let Err(err) = self.source.stop() {
            warn!(error = ?err, "second stop failed");
        }
        self.source.begin(&self.settings.request, threads)
    }

    /// Tell the source about threads that became active mid-window.
    fn arm_new_threads(&mut self) {
        if !self.capturing {
            return;
        }
        let active = self.tracker().active_threads();
        for thread in active {
            if self.armed.contains(&thread) {
                continue;
            }
            match self.source.add_thread(thread) {
                Ok(()) => {
                    self.armed.insert(thread);
                }
                Err(err) => warn!(tid = thread.tid(), error = ?err, "failed to add thread to capture"),
            }
        }
    }

    fn flush_window(&mut self, now: Instant) -> anyhow::Result<()> {
        self.state = ControllerState::Flushing;
        match self.collect_and_upload() {
            Ok(()) => {}
            Err(FlushError::Window(err)) => warn!(error = ?err, "window lost"),
            Err(FlushError::Fatal(err)) => return Err(err),
        }
        self.windows_flushed += 1;
        self.start_window(now);
        self.state = ControllerState::Sampling;
        Ok(())
    }

    /// Stop the capture if one is running, encode it and upload it.
    fn collect_and_upload(&mut self) -> Result<(), FlushError> {
        let (time, memory, info) = if self.capturing {
            self.capturing = false;
            let recording = match self.source.stop() {
                Ok(recording) => recording,
                Err(err) => {
                    self.stop_failed = true;
                    return Err(FlushError::Window(err));
                }
            };
            self.build_forests(recording.as_ref())
        } else {
            (ThreadForest::new(), ThreadForest::new(), SnapshotInfo::default())
        };

        let payload = match encoder::encode_snapshot(info, &time, &memory, &mut self.dictionary) {
            Ok(payload) => payload,
            Err(EncodeError::Dictionary(err)) => return Err(FlushError::Fatal(err.into())),
            Err(err) => return Err(FlushError::Window(err.into())),
        };
        debug!(
            window = self.windows_flushed + 1,
            samples = info.samples,
            threads = time.len(),
            bytes = payload.len(),
            "window flushed"
        );

        if let Some(session) = &self.session {
            if let Err(err) = self.sink.upload_snapshot(session, &payload) {
                log_reportable("failed to upload snapshot", &err);
            }
        }
        Ok(())
    }

    fn build_forests(&self, recording: &dyn Recording) -> (ThreadForest, ThreadForest, SnapshotInfo) {
        let mut cache = FrameCache::new();
        let mut drain = |kind: SampleKind| {
            let mut forest = ThreadForest::new();
            let mut samples = 0u64;
            for sample in recording.samples(kind) {
                samples += u64::from(sample.occurrences);
                forest.ingest(&sample, |id| cache.resolve(id, |id| recording.frame(id)));
            }
            (forest, samples)
        };

        let (time, time_samples) = drain(self.settings.request.kind);
        let (memory, memory_samples) = if self.settings.request.alloc {
            drain(SampleKind::Alloc)
        } else {
            (ThreadForest::new(), 0)
        };
        let info = SnapshotInfo {
            samples: time_samples.max(memory_samples),
            time_ms: recording.duration().as_millis() as u64,
        };
        (time, memory, info)
    }

    fn send_timeline(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let stopped_at = epoch_ms();
        let data = collector::drain_all(&self.collectors);
        match encoder::encode_timeline(self.timeline_started_ms, stopped_at, &data) {
            Ok(payload) => {
                if let Err(err) = self.sink.upload_timeline(session, &payload) {
                    log_reportable("failed to upload timeline", &err);
                }
            }
            Err(err) => warn!(error = ?err, "failed to encode timeline"),
        }
        self.timeline_started_ms = stopped_at;
    }

    /// Stop collectors, send the last timeline, flush whatever was captured,
    /// and stop. Calling it again does nothing.
    pub fn end(&mut self) {
        match self.state {
            ControllerState::Stopped => return,
            ControllerState::Idle => {
                self.state = ControllerState::Stopped;
                return;
            }
            _ => {}
        }
        collector::stop_all(&self.collectors);
        self.send_timeline();
        match self.collect_and_upload() {
            Ok(()) => {}
            Err(FlushError::Window(err)) => warn!(error = ?err, "final window lost"),
            Err(FlushError::Fatal(err)) => error!(error = ?err, "final window could not be encoded"),
        }
        self.state = ControllerState::Stopped;
        info!(windows = self.windows_flushed, "profiling session stopped");
    }

    /// Best-effort teardown after a tick failed in a way the session cannot survive.
    fn shutdown_after_failure(&mut self) {
        let teardown = panic::catch_unwind(AssertUnwindSafe(|| {
            collector::stop_all(&self.collectors);
            if let Err(FlushError::Window(err) | FlushError::Fatal(err)) = self.collect_and_upload() {
                warn!(error = ?err, "final flush after failure did not complete");
            }
        }));
        if teardown.is_err() {
            warn!("teardown after failure panicked");
        }
        if self.capturing {
            self.capturing = false;
            if let Err(err) = self.source.stop() {
                warn!(error = ?err, "failed to stop the sample source");
            }
        }
        self.state = ControllerState::Stopped;
    }
}
