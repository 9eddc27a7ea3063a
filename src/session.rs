//! A profiling session: one scheduler thread driving the thread tracker,
//! the window controller, and any polled collectors.

use std::env::consts::{ARCH, OS};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::collector::{self, Collector};
use crate::config::Config;
use crate::controller::{ControllerSettings, ControllerState, TickOutcome, WindowController};
use crate::encoder::SessionMetadata;
use crate::error::InitError;
use crate::sample::{CaptureRequest, SampleSource};
use crate::scheduler::IntervalScheduler;
use crate::sink::{SessionCredentials, TelemetrySink};
use crate::thread_state::{ProcTaskLister, ThreadActivityTracker, ThreadLister};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SessionBuilder {
    config: Config,
    source: Box<dyn SampleSource>,
    sink: Arc<dyn TelemetrySink>,
    lister: Option<Box<dyn ThreadLister>>,
    collectors: Vec<Arc<dyn Collector>>,
    hardware: Option<String>,
    os: Option<String>,
    runtime: Option<String>,
}

impl SessionBuilder {
    pub fn new(config: Config, source: Box<dyn SampleSource>, sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            config,
            source,
            sink,
            lister: None,
            collectors: Vec::new(),
            hardware: None,
            os: None,
            runtime: None,
        }
    }

    /// Where thread states come from. Defaults to this process's `/proc/self/task`.
    pub fn thread_lister(mut self, lister: Box<dyn ThreadLister>) -> Self {
        self.lister = Some(lister);
        self
    }

    pub fn collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn hardware(mut self, description: impl Into<String>) -> Self {
        self.hardware = Some(description.into());
        self
    }

    pub fn os(mut self, description: impl Into<String>) -> Self {
        self.os = Some(description.into());
        self
    }

    pub fn runtime(mut self, description: impl Into<String>) -> Self {
        self.runtime = Some(description.into());
        self
    }

    pub fn build(self) -> Session {
        let lister = self
            .lister
            .unwrap_or_else(|| Box::new(ProcTaskLister::current()));
        let tracker = ThreadActivityTracker::new(lister, self.config.thread_history_bits);
        Session {
            tracker: Arc::new(Mutex::new(tracker)),
            source: Some(self.source),
            sink: self.sink,
            collectors: self.collectors,
            hardware: self.hardware,
            os: self.os,
            runtime: self.runtime,
            config: self.config,
            controller: None,
            scheduler: None,
            credentials: None,
            started_at: None,
            stopped_at: None,
            warnings: Vec::new(),
        }
    }
}

/// Started once, stopped once.
pub struct Session {
    config: Config,
    source: Option<Box<dyn SampleSource>>,
    sink: Arc<dyn TelemetrySink>,
    tracker: Arc<Mutex<ThreadActivityTracker>>,
    collectors: Vec<Arc<dyn Collector>>,
    hardware: Option<String>,
    os: Option<String>,
    runtime: Option<String>,
    controller: Option<Arc<Mutex<WindowController>>>,
    scheduler: Option<IntervalScheduler>,
    credentials: Option<SessionCredentials>,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
    warnings: Vec<String>,
}

impl Session {
    /// Probe the source, register with the sink and start ticking.
    ///
    /// Returns the non-fatal warnings collected on the way; they stay
    /// available from [`Session::warnings`].
    pub fn start(&mut self) -> Result<&[String], InitError> {
        if self.controller.is_some() || self.stopped_at.is_some() {
            return Err(InitError::AlreadyStarted);
        }
        if !cfg!(target_os = "linux") {
            return Err(InitError::UnsupportedPlatform {
                os: OS.to_string(),
                arch: ARCH.to_string(),
            });
        }
        let Some(source) = self.source.as_mut() else {
            return Err(InitError::AlreadyStarted);
        };

        let capabilities = source
            .probe()
            .map_err(|err| InitError::MissingCapability(format!("{err:#}")))?;
        let mut warnings = capabilities.warnings;
        let alloc = self.config.profile_memory && capabilities.supports_alloc;
        if self.config.profile_memory && !capabilities.supports_alloc {
            warnings.push("allocation profiling unavailable".to_string());
        }

        let scheduler = IntervalScheduler::new("kindling-sched").map_err(InitError::Scheduler)?;

        self.prime_tracker();

        let settings = ControllerSettings {
            request: CaptureRequest {
                kind: self.config.kind,
                interval: self.config.interval(),
                alloc,
            },
            windows: self.config.windows,
            timeline_interval: self.config.timeline_interval(),
        };
        let Some(source) = self.source.take() else {
            return Err(InitError::AlreadyStarted);
        };
        let mut controller = WindowController::new(
            settings,
            source,
            self.sink.clone(),
            self.tracker.clone(),
            self.collectors.clone(),
        );

        let credentials = match controller.begin_session(&self.metadata()) {
            Ok(credentials) => credentials,
            Err(err) => {
                self.stopped_at = Some(Instant::now());
                return Err(err);
            }
        };
        let controller = Arc::new(Mutex::new(controller));
        warnings.extend(self.schedule(&scheduler, &controller));

        for warning in &warnings {
            warn!("{warning}");
        }
        self.warnings = warnings;
        self.credentials = Some(credentials);
        self.controller = Some(controller);
        self.scheduler = Some(scheduler);
        self.started_at = Some(Instant::now());
        if let Some(url) = self.url() {
            info!(url = %url, "profiling started");
        }
        Ok(&self.warnings)
    }

    fn prime_tracker(&self) {
        let mut tracker = lock(&self.tracker);
        for _ in 0..self.config.thread_priming_rounds {
            if let Err(err) = tracker.tick() {
                warn!(error = ?err, "failed to sample thread states");
                break;
            }
        }
    }

    fn metadata(&self) -> SessionMetadata {
        SessionMetadata {
            kind: self.config.kind,
            interval: self.config.interval(),
            files: self.config.files.clone(),
            versions: self.config.versions.clone(),
            hardware: self.hardware.clone(),
            os: self.os.clone(),
            runtime: self.runtime.clone(),
            timeline: collector::timeline_descriptors(&self.collectors),
            categories: collector::graph_categories(
                &self.collectors,
                &self.config.default_categories,
            ),
        }
    }

    /// Register the periodic tasks. Collectors the scheduler refuses are
    /// reported as warnings and never polled.
    fn schedule(
        &self,
        scheduler: &IntervalScheduler,
        controller: &Arc<Mutex<WindowController>>,
    ) -> Vec<String> {
        let mut warnings = Vec::new();
        let tracker = self.tracker.clone();
        if let Err(err) = scheduler.schedule("threads", self.config.thread_poll(), move || {
            lock(&tracker).tick()
        }) {
            warnings.push(format!("thread tracking disabled: {err}"));
        }

        let handle = scheduler.handle();
        let controller = controller.clone();
        if let Err(err) = scheduler.schedule("controller", self.config.tick(), move || {
            if lock(&controller).tick() == TickOutcome::Halted {
                handle.cancel();
            }
            Ok(())
        }) {
            warnings.push(format!("sampling disabled: {err}"));
        }

        for collector in &self.collectors {
            let Some(interval) = collector.poll_interval() else {
                continue;
            };
            let name = format!("collector:{}", collector.name());
            let polled = collector.clone();
            if let Err(err) = scheduler.schedule(&name, interval, move || polled.poll()) {
                warnings.push(format!("collector {} not polled: {err}", collector.name()));
            }
        }
        warnings
    }

    /// Stop ticking and flush the last window.
    pub fn stop(&mut self) -> Result<(), InitError> {
        let Some(controller) = self.controller.take() else {
            return Err(InitError::NotRunning);
        };
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.cancel();
        }
        lock(&controller).end();
        lock(&self.tracker).clear();
        self.stopped_at = Some(Instant::now());
        info!(duration_ms = self.current_duration().as_millis() as u64, "profiling stopped");
        Ok(())
    }

    /// Where the session can be viewed, once the collector has accepted it.
    pub fn url(&self) -> Option<String> {
        self.credentials
            .as_ref()
            .and_then(|credentials| self.sink.session_url(credentials))
    }

    /// False once stopped, or once the controller has halted on its own.
    pub fn is_running(&self) -> bool {
        self.controller
            .as_ref()
            .is_some_and(|controller| lock(controller).state() != ControllerState::Stopped)
    }

    pub fn current_duration(&self) -> Duration {
        match (self.started_at, self.stopped_at) {
            (Some(started), Some(stopped)) => stopped.saturating_duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.controller.is_some() {
            let _ = self.stop();
        }
    }
}
