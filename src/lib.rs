//! Kindling - a windowed sampling-profiler agent.
//!
//! Stack samples from a [`SampleSource`] are folded into per-thread call
//! trees for a fixed window, encoded together with the new entries of a
//! session-wide method dictionary, and shipped to a [`TelemetrySink`].
//! Capture is restarted immediately after every flush so memory stays
//! bounded and data reaches the viewer early.
//!
//! # Modules
//!
//! - [`scheduler`] - fixed-rate task runner on a single worker thread
//! - [`thread_state`] - rolling per-thread activity history
//! - [`calltree`] - call tree aggregation
//! - [`dictionary`] - frame interning and incremental export
//! - [`controller`] - the sampling window state machine
//! - [`encoder`] - snapshot, timeline and session wire formats
//! - [`session`] - ties everything together
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use kindling::{Config, HttpSink, ReplaySource, SessionBuilder};
//!
//! let source = ReplaySource::from_file(Path::new("recording.json"))?;
//! let sink = HttpSink::new("https://collector.example", "token")?;
//! let mut session = SessionBuilder::new(Config::default(), Box::new(source), Arc::new(sink)).build();
//! session.start()?;
//! std::thread::sleep(std::time::Duration::from_secs(30));
//! session.stop()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod calltree;
pub mod collector;
pub mod config;
pub mod controller;
pub mod dictionary;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod replay;
pub mod sample;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod thread_state;

// Re-export for convenience
pub use collector::{Collector, EventCollector, StatCollector};
pub use config::Config;
pub use error::{InitError, ReportableError};
pub use replay::ReplaySource;
pub use sample::{SampleKind, SampleSource};
pub use session::{Session, SessionBuilder};
pub use sink::{HttpSink, MemorySink, TelemetrySink};
