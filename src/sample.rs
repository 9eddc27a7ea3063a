use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::frame::{FrameId, RawFrame};
use crate::thread_state::ThreadHandle;

/// The dimension a sample source measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    Cpu,
    Itimer,
    Wall,
    Lock,
    Alloc,
}

impl SampleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SampleKind::Cpu => "cpu",
            SampleKind::Itimer => "itimer",
            SampleKind::Wall => "wall",
            SampleKind::Lock => "lock",
            SampleKind::Alloc => "alloc",
        }
    }
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SampleKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "cpu" => SampleKind::Cpu,
            "itimer" => SampleKind::Itimer,
            "wall" => SampleKind::Wall,
            "lock" => SampleKind::Lock,
            "alloc" => SampleKind::Alloc,
            other => bail!("unknown sample kind: {other}"),
        })
    }
}

fn one() -> u32 {
    1
}

/// One observed stack. `frames` is leaf-first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSample {
    pub thread_label: String,
    pub frames: Vec<FrameId>,
    pub value: u64,
    #[serde(default = "one")]
    pub occurrences: u32,
}

/// What a capture window should record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub kind: SampleKind,
    pub interval: Duration,
    /// Record allocations alongside `kind`.
    pub alloc: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceCapabilities {
    pub supports_alloc: bool,
    /// Non-fatal problems the user should hear about.
    pub warnings: Vec<String>,
}

/// A native stack sampler.
///
/// Calls arrive from the controller's tick in the order
/// `begin`, any number of `add_thread`, `stop`, then `begin` again for the
/// next window.
pub trait SampleSource: Send {
    /// Check what this source can do on the current host.
    fn probe(&mut self) -> Result<SourceCapabilities>;

    /// Start capturing. Fails if a capture is already running.
    fn begin(&mut self, request: &CaptureRequest, threads: &[ThreadHandle]) -> Result<()>;

    /// Include `thread` in the running capture from now on.
    fn add_thread(&mut self, thread: ThreadHandle) -> Result<()>;

    /// Stop capturing and hand back everything recorded since `begin`.
    fn stop(&mut self) -> Result<Box<dyn Recording>>;
}

/// Samples captured during one window.
pub trait Recording: Send {
    fn duration(&self) -> Duration;

    /// Lazily yield the samples of one kind.
    fn samples<'a>(&'a self, kind: SampleKind) -> Box<dyn Iterator<Item = StackSample> + 'a>;

    fn frame(&self, id: FrameId) -> Option<RawFrame>;
}

/// A recording assembled in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecording {
    duration: Duration,
    frames: HashMap<FrameId, RawFrame>,
    samples: Vec<(SampleKind, StackSample)>,
}

impl MemoryRecording {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    pub fn add_frame(&mut self, id: FrameId, frame: RawFrame) {
        self.frames.insert(id, frame);
    }

    pub fn add_sample(&mut self, kind: SampleKind, sample: StackSample) {
        self.samples.push((kind, sample));
    }
}

impl Recording for MemoryRecording {
    fn duration(&self) -> Duration {
        self.duration
    }

    fn samples<'a>(&'a self, kind: SampleKind) -> Box<dyn Iterator<Item = StackSample> + 'a> {
        Box::new(
            self.samples
                .iter()
                .filter(move |(k, _)| *k == kind)
                .map(|(_, sample)| sample.clone()),
        )
    }

    fn frame(&self, id: FrameId) -> Option<RawFrame> {
        self.frames.get(&id).cloned()
    }
}
