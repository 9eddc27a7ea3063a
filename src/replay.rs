//! A sample source that plays back a recorded set of stacks.
//!
//! The file is JSON:
//!
//! ```json
//! {
//!   "frames": { "1": { "type_name": "app/Server", "name": "run", "signature": "()V" } },
//!   "samples": [ { "kind": "itimer", "thread_label": "main", "frames": [1], "value": 5 } ]
//! }
//! ```
//!
//! Every window yields the whole file again, timed by how long the window
//! actually ran.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::frame::{FrameId, RawFrame};
use crate::sample::{
    CaptureRequest, MemoryRecording, Recording, SampleKind, SampleSource, SourceCapabilities,
    StackSample,
};
use crate::thread_state::ThreadHandle;

#[derive(Debug, Deserialize)]
struct ReplaySample {
    kind: SampleKind,
    #[serde(flatten)]
    sample: StackSample,
}

#[derive(Debug, Deserialize)]
struct ReplayFile {
    #[serde(default)]
    frames: HashMap<FrameId, RawFrame>,
    #[serde(default)]
    samples: Vec<ReplaySample>,
}

#[derive(Debug)]
pub struct ReplaySource {
    frames: HashMap<FrameId, RawFrame>,
    samples: Vec<(SampleKind, StackSample)>,
    started: Option<Instant>,
}

impl ReplaySource {
    pub fn new(
        frames: HashMap<FrameId, RawFrame>,
        samples: Vec<(SampleKind, StackSample)>,
    ) -> Self {
        Self {
            frames,
            samples,
            started: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read recording {}", path.display()))?;
        Self::from_json(&contents)
            .with_context(|| format!("Failed to parse recording {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: ReplayFile = serde_json::from_str(json)?;
        Ok(Self::new(
            file.frames,
            file.samples
                .into_iter()
                .map(|s| (s.kind, s.sample))
                .collect(),
        ))
    }

    fn kinds(&self) -> BTreeSet<&'static str> {
        self.samples.iter().map(|(kind, _)| kind.as_str()).collect()
    }

    fn has_kind(&self, kind: SampleKind) -> bool {
        self.samples.iter().any(|(k, _)| *k == kind)
    }
}

impl SampleSource for ReplaySource {
    fn probe(&mut self) -> Result<SourceCapabilities> {
        if self.samples.is_empty() {
            bail!("recording contains no samples");
        }
        let mut warnings = Vec::new();
        let unknown = self
            .samples
            .iter()
            .flat_map(|(_, sample)| &sample.frames)
            .find(|id| !self.frames.contains_key(id));
        if let Some(id) = unknown {
            warnings.push(format!("recording references unknown frame {id}"));
        }
        Ok(SourceCapabilities {
            supports_alloc: self.has_kind(SampleKind::Alloc),
            warnings,
        })
    }

    fn begin(&mut self, request: &CaptureRequest, threads: &[ThreadHandle]) -> Result<()> {
        if self.started.is_some() {
            bail!("capture already running");
        }
        if !self.has_kind(request.kind) {
            bail!(
                "recording has no {} samples (has: {:?})",
                request.kind,
                self.kinds()
            );
        }
        debug!(threads = threads.len(), kind = %request.kind, "replay capture started");
        self.started = Some(Instant::now());
        Ok(())
    }

    fn add_thread(&mut self, thread: ThreadHandle) -> Result<()> {
        debug!(tid = thread.tid(), "replay ignores added thread");
        Ok(())
    }

    fn stop(&mut self) -> Result<Box<dyn Recording>> {
        let Some(started) = self.started.take() else {
            bail!("no capture running");
        };
        let mut recording = MemoryRecording::new(started.elapsed());
        for (id, frame) in &self.frames {
            recording.add_frame(*id, frame.clone());
        }
        for (kind, sample) in &self.samples {
            recording.add_sample(*kind, sample.clone());
        }
        Ok(Box::new(recording))
    }
}
