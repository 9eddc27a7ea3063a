use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sample::SampleKind;

/// Environment variable the binary reads the collector token from.
pub const TOKEN_ENV: &str = "KINDLING_TOKEN";

/// Window lengths: short windows first so data shows up quickly, longer ones after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowPolicy {
    /// Number of windows that use `warmup_window_ms`
    pub warmup_windows: u32,
    pub warmup_window_ms: u64,
    pub steady_window_ms: u64,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        WindowPolicy {
            warmup_windows: 5,
            warmup_window_ms: 5_000,
            steady_window_ms: 15_000,
        }
    }
}

impl WindowPolicy {
    /// Length of the next window once `flushed` windows have completed.
    pub fn window_after(&self, flushed: u32) -> Duration {
        if flushed < self.warmup_windows {
            Duration::from_millis(self.warmup_window_ms)
        } else {
            Duration::from_millis(self.steady_window_ms)
        }
    }
}

/// Collector address and credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoint {
    pub url: String,
    /// Usually supplied through the environment instead of the config file
    #[serde(skip_serializing)]
    pub token: String,
}

/// Runtime options for a profiling session, separated from CLI parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace)
    #[serde(skip)]
    pub verbosity: u8,
    /// What the sample source measures
    pub kind: SampleKind,
    /// Sampling interval in milliseconds
    pub interval_ms: u64,
    /// Also record an allocation profile when the source supports it
    pub profile_memory: bool,
    /// Controller tick in milliseconds
    pub tick_ms: u64,
    pub windows: WindowPolicy,
    /// How often buffered collector data is uploaded, in milliseconds
    pub timeline_interval_ms: u64,
    /// How often thread activity is sampled, in milliseconds
    pub thread_poll_ms: u64,
    /// Width of each thread's activity history (1..=64)
    pub thread_history_bits: u32,
    /// Thread activity samples taken before the first window
    pub thread_priming_rounds: u32,
    /// Configuration files shipped with the session, by file name
    pub files: BTreeMap<String, String>,
    /// Software versions reported with the session
    pub versions: BTreeMap<String, String>,
    /// Graph categories shown by default in the viewer
    pub default_categories: Vec<String>,
    pub endpoint: Endpoint,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            kind: SampleKind::Itimer,
            interval_ms: 5,
            profile_memory: false,
            tick_ms: 50,
            windows: WindowPolicy::default(),
            timeline_interval_ms: 5_000,
            thread_poll_ms: 1_000,
            thread_history_bits: 64,
            thread_priming_rounds: 10,
            files: BTreeMap::new(),
            versions: BTreeMap::new(),
            default_categories: vec!["System".to_string()],
            endpoint: Endpoint::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn timeline_interval(&self) -> Duration {
        Duration::from_millis(self.timeline_interval_ms)
    }

    pub fn thread_poll(&self) -> Duration {
        Duration::from_millis(self.thread_poll_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.kind, SampleKind::Itimer);
        assert_eq!(config.interval(), Duration::from_millis(5));
        assert_eq!(config.tick(), Duration::from_millis(50));
        assert_eq!(config.thread_history_bits, 64);
        assert_eq!(config.thread_priming_rounds, 10);
    }

    #[test]
    fn test_window_policy_switches_after_warmup() {
        let policy = WindowPolicy::default();
        for flushed in 0..5 {
            assert_eq!(policy.window_after(flushed), Duration::from_secs(5));
        }
        assert_eq!(policy.window_after(5), Duration::from_secs(15));
        assert_eq!(policy.window_after(500), Duration::from_secs(15));
    }

    #[test]
    fn test_from_file_fills_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "kind": "wall",
                "profile_memory": true,
                "windows": {{ "steady_window_ms": 30000 }},
                "files": {{ "server.properties": "max-players=20" }},
                "endpoint": {{ "url": "https://collector.example", "token": "abc" }}
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.kind, SampleKind::Wall);
        assert!(config.profile_memory);
        assert_eq!(config.windows.warmup_windows, 5);
        assert_eq!(config.windows.steady_window_ms, 30_000);
        assert_eq!(config.tick_ms, 50);
        assert_eq!(config.files["server.properties"], "max-players=20");
        assert_eq!(config.endpoint.url, "https://collector.example");
        assert_eq!(config.endpoint.token, "abc");
    }

    #[test]
    fn test_from_file_reports_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse config"));
    }
}
