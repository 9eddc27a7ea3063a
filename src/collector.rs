//! Live metric and event collectors.
//!
//! Collectors feed the session timeline. Live collectors are polled on their
//! own period and buffer numeric series; event collectors buffer discrete
//! timestamped events pushed by the host. Both are drained once per timeline
//! upload. Producers may run on any thread, so buffers only hold their lock
//! long enough to append or swap.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, ensure, Result};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::warn;

/// How the viewer should render a series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataFormatter(String);

impl DataFormatter {
    pub fn percent() -> Self {
        Self("builtin:percent".to_string())
    }

    pub fn bytes() -> Self {
        Self("builtin:bytes".to_string())
    }

    pub fn milliseconds() -> Self {
        Self("builtin:ms".to_string())
    }

    pub fn suffix(singular: &str, plural: &str) -> Result<Self> {
        ensure!(
            !singular.contains(':') && !plural.contains(':'),
            "suffix formatter may not contain ':' ({singular:?}, {plural:?})"
        );
        Ok(Self(format!("builtin:suffix:{singular}:{plural}")))
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphCategory(pub String);

impl GraphCategory {
    pub fn system() -> Self {
        Self("System".to_string())
    }
}

/// One series or event type a collector can report.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectorData {
    pub id: String,
    pub name: String,
    pub description: String,
    pub formatter: Option<DataFormatter>,
    pub category: Option<GraphCategory>,
}

impl CollectorData {
    pub fn new(id: &str, name: &str, description: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            formatter: None,
            category: None,
        }
    }

    pub fn with_formatter(mut self, formatter: DataFormatter) -> Self {
        self.formatter = Some(formatter);
        self
    }

    pub fn with_category(mut self, category: GraphCategory) -> Self {
        self.category = Some(category);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEvent {
    pub data_id: String,
    /// Wall-clock start, in ms since the epoch.
    pub time_ms: u64,
    pub duration_ms: u64,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveSeries {
    pub data_id: String,
    pub values: Vec<f64>,
}

/// Everything a collector buffered since it was last drained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedData {
    pub events: Vec<LiveEvent>,
    pub live: Vec<LiveSeries>,
}

impl CollectedData {
    pub fn extend(&mut self, other: CollectedData) {
        self.events.extend(other.events);
        self.live.extend(other.live);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.live.iter().all(|series| series.values.is_empty())
    }
}

pub trait Collector: Send + Sync {
    fn name(&self) -> &str;

    fn data_types(&self) -> Vec<CollectorData>;

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Period for [`Collector::poll`]. `None` for push-only collectors.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    fn poll(&self) -> Result<()> {
        Ok(())
    }

    /// Take everything buffered so far, leaving the buffers empty.
    fn drain(&self) -> CollectedData;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-series value buffers, kept in registration order.
pub struct SeriesBuffer {
    series: Mutex<Vec<LiveSeries>>,
}

impl SeriesBuffer {
    pub fn new(data: &[CollectorData]) -> Self {
        Self {
            series: Mutex::new(
                data.iter()
                    .map(|d| LiveSeries {
                        data_id: d.id.clone(),
                        values: Vec::new(),
                    })
                    .collect(),
            ),
        }
    }

    pub fn report(&self, data_id: &str, value: f64) -> Result<()> {
        let mut series = lock(&self.series);
        match series.iter_mut().find(|s| s.data_id == data_id) {
            Some(s) => {
                s.values.push(value);
                Ok(())
            }
            None => bail!("unknown series {data_id}"),
        }
    }

    pub fn drain(&self) -> Vec<LiveSeries> {
        lock(&self.series)
            .iter_mut()
            .map(|s| LiveSeries {
                data_id: s.data_id.clone(),
                values: mem::take(&mut s.values),
            })
            .collect()
    }
}

#[derive(Default)]
pub struct EventBuffer {
    events: Mutex<Vec<LiveEvent>>,
}

impl EventBuffer {
    pub fn push(&self, event: LiveEvent) {
        lock(&self.events).push(event);
    }

    pub fn drain(&self) -> Vec<LiveEvent> {
        mem::take(&mut *lock(&self.events))
    }
}

/// Host-driven events such as pauses or restarts.
///
/// Keep an `Arc` to it and call [`EventCollector::report`] from anywhere.
pub struct EventCollector {
    name: String,
    data: Vec<CollectorData>,
    events: EventBuffer,
}

impl EventCollector {
    pub fn new(name: &str, data: Vec<CollectorData>) -> Self {
        Self {
            name: name.to_string(),
            data,
            events: EventBuffer::default(),
        }
    }

    pub fn report(&self, event: LiveEvent) -> Result<()> {
        ensure!(
            self.data.iter().any(|d| d.id == event.data_id),
            "collector {} does not report {}",
            self.name,
            event.data_id
        );
        self.events.push(event);
        Ok(())
    }
}

impl Collector for EventCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn data_types(&self) -> Vec<CollectorData> {
        self.data.clone()
    }

    fn drain(&self) -> CollectedData {
        CollectedData {
            events: self.events.drain(),
            live: Vec::new(),
        }
    }
}

pub const STAT_CPU: &str = "builtin:stat:cpu";
pub const STAT_CPU_PROCESS: &str = "builtin:stat:cpu_process";
pub const STAT_MEMORY_USED: &str = "builtin:stat:memory_used";
pub const STAT_MEMORY_TOTAL: &str = "builtin:stat:memory_total";

/// System and process CPU load plus memory usage, via `sysinfo`.
pub struct StatCollector {
    data: Vec<CollectorData>,
    series: SeriesBuffer,
    system: Mutex<System>,
    pid: Option<Pid>,
    interval: Duration,
}

impl StatCollector {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self::with_interval(Self::DEFAULT_INTERVAL)
    }

    pub fn with_interval(interval: Duration) -> Self {
        let data = vec![
            CollectorData::new(
                STAT_CPU,
                "CPU Load",
                "The total amount of CPU usage across all cores.",
            )
            .with_formatter(DataFormatter::percent())
            .with_category(GraphCategory::system()),
            CollectorData::new(
                STAT_CPU_PROCESS,
                "Process CPU",
                "The amount of CPU being used by this process.",
            )
            .with_formatter(DataFormatter::percent())
            .with_category(GraphCategory::system()),
            CollectorData::new(
                STAT_MEMORY_USED,
                "Memory",
                "The amount of memory being used currently.",
            )
            .with_formatter(DataFormatter::bytes())
            .with_category(GraphCategory::system()),
            CollectorData::new(
                STAT_MEMORY_TOTAL,
                "Memory Total",
                "The total amount of memory available.",
            )
            .with_formatter(DataFormatter::bytes())
            .with_category(GraphCategory::system()),
        ];
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!(error = err, "process CPU load will not be reported");
                None
            }
        };
        Self {
            series: SeriesBuffer::new(&data),
            data,
            system: Mutex::new(System::new()),
            pid,
            interval,
        }
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for StatCollector {
    fn name(&self) -> &str {
        "stat"
    }

    fn data_types(&self) -> Vec<CollectorData> {
        self.data.clone()
    }

    fn start(&self) -> Result<()> {
        // CPU usage is a delta between refreshes, so take the baseline now.
        let mut system = lock(&self.system);
        system.refresh_cpu_usage();
        if let Some(pid) = self.pid {
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_cpu(),
            );
        }
        Ok(())
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    fn poll(&self) -> Result<()> {
        let mut system = lock(&self.system);
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpus = system.cpus().len().max(1) as f64;
        self.series
            .report(STAT_CPU, f64::from(system.global_cpu_usage()) / 100.0)?;
        if let Some(pid) = self.pid {
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::nothing().with_cpu(),
            );
            if let Some(process) = system.process(pid) {
                self.series.report(
                    STAT_CPU_PROCESS,
                    f64::from(process.cpu_usage()) / (100.0 * cpus),
                )?;
            }
        }
        self.series
            .report(STAT_MEMORY_USED, system.used_memory() as f64)?;
        self.series
            .report(STAT_MEMORY_TOTAL, system.total_memory() as f64)?;
        Ok(())
    }

    fn drain(&self) -> CollectedData {
        CollectedData {
            events: Vec::new(),
            live: self.series.drain(),
        }
    }
}

/// Start every collector, logging the ones that fail.
pub fn start_all(collectors: &[Arc<dyn Collector>]) {
    for collector in collectors {
        if let Err(err) = collector.start() {
            warn!(collector = collector.name(), error = ?err, "collector failed to start");
        }
    }
}

/// Stop every collector, logging the ones that fail.
pub fn stop_all(collectors: &[Arc<dyn Collector>]) {
    for collector in collectors {
        if let Err(err) = collector.stop() {
            warn!(collector = collector.name(), error = ?err, "collector failed to stop");
        }
    }
}

pub fn drain_all(collectors: &[Arc<dyn Collector>]) -> CollectedData {
    let mut data = CollectedData::default();
    for collector in collectors {
        data.extend(collector.drain());
    }
    data
}

/// A graph category and the series that belong to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryGroup {
    pub name: String,
    pub types: Vec<String>,
    pub default: bool,
}

/// Every data type the collectors report, in collector order.
pub fn timeline_descriptors(collectors: &[Arc<dyn Collector>]) -> Vec<CollectorData> {
    collectors.iter().flat_map(|c| c.data_types()).collect()
}

/// Group data types by graph category, flagging the categories shown by default.
pub fn graph_categories(
    collectors: &[Arc<dyn Collector>],
    default_categories: &[String],
) -> Vec<CategoryGroup> {
    let mut groups: BTreeMap<GraphCategory, BTreeSet<String>> = BTreeMap::new();
    for data in timeline_descriptors(collectors) {
        if let Some(category) = data.category {
            groups.entry(category).or_default().insert(data.id);
        }
    }
    groups
        .into_iter()
        .map(|(category, types)| CategoryGroup {
            default: default_categories.contains(&category.0),
            name: category.0,
            types: types.into_iter().collect(),
        })
        .collect()
}
