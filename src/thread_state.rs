//! Rolling per-thread activity history.
//!
//! Each tick lists the target's threads, classifies them as running or
//! blocked, and shifts one bit into each thread's history. A thread stays
//! "active" for as long as a running bit remains in its window, so a short
//! burst keeps it armed for the sample source well after it goes idle again.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// `/proc/<pid>/task/<tid>/stat`: the state follows the parenthesised comm,
/// which may itself contain spaces and parentheses.
static STAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+ \((?s:.*)\) (\S)").expect("valid stat regex"));

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ThreadHandle(pub u32);

impl ThreadHandle {
    pub fn tid(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Running,
    /// Blocked on a futex, the usual home of parked and waiting runtime threads.
    Parked,
    Sleeping,
    IoWait,
    /// Interruptible sleep in some other kernel function.
    Waiting,
    Unknown,
}

impl ExecState {
    /// Blocked in a known idle primitive. Everything else, including
    /// unrecognised waits and stopped tasks, counts as activity.
    pub fn is_idle(self) -> bool {
        matches!(
            self,
            ExecState::Parked | ExecState::Sleeping | ExecState::IoWait
        )
    }

    /// Classify a task from its `stat` state letter and its `wchan`.
    pub fn classify(state: char, wchan: &str) -> Self {
        match state {
            'R' => ExecState::Running,
            'D' => ExecState::IoWait,
            'S' | 'I' => {
                if wchan.starts_with("futex") {
                    ExecState::Parked
                } else if wchan.contains("nanosleep") {
                    ExecState::Sleeping
                } else if matches!(
                    wchan,
                    "ep_poll" | "do_epoll_wait" | "do_select" | "do_sys_poll" | "pipe_read"
                        | "sk_wait_data" | "wait_woken" | "unix_stream_read_generic"
                ) {
                    ExecState::IoWait
                } else {
                    ExecState::Waiting
                }
            }
            _ => ExecState::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub handle: ThreadHandle,
    pub name: String,
    pub state: ExecState,
}

/// Lists the threads of the profiled process.
pub trait ThreadLister: Send {
    fn list(&mut self) -> Result<Vec<ThreadSnapshot>>;
}

/// Lists threads from a `/proc/<pid>/task` directory.
pub struct ProcTaskLister {
    task_dir: PathBuf,
}

impl ProcTaskLister {
    pub fn for_pid(pid: u32) -> Self {
        Self::with_task_dir(format!("/proc/{pid}/task"))
    }

    pub fn current() -> Self {
        Self::with_task_dir("/proc/self/task")
    }

    pub fn with_task_dir(task_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_dir: task_dir.into(),
        }
    }

    fn read_task(dir: &Path, tid: u32) -> io::Result<Option<ThreadSnapshot>> {
        let stat = fs::read_to_string(dir.join("stat"))?;
        let Some(state) = STAT_RE
            .captures(&stat)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().chars().next())
        else {
            return Ok(None);
        };
        // wchan is hidden from unprivileged readers on some kernels.
        let wchan = fs::read_to_string(dir.join("wchan")).unwrap_or_default();
        let name = fs::read_to_string(dir.join("comm"))
            .map(|comm| comm.trim().to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        Ok(Some(ThreadSnapshot {
            handle: ThreadHandle(tid),
            name,
            state: ExecState::classify(state, wchan.trim()),
        }))
    }
}

impl ThreadLister for ProcTaskLister {
    fn list(&mut self) -> Result<Vec<ThreadSnapshot>> {
        let entries = fs::read_dir(&self.task_dir)
            .with_context(|| format!("failed to list {}", self.task_dir.display()))?;
        let mut threads = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(tid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            match Self::read_task(&entry.path(), tid) {
                Ok(Some(snapshot)) => threads.push(snapshot),
                Ok(None) => trace!(tid, "unparseable task stat"),
                // The thread exited between listing and reading.
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to read task {tid}"));
                }
            }
        }
        Ok(threads)
    }
}

struct ThreadRecord {
    name: String,
    history: u64,
}

pub struct ThreadActivityTracker {
    lister: Box<dyn ThreadLister>,
    mask: u64,
    threads: HashMap<ThreadHandle, ThreadRecord>,
}

impl ThreadActivityTracker {
    /// `history_bits` is clamped to 1..=64.
    pub fn new(lister: Box<dyn ThreadLister>, history_bits: u32) -> Self {
        let bits = history_bits.clamp(1, 64);
        let mask = if bits == 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        };
        Self {
            lister,
            mask,
            threads: HashMap::new(),
        }
    }

    /// Observe every thread once and age out threads that no longer exist.
    pub fn tick(&mut self) -> Result<()> {
        let snapshots = self.lister.list()?;
        let mut seen = HashSet::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let record = self
                .threads
                .entry(snapshot.handle)
                .or_insert_with(|| ThreadRecord {
                    name: String::new(),
                    history: 0,
                });
            record.name = snapshot.name;
            record.history =
                ((record.history << 1) | u64::from(!snapshot.state.is_idle())) & self.mask;
            seen.insert(snapshot.handle);
        }
        self.threads.retain(|handle, _| seen.contains(handle));
        Ok(())
    }

    /// True if `thread` was seen doing work in any tick still in its history.
    pub fn is_active(&self, thread: ThreadHandle) -> bool {
        self.threads
            .get(&thread)
            .is_some_and(|record| record.history != 0)
    }

    /// Every thread [`Self::is_active`] accepts, ordered by tid.
    pub fn active_threads(&self) -> Vec<ThreadHandle> {
        let mut active: Vec<ThreadHandle> = self
            .threads
            .iter()
            .filter(|(_, record)| record.history != 0)
            .map(|(handle, _)| *handle)
            .collect();
        active.sort();
        active
    }

    pub fn thread_name(&self, thread: ThreadHandle) -> Option<&str> {
        self.threads.get(&thread).map(|record| record.name.as_str())
    }

    pub fn tracked(&self) -> usize {
        self.threads.len()
    }

    pub fn clear(&mut self) {
        self.threads.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a fixed list of observations, one per `list` call.
    struct ScriptedLister {
        rounds: VecDeque<Vec<ThreadSnapshot>>,
    }

    impl ThreadLister for ScriptedLister {
        fn list(&mut self) -> Result<Vec<ThreadSnapshot>> {
            Ok(self.rounds.pop_front().unwrap_or_default())
        }
    }

    fn snap(tid: u32, state: ExecState) -> ThreadSnapshot {
        ThreadSnapshot {
            handle: ThreadHandle(tid),
            name: format!("thread-{tid}"),
            state,
        }
    }

    fn tracker(bits: u32, rounds: Vec<Vec<ThreadSnapshot>>) -> ThreadActivityTracker {
        let lister = ScriptedLister {
            rounds: rounds.into(),
        };
        ThreadActivityTracker::new(Box::new(lister), bits)
    }

    #[test]
    fn test_classify() {
        assert_eq!(ExecState::classify('R', ""), ExecState::Running);
        assert_eq!(ExecState::classify('S', "futex_wait_queue"), ExecState::Parked);
        assert_eq!(ExecState::classify('S', "hrtimer_nanosleep"), ExecState::Sleeping);
        assert_eq!(ExecState::classify('S', "ep_poll"), ExecState::IoWait);
        assert_eq!(ExecState::classify('D', "io_schedule"), ExecState::IoWait);
        assert_eq!(ExecState::classify('S', "do_wait"), ExecState::Waiting);
        assert_eq!(ExecState::classify('Z', ""), ExecState::Unknown);
    }

    #[test]
    fn test_idle_then_running_stays_active_until_aged_out() {
        let bits = 16;
        let mut rounds: Vec<Vec<ThreadSnapshot>> =
            (0..10).map(|_| vec![snap(7, ExecState::Parked)]).collect();
        rounds.push(vec![snap(7, ExecState::Running)]);
        for _ in 0..bits {
            rounds.push(vec![snap(7, ExecState::Sleeping)]);
        }
        let mut tracker = tracker(bits, rounds);
        let t = ThreadHandle(7);

        for _ in 0..10 {
            tracker.tick().unwrap();
            assert!(!tracker.is_active(t));
        }
        tracker.tick().unwrap();
        assert!(tracker.is_active(t));
        assert_eq!(tracker.active_threads(), vec![t]);

        // The running bit survives bits - 1 more idle ticks, then falls off.
        for _ in 0..bits - 1 {
            tracker.tick().unwrap();
            assert!(tracker.is_active(t));
        }
        tracker.tick().unwrap();
        assert!(!tracker.is_active(t));
        assert!(tracker.active_threads().is_empty());
    }

    #[test]
    fn test_unrecognised_waits_keep_thread_active() {
        let waiting = ExecState::classify('S', "do_wait");
        assert!(!waiting.is_idle());
        assert!(!ExecState::classify('T', "").is_idle());
        assert!(ExecState::classify('S', "futex_wait_queue").is_idle());

        let mut tracker = tracker(
            4,
            (0..8)
                .map(|_| vec![snap(3, waiting), snap(4, ExecState::IoWait)])
                .collect(),
        );
        for _ in 0..8 {
            tracker.tick().unwrap();
            assert!(tracker.is_active(ThreadHandle(3)));
            assert!(!tracker.is_active(ThreadHandle(4)));
        }
        assert_eq!(tracker.active_threads(), vec![ThreadHandle(3)]);
    }

    #[test]
    fn test_vanished_threads_are_pruned() {
        let mut tracker = tracker(
            64,
            vec![
                vec![snap(1, ExecState::Running), snap(2, ExecState::Running)],
                vec![snap(1, ExecState::Waiting)],
            ],
        );
        tracker.tick().unwrap();
        assert_eq!(tracker.tracked(), 2);
        assert_eq!(tracker.thread_name(ThreadHandle(2)), Some("thread-2"));
        tracker.tick().unwrap();
        assert_eq!(tracker.tracked(), 1);
        assert!(!tracker.is_active(ThreadHandle(2)));
        assert!(tracker.is_active(ThreadHandle(1)));
    }

    #[test]
    fn test_proc_task_lister_reads_task_dir() {
        let dir = tempfile::tempdir().unwrap();
        let write_task = |tid: u32, stat: &str, wchan: &str, comm: &str| {
            let task = dir.path().join(tid.to_string());
            fs::create_dir(&task).unwrap();
            fs::write(task.join("stat"), stat).unwrap();
            fs::write(task.join("wchan"), wchan).unwrap();
            fs::write(task.join("comm"), format!("{comm}\n")).unwrap();
        };
        write_task(100, "100 (main) R 1 100 100 0 -1", "0", "main");
        write_task(101, "101 (pool (1) worker) S 1 100 100 0 -1", "futex_wait_queue", "pool (1) worker");
        fs::create_dir(dir.path().join("not-a-tid")).unwrap();

        let mut lister = ProcTaskLister::with_task_dir(dir.path());
        let mut threads = lister.list().unwrap();
        threads.sort_by_key(|t| t.handle);
        assert_eq!(
            threads,
            vec![
                ThreadSnapshot {
                    handle: ThreadHandle(100),
                    name: "main".into(),
                    state: ExecState::Running
                },
                ThreadSnapshot {
                    handle: ThreadHandle(101),
                    name: "pool (1) worker".into(),
                    state: ExecState::Parked
                },
            ]
        );
    }

    #[test]
    fn test_proc_task_lister_sees_this_process() {
        let mut lister = ProcTaskLister::current();
        let threads = lister.list().unwrap();
        assert!(!threads.is_empty());
    }
}
