//! Process lifecycle observer: polls the process table and diffs it against the
//! known set to synthesize `start` / `stop` events.

use super::{hash_file, normalize_path, EventSender, ProcessEvent, ProcessEventType, Severity};
use crate::error::CollectError;
use crate::shutdown::Shutdown;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use sysinfo::{Pid, System, Users};
use tracing::{debug, error, info, warn};

/// Command interpreters, script hosts and LOLBins
const DUAL_USE_TOOLS: &[&str] = &[
    "cmd.exe",
    "powershell.exe",
    "pwsh.exe",
    "wscript.exe",
    "cscript.exe",
    "rundll32.exe",
    "regsvr32.exe",
    "mshta.exe",
    "msbuild.exe",
    "csc.exe",
    "vbc.exe",
    "sh",
    "bash",
    "dash",
    "zsh",
    "ksh",
    "fish",
    "python",
    "python3",
    "perl",
    "ruby",
    "php",
    "node",
    "osascript",
    "nc",
    "ncat",
    "socat",
];

const SUSPICIOUS_EXE_DIRS: &[&str] = &["/temp/", "/tmp/", "/downloads/", "/desktop/"];

const HIGH_CPU_PERCENT: f64 = 80.0;
const HIGH_RSS_BYTES: u64 = 1024 * 1024 * 1024;

/// Identity of a running process as seen by a table snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSummary {
    pub pid: u32,
    pub name: String,
    pub start_time: Option<DateTime<Utc>>,
}

/// Full per-process detail used to enrich `start` / `monitor` events
#[derive(Debug, Clone, Default)]
pub struct ProcessDetails {
    pub pid: u32,
    pub ppid: Option<u32>,
    pub name: String,
    pub cmdline: String,
    pub exe: String,
    pub username: String,
    pub cpu_usage: f64,
    pub memory_bytes: u64,
    pub start_time: Option<DateTime<Utc>>,
}

/// OS process table access
pub trait ProcessSource: Send {
    /// Enumerate every running process
    fn snapshot(&mut self) -> Result<Vec<ProcessSummary>, CollectError>;
    /// Detail lookup; None if the process vanished since the snapshot
    fn details(&mut self, pid: u32) -> Option<ProcessDetails>;
}

/// Cross-platform process table via sysinfo
pub struct SysinfoProcessSource {
    sys: System,
    users: Users,
}

impl Default for SysinfoProcessSource {
    fn default() -> Self {
        Self {
            sys: System::new(),
            users: Users::new_with_refreshed_list(),
        }
    }
}

fn unix_secs(secs: u64) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    Utc.timestamp_opt(secs as i64, 0).single()
}

impl ProcessSource for SysinfoProcessSource {
    fn snapshot(&mut self) -> Result<Vec<ProcessSummary>, CollectError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(CollectError::Unsupported("process enumeration"));
        }
        self.sys.refresh_processes();
        let procs = self.sys.processes();
        if procs.is_empty() {
            return Err(CollectError::Enumeration("empty process table".into()));
        }
        Ok(procs
            .iter()
            .map(|(pid, p)| ProcessSummary {
                pid: pid.as_u32(),
                name: p.name().to_string(),
                start_time: unix_secs(p.start_time()),
            })
            .collect())
    }

    fn details(&mut self, pid: u32) -> Option<ProcessDetails> {
        let spid = Pid::from_u32(pid);
        if !self.sys.refresh_process(spid) {
            return None;
        }
        let p = self.sys.process(spid)?;
        let username = p
            .user_id()
            .and_then(|uid| {
                if self.users.get_user_by_id(uid).is_none() {
                    self.users.refresh_list();
                }
                self.users.get_user_by_id(uid).map(|u| u.name().to_string())
            })
            .unwrap_or_default();
        Some(ProcessDetails {
            pid,
            ppid: p.parent().map(|pp| pp.as_u32()),
            name: p.name().to_string(),
            cmdline: p.cmd().join(" "),
            exe: p
                .exe()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default(),
            username,
            cpu_usage: p.cpu_usage() as f64,
            memory_bytes: p.memory(),
            start_time: unix_secs(p.start_time()),
        })
    }
}

/// Severity of a started process. Pure: depends only on its arguments.
pub fn process_severity(name: &str, exe: &str, cpu_usage: f64, memory_bytes: u64) -> Severity {
    if DUAL_USE_TOOLS.iter().any(|t| t.eq_ignore_ascii_case(name)) {
        return Severity::Medium;
    }
    let exe = normalize_path(exe);
    if SUSPICIOUS_EXE_DIRS.iter().any(|d| exe.contains(d)) {
        return Severity::Medium;
    }
    if cpu_usage > HIGH_CPU_PERCENT || memory_bytes > HIGH_RSS_BYTES {
        return Severity::Medium;
    }
    Severity::Low
}

#[derive(Debug, Clone)]
struct KnownProcess {
    name: String,
    start_time: Option<DateTime<Utc>>,
}

/// Counts from one diff cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessDelta {
    pub started: usize,
    pub stopped: usize,
}

pub struct ProcessObserver {
    agent_id: String,
    source: Mutex<Box<dyn ProcessSource>>,
    /// Known pid set; the poll loop is the only writer
    known: RwLock<HashMap<u32, KnownProcess>>,
    hash_limit: u64,
    tx: EventSender<ProcessEvent>,
}

impl ProcessObserver {
    pub fn new(
        agent_id: impl Into<String>,
        source: Box<dyn ProcessSource>,
        hash_limit: u64,
        tx: EventSender<ProcessEvent>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            source: Mutex::new(source),
            known: RwLock::new(HashMap::new()),
            hash_limit,
            tx,
        }
    }

    /// Record every running process as known without emitting events
    pub fn seed(&self) -> Result<usize, CollectError> {
        let current = self.lock_source().snapshot()?;
        let mut known = self.known.write().unwrap_or_else(|p| p.into_inner());
        known.clear();
        for p in current {
            known.insert(
                p.pid,
                KnownProcess {
                    name: p.name,
                    start_time: p.start_time,
                },
            );
        }
        Ok(known.len())
    }

    /// One diff cycle: new pids emit `start`, vanished pids emit `stop`.
    /// Enumeration failure skips the cycle.
    pub fn poll(&self, now: DateTime<Utc>) -> ProcessDelta {
        let mut source = self.lock_source();
        let current = match source.snapshot() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "process enumeration failed, skipping cycle");
                return ProcessDelta::default();
            }
        };
        let current_pids: HashSet<u32> = current.iter().map(|p| p.pid).collect();

        let mut started = Vec::new();
        let mut stopped = Vec::new();
        {
            let mut known = self.known.write().unwrap_or_else(|p| p.into_inner());
            for p in &current {
                if !known.contains_key(&p.pid) {
                    known.insert(
                        p.pid,
                        KnownProcess {
                            name: p.name.clone(),
                            start_time: p.start_time,
                        },
                    );
                    started.push(p.pid);
                }
            }
            let gone: Vec<u32> = known
                .keys()
                .filter(|pid| !current_pids.contains(pid))
                .copied()
                .collect();
            for pid in gone {
                if let Some(k) = known.remove(&pid) {
                    stopped.push((pid, k));
                }
            }
        }

        let mut delta = ProcessDelta::default();
        for pid in started {
            let Some(details) = source.details(pid) else {
                warn!(pid, "process vanished before detail lookup, skipping");
                continue;
            };
            let hash = if details.exe.is_empty() {
                None
            } else {
                hash_file(Path::new(&details.exe), self.hash_limit)
            };
            let ev = ProcessEvent::observed(&self.agent_id, &details, ProcessEventType::Start, hash, now);
            debug!(pid, name = %ev.process_name, severity = ev.severity.as_str(), "process start");
            self.tx.push(ev);
            delta.started += 1;
        }
        drop(source);

        for (pid, k) in stopped {
            let ev = ProcessEvent::stopped(&self.agent_id, pid, k.name, k.start_time, now);
            debug!(pid, name = %ev.process_name, "process stop");
            self.tx.push(ev);
            delta.stopped += 1;
        }
        delta
    }

    /// Fully enriched `monitor` event for every running process; does not touch the known set
    pub fn snapshot_all(&self, now: DateTime<Utc>) -> Result<Vec<ProcessEvent>, CollectError> {
        let mut source = self.lock_source();
        let current = source.snapshot()?;
        let mut events = Vec::with_capacity(current.len());
        for p in current {
            let Some(details) = source.details(p.pid) else {
                debug!(pid = p.pid, "process vanished before detail lookup");
                continue;
            };
            let hash = if details.exe.is_empty() {
                None
            } else {
                hash_file(Path::new(&details.exe), self.hash_limit)
            };
            events.push(ProcessEvent::observed(
                &self.agent_id,
                &details,
                ProcessEventType::Monitor,
                hash,
                now,
            ));
        }
        Ok(events)
    }

    pub fn known_count(&self) -> usize {
        self.known.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_known(&self, pid: u32) -> bool {
        self.known
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&pid)
    }

    pub fn dropped(&self) -> u64 {
        self.tx.dropped()
    }

    /// Seed, then poll every `every` until shutdown. A failed seed ends the task.
    /// Table reads and executable hashing run on the blocking pool.
    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown: Shutdown) {
        let observer = Arc::clone(&self);
        match tokio::task::spawn_blocking(move || observer.seed()).await {
            Ok(Ok(n)) => info!(known = n, "process monitoring started"),
            Ok(Err(e)) => {
                error!(error = %e, "initial process snapshot failed, process monitoring disabled");
                return;
            }
            Err(e) => {
                error!(error = %e, "initial process snapshot task failed, process monitoring disabled");
                return;
            }
        }
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            let observer = Arc::clone(&self);
            let cycle = tokio::task::spawn_blocking(move || observer.poll(Utc::now()));
            tokio::select! {
                _ = shutdown.wait() => break,
                res = cycle => match res {
                    Ok(delta) if delta.started + delta.stopped > 0 => {
                        debug!(started = delta.started, stopped = delta.stopped, "process changes");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "process poll task failed"),
                },
            }
        }
        info!("process monitoring stopped");
    }

    fn lock_source(&self) -> std::sync::MutexGuard<'_, Box<dyn ProcessSource>> {
        self.source.lock().unwrap_or_else(|p| p.into_inner())
    }
}
