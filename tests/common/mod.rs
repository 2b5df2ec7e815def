//! Scripted OS sources and recording collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use endpoint_agent::collectors::{
    ConnState, Connection, ConnectionSource, FileEvent, NetworkEvent, PerformanceSample,
    ProcessDetails, ProcessEvent, ProcessSource, ProcessSummary, Protocol, SystemInfo,
};
use endpoint_agent::error::{CollectError, PublishError, StoreError};
use endpoint_agent::orchestrator::SourceFactory;
use endpoint_agent::publish::{Envelope, Publisher};
use endpoint_agent::storage::EventRepository;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn proc(pid: u32, name: &str) -> ProcessSummary {
    ProcessSummary {
        pid,
        name: name.to_string(),
        start_time: None,
    }
}

/// Process table the test mutates between polls
#[derive(Clone, Default)]
pub struct ProcessTable {
    pub rows: Arc<Mutex<Vec<ProcessSummary>>>,
    /// Pids whose detail lookup fails as if they exited mid-poll
    pub vanished: Arc<Mutex<HashSet<u32>>>,
    pub failing: Arc<AtomicBool>,
}

impl ProcessTable {
    pub fn with(rows: Vec<ProcessSummary>) -> Self {
        let table = Self::default();
        *table.rows.lock().unwrap() = rows;
        table
    }

    pub fn add(&self, p: ProcessSummary) {
        self.rows.lock().unwrap().push(p);
    }

    pub fn remove(&self, pid: u32) {
        self.rows.lock().unwrap().retain(|p| p.pid != pid);
    }

    pub fn source(&self) -> Box<dyn ProcessSource> {
        Box::new(self.clone())
    }
}

impl ProcessSource for ProcessTable {
    fn snapshot(&mut self) -> Result<Vec<ProcessSummary>, CollectError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollectError::Enumeration("scripted failure".into()));
        }
        Ok(self.rows.lock().unwrap().clone())
    }

    fn details(&mut self, pid: u32) -> Option<ProcessDetails> {
        if self.vanished.lock().unwrap().contains(&pid) {
            return None;
        }
        let rows = self.rows.lock().unwrap();
        let p = rows.iter().find(|p| p.pid == pid)?;
        Some(ProcessDetails {
            pid,
            ppid: Some(1),
            name: p.name.clone(),
            cmdline: format!("{} --flag", p.name),
            exe: format!("/usr/bin/{}", p.name),
            username: "tester".to_string(),
            cpu_usage: 1.0,
            memory_bytes: 4096,
            start_time: p.start_time,
        })
    }
}

pub fn tcp(local_port: u16, remote: &str, remote_port: u16, pid: u32) -> Connection {
    Connection {
        local_ip: "10.0.0.5".to_string(),
        local_port,
        remote_ip: Some(remote.to_string()),
        remote_port: Some(remote_port),
        protocol: Protocol::Tcp,
        pid,
        state: ConnState::Established,
        bytes_sent: None,
        bytes_received: None,
    }
}

/// Connection table the test mutates between polls
#[derive(Clone, Default)]
pub struct ConnectionTable {
    pub rows: Arc<Mutex<Vec<Connection>>>,
    pub failing: Arc<AtomicBool>,
}

impl ConnectionTable {
    pub fn with(rows: Vec<Connection>) -> Self {
        let table = Self::default();
        *table.rows.lock().unwrap() = rows;
        table
    }

    pub fn set(&self, rows: Vec<Connection>) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn source(&self) -> Box<dyn ConnectionSource> {
        Box::new(self.clone())
    }
}

impl ConnectionSource for ConnectionTable {
    fn connections(&mut self) -> Result<Vec<Connection>, CollectError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollectError::Enumeration("scripted failure".into()));
        }
        Ok(self.rows.lock().unwrap().clone())
    }

    fn process_name(&mut self, pid: u32) -> Option<String> {
        Some(format!("proc-{}", pid))
    }
}

#[derive(Clone, Default)]
pub struct ScriptedSources {
    pub processes: ProcessTable,
    pub connections: ConnectionTable,
}

impl SourceFactory for ScriptedSources {
    fn process_source(&self) -> Box<dyn ProcessSource> {
        self.processes.source()
    }

    fn connection_source(&self) -> Box<dyn ConnectionSource> {
        self.connections.source()
    }
}

/// In-memory store recording saved ids per category, in order
#[derive(Default)]
pub struct RecordingStore {
    pub saved: Mutex<Vec<(String, String)>>,
    pub failing: AtomicBool,
    pub closed: AtomicBool,
}

impl RecordingStore {
    fn record(&self, category: &str, id: &str) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Crypto);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.saved
            .lock()
            .unwrap()
            .push((category.to_string(), id.to_string()));
        Ok(())
    }

    pub fn ids(&self, category: &str) -> Vec<String> {
        self.saved
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == category)
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.saved.lock().unwrap().len()
    }
}

impl EventRepository for RecordingStore {
    fn save_process_event(&self, event: &ProcessEvent) -> Result<(), StoreError> {
        self.record("process", &event.id)
    }

    fn save_file_event(&self, event: &FileEvent) -> Result<(), StoreError> {
        self.record("file", &event.id)
    }

    fn save_network_event(&self, event: &NetworkEvent) -> Result<(), StoreError> {
        self.record("network", &event.id)
    }

    fn save_system_info(&self, info: &SystemInfo) -> Result<(), StoreError> {
        self.record("system", &info.id)
    }

    fn save_performance_sample(&self, sample: &PerformanceSample) -> Result<(), StoreError> {
        self.record("performance", &sample.id)
    }

    fn latest_system_info(&self, _agent_id: &str) -> Result<Option<SystemInfo>, StoreError> {
        Ok(None)
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Publisher recording (topic, envelope) pairs; can be told to hang or fail
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(String, Envelope)>>,
    pub hang: AtomicBool,
    pub failing: AtomicBool,
    pub closed: AtomicBool,
}

impl RecordingPublisher {
    pub fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), PublishError> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), envelope.clone()));
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Poll `cond` every 10ms until it holds or `within` elapses
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
