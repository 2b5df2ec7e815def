//! Observers (process, file, network, system) and the typed events they emit.
//! Each observer owns its dedup state and pushes onto its own bounded queue.

mod file;
mod hash;
mod network;
mod process;
mod queue;
mod system;

use crate::error::StoreError;
use crate::storage::EventRepository;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use file::{file_severity, should_skip_path, ChangeKind, FileObserver};
pub use hash::hash_file;
pub use network::{
    connection_fingerprint, network_severity, ConnState, Connection, ConnectionSource,
    NetworkObserver, ProcNetSource,
};
pub(crate) use network::UnsupportedConnections;
pub use process::{
    process_severity, ProcessDetails, ProcessObserver, ProcessSource, ProcessSummary,
    SysinfoProcessSource,
};
pub use queue::{event_queue, DropCounter, EventReceiver, EventSender};
pub use system::SystemCollector;

/// Derived classification; computed once at creation and never changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessEventType {
    Start,
    Stop,
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventType {
    Create,
    Modify,
    Delete,
    Access,
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkEventType {
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Unknown => "UNKNOWN",
        }
    }
}

macro_rules! event_type_str {
    ($ty:ty { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }
    };
}

event_type_str!(ProcessEventType { Start => "start", Stop => "stop", Monitor => "monitor" });
event_type_str!(FileEventType {
    Create => "create",
    Modify => "modify",
    Delete => "delete",
    Access => "access",
    Monitor => "monitor",
});
event_type_str!(NetworkEventType { Connect => "connect", Disconnect => "disconnect" });

pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// Lowercase, forward-slash form used for directory pattern matching
pub(crate) fn normalize_path(p: &str) -> String {
    p.replace('\\', "/").to_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEvent {
    pub id: String,
    pub agent_id: String,
    pub process_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_process_id: Option<u32>,
    pub process_name: String,
    pub command_line: String,
    pub executable_path: String,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub cpu_usage: f64,
    pub memory_usage: u64,
    pub event_type: ProcessEventType,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProcessEvent {
    /// Fully enriched event (`start` or `monitor`)
    pub fn observed(
        agent_id: &str,
        details: &ProcessDetails,
        event_type: ProcessEventType,
        hash: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let severity = process_severity(
            &details.name,
            &details.exe,
            details.cpu_usage,
            details.memory_bytes,
        );
        Self {
            id: new_event_id(),
            agent_id: agent_id.to_string(),
            process_id: details.pid,
            parent_process_id: details.ppid,
            process_name: details.name.clone(),
            command_line: details.cmdline.clone(),
            executable_path: details.exe.clone(),
            username: details.username.clone(),
            start_time: details.start_time,
            end_time: None,
            cpu_usage: details.cpu_usage,
            memory_usage: details.memory_bytes,
            event_type,
            timestamp: now,
            severity,
            hash,
            created_at: now,
        }
    }

    /// Termination event: only identity and timestamps are known
    pub fn stopped(
        agent_id: &str,
        pid: u32,
        name: String,
        start_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let end_time = match start_time {
            Some(start) if start > now => start,
            _ => now,
        };
        Self {
            id: new_event_id(),
            agent_id: agent_id.to_string(),
            process_id: pid,
            parent_process_id: None,
            process_name: name,
            command_line: String::new(),
            executable_path: String::new(),
            username: String::new(),
            start_time,
            end_time: Some(end_time),
            cpu_usage: 0.0,
            memory_usage: 0,
            event_type: ProcessEventType::Stop,
            timestamp: now,
            severity: Severity::Low,
            hash: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEvent {
    pub id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    pub file_path: String,
    pub file_name: String,
    pub file_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    pub event_type: FileEventType,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    pub local_ip: String,
    pub local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    pub protocol: Protocol,
    pub event_type: NetworkEventType,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_sent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<u64>,
    pub connection_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub id: String,
    pub agent_id: String,
    pub hostname: String,
    pub os_version: String,
    pub architecture: String,
    pub total_memory: u64,
    pub available_memory: u64,
    pub cpu_count: usize,
    pub cpu_usage: f64,
    pub disk_usage: f64,
    pub uptime: u64,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time resource usage, stored as a generic telemetry row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub id: String,
    pub agent_id: String,
    pub event_type: String,
    pub cpu_usage: f64,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_available: u64,
    pub memory_usage_percent: f64,
    pub process_count: usize,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    New,
    Investigating,
    Resolved,
    FalsePositive,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::New => "new",
            AlertStatus::Investigating => "investigating",
            AlertStatus::Resolved => "resolved",
            AlertStatus::FalsePositive => "false_positive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorType {
    FileHash,
    ProcessHash,
    IpAddress,
}

impl IndicatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorType::FileHash => "file_hash",
            IndicatorType::ProcessHash => "process_hash",
            IndicatorType::IpAddress => "ip_address",
        }
    }
}

/// Indicator match produced by the scanner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub event_id: String,
    pub indicator: String,
    pub indicator_type: IndicatorType,
    pub threat_info: String,
    pub severity: String,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
}

/// Anything that flows through a consumer loop: persisted once, then published
pub trait TelemetryRecord: Serialize + Send + Sync + 'static {
    /// Routing category (`process`, `file`, ...)
    const CATEGORY: &'static str;

    fn id(&self) -> &str;
    fn agent_id(&self) -> &str;
    fn timestamp(&self) -> DateTime<Utc>;
    fn persist(&self, repo: &dyn EventRepository) -> Result<(), StoreError>;
}

impl TelemetryRecord for ProcessEvent {
    const CATEGORY: &'static str = "process";

    fn id(&self) -> &str {
        &self.id
    }
    fn agent_id(&self) -> &str {
        &self.agent_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    fn persist(&self, repo: &dyn EventRepository) -> Result<(), StoreError> {
        repo.save_process_event(self)
    }
}

impl TelemetryRecord for FileEvent {
    const CATEGORY: &'static str = "file";

    fn id(&self) -> &str {
        &self.id
    }
    fn agent_id(&self) -> &str {
        &self.agent_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    fn persist(&self, repo: &dyn EventRepository) -> Result<(), StoreError> {
        repo.save_file_event(self)
    }
}

impl TelemetryRecord for NetworkEvent {
    const CATEGORY: &'static str = "network";

    fn id(&self) -> &str {
        &self.id
    }
    fn agent_id(&self) -> &str {
        &self.agent_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    fn persist(&self, repo: &dyn EventRepository) -> Result<(), StoreError> {
        repo.save_network_event(self)
    }
}

impl TelemetryRecord for SystemInfo {
    const CATEGORY: &'static str = "system";

    fn id(&self) -> &str {
        &self.id
    }
    fn agent_id(&self) -> &str {
        &self.agent_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    fn persist(&self, repo: &dyn EventRepository) -> Result<(), StoreError> {
        repo.save_system_info(self)
    }
}

impl TelemetryRecord for PerformanceSample {
    const CATEGORY: &'static str = "performance";

    fn id(&self) -> &str {
        &self.id
    }
    fn agent_id(&self) -> &str {
        &self.agent_id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    fn persist(&self, repo: &dyn EventRepository) -> Result<(), StoreError> {
        repo.save_performance_sample(self)
    }
}
