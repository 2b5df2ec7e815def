//! Local event store: per-category tables with encrypted payloads, plus the
//! indicator and alert tables used by the scanner.

mod encrypted;
mod schema;

use crate::collectors::{FileEvent, IndicatorType, NetworkEvent, PerformanceSample, ProcessEvent, SystemInfo};
use crate::error::StoreError;
use std::str::FromStr;

pub use encrypted::{HashIndicator, IpIndicator, ScanCandidate, SecureStore};

/// Save contract consumed by the pipeline. Implementations must be callable from blocking worker threads.
pub trait EventRepository: Send + Sync {
    fn save_process_event(&self, event: &ProcessEvent) -> Result<(), StoreError>;
    fn save_file_event(&self, event: &FileEvent) -> Result<(), StoreError>;
    fn save_network_event(&self, event: &NetworkEvent) -> Result<(), StoreError>;
    fn save_system_info(&self, info: &SystemInfo) -> Result<(), StoreError>;
    fn save_performance_sample(&self, sample: &PerformanceSample) -> Result<(), StoreError>;
    fn latest_system_info(&self, agent_id: &str) -> Result<Option<SystemInfo>, StoreError>;
    /// Release the underlying connection; later calls fail with `StoreError::Closed`
    fn close(&self) -> Result<(), StoreError>;
}

/// Tables holding persisted events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTable {
    Process,
    File,
    Network,
    System,
    Telemetry,
}

impl EventTable {
    pub const ALL: [EventTable; 5] = [
        EventTable::Process,
        EventTable::File,
        EventTable::Network,
        EventTable::System,
        EventTable::Telemetry,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventTable::Process => "process_events",
            EventTable::File => "file_events",
            EventTable::Network => "network_events",
            EventTable::System => "system_info",
            EventTable::Telemetry => "telemetry_events",
        }
    }
}

impl FromStr for EventTable {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventTable::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| StoreError::UnknownTable(s.to_string()))
    }
}

/// Event tables carrying an `is_scanned` flag and a matchable indicator column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanTable {
    Process,
    File,
    Network,
}

impl ScanTable {
    pub const ALL: [ScanTable; 3] = [ScanTable::File, ScanTable::Network, ScanTable::Process];

    pub fn table(&self) -> EventTable {
        match self {
            ScanTable::Process => EventTable::Process,
            ScanTable::File => EventTable::File,
            ScanTable::Network => EventTable::Network,
        }
    }

    pub(crate) fn indicator_column(&self) -> &'static str {
        match self {
            ScanTable::Process => "hash",
            ScanTable::File => "file_hash",
            ScanTable::Network => "remote_ip",
        }
    }

    pub fn indicator_type(&self) -> IndicatorType {
        match self {
            ScanTable::Process => IndicatorType::ProcessHash,
            ScanTable::File => IndicatorType::FileHash,
            ScanTable::Network => IndicatorType::IpAddress,
        }
    }
}
