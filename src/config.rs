//! Agent configuration. Every section has defaults so a missing file still yields a working agent.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Identity stamped on every event
    pub agent: AgentIdentity,
    /// Data directory (event store)
    pub data_dir: PathBuf,
    /// Observer tuning
    pub collectors: CollectorsConfig,
    /// Message bus boundary
    pub bus: BusConfig,
    /// Local store
    pub store: StoreConfig,
    /// Indicator scanner
    pub scanner: ScannerConfig,
    /// Deadline for stop() to wait on background tasks
    pub shutdown_timeout_ms: u64,
    /// Logging
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentIdentity {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorsConfig {
    /// Capacity of each observer's output queue
    pub queue_capacity: usize,
    pub process: ProcessConfig,
    pub file: FileConfig,
    pub network: NetworkConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// Executables larger than this are not hashed
    pub hash_limit_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    /// Filesystem change notifications
    Notify,
    /// Periodic recursive walk
    Scan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub enabled: bool,
    pub mode: FileMode,
    /// Directories to observe; empty means temp, downloads, desktop and documents
    pub watch_dirs: Vec<PathBuf>,
    pub scan_interval_secs: u64,
    pub scan_max_depth: usize,
    /// Same path is reported at most once per window
    pub debounce_secs: u64,
    /// Cache entries older than this are evicted
    pub retention_secs: u64,
    pub eviction_interval_secs: u64,
    pub hash_limit_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    /// Rapid samples merged per poll; widens the window for short-lived connections
    pub samples: u32,
    pub sample_delay_ms: u64,
    pub recent_ttl_secs: u64,
    pub eviction_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub enabled: bool,
    /// Base URL of the bus gateway
    pub endpoint: Option<String>,
    pub exchange: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub file_name: String,
    /// Environment variable holding the payload encryption secret
    pub secret_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent: AgentIdentity::default(),
            data_dir: PathBuf::from(".endpoint-agent"),
            collectors: CollectorsConfig::default(),
            bus: BusConfig::default(),
            store: StoreConfig::default(),
            scanner: ScannerConfig::default(),
            shutdown_timeout_ms: 10_000,
            log: LogConfig::default(),
        }
    }
}

impl Default for AgentIdentity {
    fn default() -> Self {
        Self {
            id: "endpoint-agent-001".to_string(),
            name: "Endpoint Telemetry Agent".to_string(),
        }
    }
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            process: ProcessConfig::default(),
            file: FileConfig::default(),
            network: NetworkConfig::default(),
            system: SystemConfig::default(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1000,
            hash_limit_bytes: 100 * 1024 * 1024,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: FileMode::Notify,
            watch_dirs: Vec::new(),
            scan_interval_secs: 60,
            scan_max_depth: 4,
            debounce_secs: 300,
            retention_secs: 600,
            eviction_interval_secs: 300,
            hash_limit_bytes: 100 * 1024 * 1024,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 2000,
            samples: 3,
            sample_delay_ms: 200,
            recent_ttl_secs: 30,
            eviction_interval_secs: 120,
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            exchange: "events".to_string(),
            timeout_secs: 15,
            connect_timeout_secs: 5,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            file_name: "store.db".to_string(),
            secret_env: "ENDPOINT_AGENT_SECRET".to_string(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl AgentConfig {
    /// Load from JSON file if present; otherwise return default
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<AgentConfig>(&data) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable config, using defaults");
                Self::default()
            }
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.store.file_name)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl FileConfig {
    /// Configured directories, or the user-data defaults when none are set
    pub fn resolved_dirs(&self) -> Vec<PathBuf> {
        if !self.watch_dirs.is_empty() {
            return self.watch_dirs.clone();
        }
        let mut resolved = vec![std::env::temp_dir()];
        resolved.extend(dirs::download_dir());
        resolved.extend(dirs::desktop_dir());
        resolved.extend(dirs::document_dir());
        resolved.dedup();
        resolved
    }
}
