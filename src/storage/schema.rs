//! Table layout. Timestamps are unix milliseconds; `payload_enc` holds the full event JSON, encrypted.

pub(super) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS process_events (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    process_id INTEGER NOT NULL,
    parent_process_id INTEGER,
    process_name TEXT NOT NULL,
    executable_path TEXT,
    hash TEXT,
    event_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    is_scanned INTEGER NOT NULL DEFAULT 0,
    payload_enc TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_process_events_agent ON process_events(agent_id);
CREATE INDEX IF NOT EXISTS idx_process_events_ts ON process_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_process_events_type ON process_events(event_type);
CREATE INDEX IF NOT EXISTS idx_process_events_scan ON process_events(is_scanned);

CREATE TABLE IF NOT EXISTS file_events (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    file_path TEXT NOT NULL,
    file_name TEXT NOT NULL,
    file_hash TEXT,
    event_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    is_scanned INTEGER NOT NULL DEFAULT 0,
    payload_enc TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_file_events_agent ON file_events(agent_id);
CREATE INDEX IF NOT EXISTS idx_file_events_ts ON file_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_file_events_type ON file_events(event_type);
CREATE INDEX IF NOT EXISTS idx_file_events_scan ON file_events(is_scanned);

CREATE TABLE IF NOT EXISTS network_events (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    process_id INTEGER,
    local_ip TEXT NOT NULL,
    local_port INTEGER NOT NULL,
    remote_ip TEXT,
    remote_port INTEGER,
    protocol TEXT NOT NULL,
    connection_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    is_scanned INTEGER NOT NULL DEFAULT 0,
    payload_enc TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_network_events_agent ON network_events(agent_id);
CREATE INDEX IF NOT EXISTS idx_network_events_ts ON network_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_network_events_type ON network_events(event_type);
CREATE INDEX IF NOT EXISTS idx_network_events_scan ON network_events(is_scanned);

CREATE TABLE IF NOT EXISTS system_info (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    hostname TEXT NOT NULL,
    event_type TEXT NOT NULL DEFAULT 'system_info',
    timestamp INTEGER NOT NULL,
    payload_enc TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_system_info_agent ON system_info(agent_id);
CREATE INDEX IF NOT EXISTS idx_system_info_ts ON system_info(timestamp);

CREATE TABLE IF NOT EXISTS telemetry_events (
    id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    payload_enc TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_telemetry_events_agent ON telemetry_events(agent_id);
CREATE INDEX IF NOT EXISTS idx_telemetry_events_ts ON telemetry_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_telemetry_events_type ON telemetry_events(event_type);

CREATE TABLE IF NOT EXISTS alerts (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL,
    indicator TEXT NOT NULL,
    indicator_type TEXT NOT NULL,
    threat_info TEXT NOT NULL,
    severity TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_event_indicator ON alerts(event_id, indicator);
CREATE INDEX IF NOT EXISTS idx_alerts_status ON alerts(status);

CREATE TABLE IF NOT EXISTS malicious_hashes (
    sha256_hash TEXT PRIMARY KEY,
    malware_family TEXT NOT NULL,
    source TEXT NOT NULL,
    added_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS malicious_ips (
    ip_address TEXT PRIMARY KEY,
    reason TEXT NOT NULL,
    source TEXT NOT NULL,
    added_at INTEGER NOT NULL
);
"#;
