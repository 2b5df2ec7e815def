//! SQLite-backed store. Columns needed for range queries and indicator matching are
//! kept in clear; the full event JSON is AES-256-GCM encrypted into `payload_enc`.
//! The key is derived from a caller-supplied secret.

use super::schema::SCHEMA;
use super::{EventRepository, EventTable, ScanTable};
use crate::collectors::{
    Alert, AlertStatus, FileEvent, IndicatorType, NetworkEvent, PerformanceSample, ProcessEvent,
    SystemInfo,
};
use crate::error::StoreError;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

fn derive_key(secret: &[u8]) -> [u8; KEY_LEN] {
    use ring::digest;
    let mut out = [0u8; KEY_LEN];
    let h = digest::digest(&digest::SHA256, secret);
    out.copy_from_slice(&h.as_ref()[..KEY_LEN]);
    out
}

fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String, StoreError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| StoreError::Crypto)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt((&nonce).into(), plaintext)
        .map_err(|_| StoreError::Crypto)?;
    let mut out = nonce.to_vec();
    out.extend(ciphertext);
    Ok(BASE64.encode(&out))
}

fn open_sealed(key: &[u8; KEY_LEN], encoded: &str) -> Result<Vec<u8>, StoreError> {
    let raw = BASE64.decode(encoded)?;
    if raw.len() < NONCE_LEN {
        return Err(StoreError::Truncated);
    }
    let (nonce, ct) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| StoreError::Crypto)?;
    cipher.decrypt(nonce.into(), ct).map_err(|_| StoreError::Crypto)
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn indicator_type_from(s: &str) -> IndicatorType {
    match s {
        "file_hash" => IndicatorType::FileHash,
        "process_hash" => IndicatorType::ProcessHash,
        _ => IndicatorType::IpAddress,
    }
}

fn alert_status_from(s: &str) -> AlertStatus {
    match s {
        "investigating" => AlertStatus::Investigating,
        "resolved" => AlertStatus::Resolved,
        "false_positive" => AlertStatus::FalsePositive,
        _ => AlertStatus::New,
    }
}

/// Unscanned row handed to the indicator scanner
#[derive(Debug, Clone, PartialEq)]
pub struct ScanCandidate {
    pub id: String,
    pub indicator: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HashIndicator {
    pub sha256_hash: String,
    pub malware_family: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IpIndicator {
    pub ip_address: String,
    pub reason: String,
    pub source: String,
}

pub struct SecureStore {
    conn: Mutex<Option<Connection>>,
    key: [u8; KEY_LEN],
}

impl SecureStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path, secret: &[u8]) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "event store opened");
        Self::with_connection(conn, secret)
    }

    pub fn open_in_memory(secret: &[u8]) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, secret)
    }

    fn with_connection(conn: Connection, secret: &[u8]) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            key: derive_key(secret),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(StoreError::Closed),
        }
    }

    fn seal_json(&self, value: &impl Serialize) -> Result<String, StoreError> {
        let json = serde_json::to_vec(value)?;
        seal(&self.key, &json)
    }

    /// Decrypted event JSON for `id`
    pub fn get_payload(&self, table: EventTable, id: &str) -> Result<Option<String>, StoreError> {
        let enc: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT payload_enc FROM {} WHERE id = ?1", table.name()),
                    params![id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        match enc {
            Some(enc) => {
                let plain = open_sealed(&self.key, &enc)?;
                Ok(Some(String::from_utf8_lossy(&plain).into_owned()))
            }
            None => Ok(None),
        }
    }

    /// Row count, optionally restricted to one agent and to rows at or after `since`
    pub fn event_count(
        &self,
        table: EventTable,
        agent_id: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE (?1 IS NULL OR agent_id = ?1) AND timestamp >= ?2",
                    table.name()
                ),
                params![agent_id, since.map(millis).unwrap_or(i64::MIN)],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// Retention: delete events older than `cutoff` from every event table
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let mut total = 0u64;
            for table in EventTable::ALL {
                let n = conn.execute(
                    &format!("DELETE FROM {} WHERE timestamp < ?1", table.name()),
                    params![millis(cutoff)],
                )?;
                total += n as u64;
            }
            Ok(total)
        })
    }

    /// Up to `limit` rows not yet marked scanned, oldest first
    pub fn unscanned(&self, table: ScanTable, limit: usize) -> Result<Vec<ScanCandidate>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, {} FROM {} WHERE is_scanned = 0 ORDER BY timestamp LIMIT ?1",
                table.indicator_column(),
                table.table().name()
            ))?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(ScanCandidate {
                    id: row.get(0)?,
                    indicator: row.get(1)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn mark_scanned(&self, table: ScanTable, ids: &[String]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut marked = 0;
            {
                let mut stmt = tx.prepare(&format!(
                    "UPDATE {} SET is_scanned = 1 WHERE id = ?1",
                    table.table().name()
                ))?;
                for id in ids {
                    marked += stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(marked)
        })
    }

    /// Returns false if an alert for the same event and indicator already exists
    pub fn insert_alert(&self, alert: &Alert) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO alerts (id, event_id, indicator, indicator_type, threat_info, severity, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    alert.id,
                    alert.event_id,
                    alert.indicator,
                    alert.indicator_type.as_str(),
                    alert.threat_info,
                    alert.severity,
                    alert.status.as_str(),
                    millis(alert.created_at),
                ],
            )?;
            Ok(n > 0)
        })
    }

    pub fn alerts_for_event(&self, event_id: &str) -> Result<Vec<Alert>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_id, indicator, indicator_type, threat_info, severity, status, created_at
                 FROM alerts WHERE event_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![event_id], |row| {
                let indicator_type: String = row.get(3)?;
                let status: String = row.get(6)?;
                Ok(Alert {
                    id: row.get(0)?,
                    event_id: row.get(1)?,
                    indicator: row.get(2)?,
                    indicator_type: indicator_type_from(&indicator_type),
                    threat_info: row.get(4)?,
                    severity: row.get(5)?,
                    status: alert_status_from(&status),
                    created_at: from_millis(row.get(7)?),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn alert_count(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
            Ok(n as u64)
        })
    }

    pub fn upsert_malicious_hash(&self, hash: &str, family: &str, source: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO malicious_hashes (sha256_hash, malware_family, source, added_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(sha256_hash) DO UPDATE SET malware_family = excluded.malware_family, source = excluded.source",
                params![hash.to_lowercase(), family, source, millis(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn upsert_malicious_ip(&self, ip: &str, reason: &str, source: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO malicious_ips (ip_address, reason, source, added_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(ip_address) DO UPDATE SET reason = excluded.reason, source = excluded.source",
                params![ip, reason, source, millis(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn lookup_hash(&self, hash: &str) -> Result<Option<HashIndicator>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT sha256_hash, malware_family, source FROM malicious_hashes WHERE sha256_hash = ?1",
                    params![hash.to_lowercase()],
                    |row| {
                        Ok(HashIndicator {
                            sha256_hash: row.get(0)?,
                            malware_family: row.get(1)?,
                            source: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn lookup_ip(&self, ip: &str) -> Result<Option<IpIndicator>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT ip_address, reason, source FROM malicious_ips WHERE ip_address = ?1",
                    params![ip],
                    |row| {
                        Ok(IpIndicator {
                            ip_address: row.get(0)?,
                            reason: row.get(1)?,
                            source: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }
}

impl EventRepository for SecureStore {
    fn save_process_event(&self, ev: &ProcessEvent) -> Result<(), StoreError> {
        let enc = self.seal_json(ev)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO process_events (id, agent_id, process_id, parent_process_id, process_name, executable_path, hash, event_type, severity, timestamp, payload_enc, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    ev.id,
                    ev.agent_id,
                    ev.process_id,
                    ev.parent_process_id,
                    ev.process_name,
                    ev.executable_path,
                    ev.hash,
                    ev.event_type.as_str(),
                    ev.severity.as_str(),
                    millis(ev.timestamp),
                    enc,
                    millis(ev.created_at),
                ],
            )?;
            Ok(())
        })
    }

    fn save_file_event(&self, ev: &FileEvent) -> Result<(), StoreError> {
        let enc = self.seal_json(ev)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO file_events (id, agent_id, file_path, file_name, file_hash, event_type, severity, timestamp, payload_enc, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    ev.id,
                    ev.agent_id,
                    ev.file_path,
                    ev.file_name,
                    ev.file_hash,
                    ev.event_type.as_str(),
                    ev.severity.as_str(),
                    millis(ev.timestamp),
                    enc,
                    millis(ev.created_at),
                ],
            )?;
            Ok(())
        })
    }

    fn save_network_event(&self, ev: &NetworkEvent) -> Result<(), StoreError> {
        let enc = self.seal_json(ev)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO network_events (id, agent_id, process_id, local_ip, local_port, remote_ip, remote_port, protocol, connection_id, event_type, severity, timestamp, payload_enc, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    ev.id,
                    ev.agent_id,
                    ev.process_id,
                    ev.local_ip,
                    ev.local_port,
                    ev.remote_ip,
                    ev.remote_port,
                    ev.protocol.as_str(),
                    ev.connection_id,
                    ev.event_type.as_str(),
                    ev.severity.as_str(),
                    millis(ev.timestamp),
                    enc,
                    millis(ev.created_at),
                ],
            )?;
            Ok(())
        })
    }

    fn save_system_info(&self, info: &SystemInfo) -> Result<(), StoreError> {
        let enc = self.seal_json(info)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO system_info (id, agent_id, hostname, timestamp, payload_enc, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    info.id,
                    info.agent_id,
                    info.hostname,
                    millis(info.timestamp),
                    enc,
                    millis(info.created_at),
                ],
            )?;
            Ok(())
        })
    }

    fn save_performance_sample(&self, sample: &PerformanceSample) -> Result<(), StoreError> {
        let enc = self.seal_json(sample)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO telemetry_events (id, agent_id, event_type, severity, timestamp, payload_enc, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    sample.id,
                    sample.agent_id,
                    sample.event_type,
                    sample.severity.as_str(),
                    millis(sample.timestamp),
                    enc,
                    millis(sample.created_at),
                ],
            )?;
            Ok(())
        })
    }

    fn latest_system_info(&self, agent_id: &str) -> Result<Option<SystemInfo>, StoreError> {
        let enc: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT payload_enc FROM system_info WHERE agent_id = ?1 ORDER BY timestamp DESC LIMIT 1",
                    params![agent_id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        match enc {
            Some(enc) => {
                let plain = open_sealed(&self.key, &enc)?;
                Ok(Some(serde_json::from_slice(&plain)?))
            }
            None => Ok(None),
        }
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            debug!("event store closed");
        }
        Ok(())
    }
}
