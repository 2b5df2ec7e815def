//! Batch indicator matching over persisted events. Every row visited is marked
//! scanned whether or not it matched, so a second pass over the same rows does nothing.

use crate::collectors::{new_event_id, Alert, AlertStatus};
use crate::error::StoreError;
use crate::shutdown::Shutdown;
use crate::storage::{ScanTable, SecureStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const ALERT_SEVERITY: &str = "high";
const DEFAULT_BATCH: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub alerts: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub hashes: usize,
    pub ips: usize,
}

#[derive(Debug, Deserialize)]
struct HashEntry {
    sha256_hash: String,
    #[serde(default)]
    malware_family: String,
    #[serde(default = "default_source")]
    source: String,
}

#[derive(Debug, Deserialize)]
struct IpEntry {
    ip_address: String,
    #[serde(default)]
    reason: String,
    #[serde(default = "default_source")]
    source: String,
}

fn default_source() -> String {
    "manual".to_string()
}

/// `{ "hashes": [...], "ips": [...] }`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IndicatorFile {
    hashes: Vec<HashEntry>,
    ips: Vec<IpEntry>,
}

pub struct IndicatorScanner {
    store: Arc<SecureStore>,
    batch: usize,
}

impl IndicatorScanner {
    pub fn new(store: Arc<SecureStore>) -> Self {
        Self {
            store,
            batch: DEFAULT_BATCH,
        }
    }

    pub fn with_batch_size(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// Scan every unscanned row in the file, network and process tables
    pub fn scan_once(&self) -> Result<ScanReport, StoreError> {
        let mut report = ScanReport::default();
        for table in ScanTable::ALL {
            loop {
                let rows = self.store.unscanned(table, self.batch)?;
                if rows.is_empty() {
                    break;
                }
                let mut ids = Vec::with_capacity(rows.len());
                for row in rows {
                    if let Some(indicator) = row.indicator.as_deref().filter(|i| !i.is_empty()) {
                        if let Some(threat_info) = self.match_indicator(table, indicator)? {
                            let alert = Alert {
                                id: new_event_id(),
                                event_id: row.id.clone(),
                                indicator: indicator.to_string(),
                                indicator_type: table.indicator_type(),
                                threat_info,
                                severity: ALERT_SEVERITY.to_string(),
                                status: AlertStatus::New,
                                created_at: Utc::now(),
                            };
                            if self.store.insert_alert(&alert)? {
                                warn!(
                                    event_id = %alert.event_id,
                                    indicator = %alert.indicator,
                                    indicator_type = alert.indicator_type.as_str(),
                                    "indicator match"
                                );
                                report.alerts += 1;
                            }
                        }
                    }
                    ids.push(row.id);
                }
                report.scanned += self.store.mark_scanned(table, &ids)?;
            }
        }
        debug!(scanned = report.scanned, alerts = report.alerts, "indicator scan pass");
        Ok(report)
    }

    fn match_indicator(&self, table: ScanTable, indicator: &str) -> Result<Option<String>, StoreError> {
        Ok(match table {
            ScanTable::File | ScanTable::Process => self.store.lookup_hash(indicator)?.map(|h| {
                format!("Malware family: {} (source: {})", h.malware_family, h.source)
            }),
            ScanTable::Network => self
                .store
                .lookup_ip(indicator)?
                .map(|ip| format!("Malicious IP: {} (source: {})", ip.reason, ip.source)),
        })
    }

    /// Load hash and IP indicator lists from a JSON file; existing entries are updated
    pub fn import_indicators(&self, path: &Path) -> Result<ImportReport, StoreError> {
        let data = std::fs::read_to_string(path)?;
        let file: IndicatorFile = serde_json::from_str(&data)?;
        let mut report = ImportReport::default();
        for h in &file.hashes {
            if h.sha256_hash.trim().is_empty() {
                continue;
            }
            self.store
                .upsert_malicious_hash(h.sha256_hash.trim(), &h.malware_family, &h.source)?;
            report.hashes += 1;
        }
        for ip in &file.ips {
            if ip.ip_address.trim().is_empty() {
                continue;
            }
            self.store
                .upsert_malicious_ip(ip.ip_address.trim(), &ip.reason, &ip.source)?;
            report.ips += 1;
        }
        info!(path = %path.display(), hashes = report.hashes, ips = report.ips, "indicators imported");
        Ok(report)
    }

    /// Scan immediately, then every `period` until shutdown
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: Shutdown) {
        info!(interval_secs = period.as_secs(), "indicator scanner started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    let scanner = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || scanner.scan_once()).await {
                        Ok(Ok(report)) if report.scanned > 0 => {
                            info!(scanned = report.scanned, alerts = report.alerts, "indicator scan complete");
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!(error = %e, "indicator scan failed"),
                        Err(e) => warn!(error = %e, "indicator scan task failed"),
                    }
                }
            }
        }
        info!("indicator scanner stopped");
    }
}
