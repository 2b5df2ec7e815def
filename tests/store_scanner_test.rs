//! Encrypted store round trips and idempotent indicator scanning.

use chrono::{Duration as ChronoDuration, Utc};
use endpoint_agent::collectors::{
    new_event_id, FileEvent, FileEventType, IndicatorType, AlertStatus, NetworkEvent, NetworkEventType,
    ProcessEvent, Protocol, Severity, SystemInfo,
};
use endpoint_agent::error::StoreError;
use endpoint_agent::scanner::IndicatorScanner;
use endpoint_agent::storage::{EventRepository, EventTable, ScanTable, SecureStore};
use std::sync::Arc;

const BAD_HASH: &str = "44d88612fea8a8f36de82e1278abb02f44d88612fea8a8f36de82e1278abb02f";

fn file_event(hash: Option<&str>) -> FileEvent {
    let now = Utc::now();
    FileEvent {
        id: new_event_id(),
        agent_id: "agent-1".into(),
        process_id: None,
        process_name: None,
        file_path: "/home/u/Downloads/payload.exe".into(),
        file_name: "payload.exe".into(),
        file_type: ".exe".into(),
        file_size: Some(1024),
        file_hash: hash.map(str::to_string),
        event_type: FileEventType::Create,
        timestamp: now,
        severity: Severity::Medium,
        created_at: now,
    }
}

fn network_event(remote: &str) -> NetworkEvent {
    let now = Utc::now();
    NetworkEvent {
        id: new_event_id(),
        agent_id: "agent-1".into(),
        process_id: Some(77),
        process_name: Some("curl".into()),
        local_ip: "10.0.0.5".into(),
        local_port: 50000,
        remote_ip: Some(remote.to_string()),
        remote_port: Some(443),
        protocol: Protocol::Tcp,
        event_type: NetworkEventType::Connect,
        timestamp: now,
        severity: Severity::Low,
        bytes_sent: None,
        bytes_received: None,
        connection_id: format!("10.0.0.5:50000-{}:443-TCP-77", remote),
        created_at: now,
    }
}

fn system_info(hostname: &str, offset_secs: i64) -> SystemInfo {
    let ts = Utc::now() + ChronoDuration::seconds(offset_secs);
    SystemInfo {
        id: new_event_id(),
        agent_id: "agent-1".into(),
        hostname: hostname.into(),
        os_version: "Linux 6.1".into(),
        architecture: "x86_64".into(),
        total_memory: 16 << 30,
        available_memory: 8 << 30,
        cpu_count: 8,
        cpu_usage: 12.5,
        disk_usage: 40.0,
        uptime: 3600,
        timestamp: ts,
        created_at: ts,
    }
}

fn open_store(dir: &tempfile::TempDir) -> Arc<SecureStore> {
    Arc::new(SecureStore::open(&dir.path().join("data").join("store.db"), b"test-secret").unwrap())
}

#[test]
fn payload_is_encrypted_and_recoverable() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let ev = ProcessEvent::stopped("agent-1", 42, "secretive".into(), None, Utc::now());
    store.save_process_event(&ev).unwrap();

    let payload = store.get_payload(EventTable::Process, &ev.id).unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
    assert_eq!(value["process_name"], "secretive");
    assert!(store.get_payload(EventTable::Process, "missing").unwrap().is_none());

    let other_key = SecureStore::open(&dir.path().join("data").join("store.db"), b"other").unwrap();
    assert!(matches!(
        other_key.get_payload(EventTable::Process, &ev.id),
        Err(StoreError::Crypto)
    ));
}

#[test]
fn counts_and_retention() {
    let store = SecureStore::open_in_memory(b"k").unwrap();
    let old = ProcessEvent::stopped("agent-1", 1, "old".into(), None, Utc::now() - ChronoDuration::days(40));
    let fresh = ProcessEvent::stopped("agent-2", 2, "fresh".into(), None, Utc::now());
    store.save_process_event(&old).unwrap();
    store.save_process_event(&fresh).unwrap();
    store.save_file_event(&file_event(None)).unwrap();

    assert_eq!(store.event_count(EventTable::Process, None, None).unwrap(), 2);
    assert_eq!(store.event_count(EventTable::Process, Some("agent-2"), None).unwrap(), 1);
    let week_ago = Utc::now() - ChronoDuration::days(7);
    assert_eq!(store.event_count(EventTable::Process, None, Some(week_ago)).unwrap(), 1);

    assert_eq!(store.prune_before(week_ago).unwrap(), 1);
    assert_eq!(store.event_count(EventTable::Process, None, None).unwrap(), 1);
    assert_eq!(store.event_count(EventTable::File, None, None).unwrap(), 1);
}

#[test]
fn duplicate_id_is_rejected() {
    let store = SecureStore::open_in_memory(b"k").unwrap();
    let ev = file_event(None);
    store.save_file_event(&ev).unwrap();
    assert!(store.save_file_event(&ev).is_err());
}

#[test]
fn latest_system_info_wins() {
    let store = SecureStore::open_in_memory(b"k").unwrap();
    assert!(store.latest_system_info("agent-1").unwrap().is_none());
    let older = system_info("host-a", -300);
    let newer = system_info("host-b", 0);
    store.save_system_info(&newer).unwrap();
    store.save_system_info(&older).unwrap();

    let latest = store.latest_system_info("agent-1").unwrap().unwrap();
    assert_eq!(latest.id, newer.id);
    assert_eq!(latest.hostname, "host-b");
    assert!(store.latest_system_info("agent-9").unwrap().is_none());
}

#[test]
fn closed_store_refuses_writes() {
    let store = SecureStore::open_in_memory(b"k").unwrap();
    store.close().unwrap();
    store.close().unwrap();
    assert!(matches!(store.save_file_event(&file_event(None)), Err(StoreError::Closed)));
}

#[test]
fn table_names_parse() {
    assert_eq!("file_events".parse::<EventTable>().unwrap(), EventTable::File);
    assert!(matches!("users".parse::<EventTable>(), Err(StoreError::UnknownTable(_))));
}

#[test]
fn scan_marks_every_row_and_alerts_on_matches() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.upsert_malicious_hash(BAD_HASH, "EICAR", "test-feed").unwrap();
    store.upsert_malicious_ip("203.0.113.9", "C2 server", "test-feed").unwrap();

    let bad_file = file_event(Some(BAD_HASH));
    let clean_file = file_event(Some("00"));
    let no_hash = file_event(None);
    let bad_conn = network_event("203.0.113.9");
    let clean_conn = network_event("93.184.216.34");
    for ev in [&bad_file, &clean_file, &no_hash] {
        store.save_file_event(ev).unwrap();
    }
    store.save_network_event(&bad_conn).unwrap();
    store.save_network_event(&clean_conn).unwrap();
    assert_eq!(store.unscanned(ScanTable::File, 100).unwrap().len(), 3);

    let scanner = IndicatorScanner::new(Arc::clone(&store)).with_batch_size(2);
    let first = scanner.scan_once().unwrap();
    assert_eq!(first.scanned, 5);
    assert_eq!(first.alerts, 2);

    let second = scanner.scan_once().unwrap();
    assert_eq!(second.scanned, 0);
    assert_eq!(second.alerts, 0);
    assert_eq!(store.alert_count().unwrap(), 2);
    assert!(store.unscanned(ScanTable::File, 100).unwrap().is_empty());

    let alerts = store.alerts_for_event(&bad_file.id).unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].indicator, BAD_HASH);
    assert_eq!(alerts[0].indicator_type, IndicatorType::FileHash);
    assert_eq!(alerts[0].severity, "high");
    assert_eq!(alerts[0].status, AlertStatus::New);
    assert!(alerts[0].threat_info.contains("EICAR"));

    let ip_alerts = store.alerts_for_event(&bad_conn.id).unwrap();
    assert_eq!(ip_alerts[0].indicator_type, IndicatorType::IpAddress);
    assert!(store.alerts_for_event(&clean_conn.id).unwrap().is_empty());
}

#[test]
fn process_hashes_are_matched() {
    let store = Arc::new(SecureStore::open_in_memory(b"k").unwrap());
    store.upsert_malicious_hash(&BAD_HASH.to_uppercase(), "EICAR", "feed").unwrap();
    let mut ev = ProcessEvent::stopped("agent-1", 9, "dropper".into(), None, Utc::now());
    ev.hash = Some(BAD_HASH.to_string());
    store.save_process_event(&ev).unwrap();

    let report = IndicatorScanner::new(Arc::clone(&store)).scan_once().unwrap();
    assert_eq!(report.alerts, 1);
    let alerts = store.alerts_for_event(&ev.id).unwrap();
    assert_eq!(alerts[0].indicator_type, IndicatorType::ProcessHash);
}

#[test]
fn rows_added_after_a_scan_are_picked_up_once() {
    let store = Arc::new(SecureStore::open_in_memory(b"k").unwrap());
    store.upsert_malicious_ip("203.0.113.9", "C2", "feed").unwrap();
    let scanner = IndicatorScanner::new(Arc::clone(&store));

    store.save_network_event(&network_event("203.0.113.9")).unwrap();
    assert_eq!(scanner.scan_once().unwrap().alerts, 1);

    store.save_network_event(&network_event("203.0.113.9")).unwrap();
    let report = scanner.scan_once().unwrap();
    assert_eq!((report.scanned, report.alerts), (1, 1));
    assert_eq!(store.alert_count().unwrap(), 2);
}

#[test]
fn indicator_import() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("indicators.json");
    std::fs::write(
        &path,
        format!(
            r#"{{
                "hashes": [{{ "sha256_hash": "{}", "malware_family": "EICAR" }}, {{ "sha256_hash": " " }}],
                "ips": [{{ "ip_address": "198.51.100.4", "reason": "scanner", "source": "abuse-feed" }}]
            }}"#,
            BAD_HASH
        ),
    )
    .unwrap();

    let store = Arc::new(SecureStore::open_in_memory(b"k").unwrap());
    let scanner = IndicatorScanner::new(Arc::clone(&store));
    let report = scanner.import_indicators(&path).unwrap();
    assert_eq!((report.hashes, report.ips), (1, 1));

    let hash = store.lookup_hash(BAD_HASH).unwrap().unwrap();
    assert_eq!(hash.malware_family, "EICAR");
    assert_eq!(hash.source, "manual");
    assert_eq!(store.lookup_ip("198.51.100.4").unwrap().unwrap().source, "abuse-feed");

    assert!(scanner.import_indicators(&dir.path().join("missing.json")).is_err());
}
