//! Network connection observer. The OS exposes no connection stream here, so each
//! poll merges several rapid samples of the connection table and diffs the merged
//! set against the previous poll; fingerprints absent last time become `connect`
//! events. `samples` and `sample_delay` set the capture window for short-lived
//! connections.

use super::{new_event_id, EventSender, NetworkEvent, NetworkEventType, Protocol, Severity};
use crate::config::NetworkConfig;
use crate::error::CollectError;
use crate::shutdown::Shutdown;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Loopback, unspecified and common gateway addresses
const BENIGN_REMOTES: &[&str] = &["0.0.0.0", "127.0.0.1", "::1", "::", "192.168.1.1", "10.0.0.1"];
const NON_STANDARD_PORTS: &[u16] = &[22, 23, 3389, 5900, 8080, 8443, 9000];
const EPHEMERAL_PORT_FLOOR: u16 = 49152;
const HIGH_TRANSFER_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Established,
    Listen,
    Opening,
    Closing,
    /// Unconnected datagram socket
    Bound,
    Close,
    Unknown,
}

/// One row of the OS connection table
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub local_ip: String,
    pub local_port: u16,
    pub remote_ip: Option<String>,
    pub remote_port: Option<u16>,
    pub protocol: Protocol,
    pub pid: u32,
    pub state: ConnState,
    pub bytes_sent: Option<u64>,
    pub bytes_received: Option<u64>,
}

impl Connection {
    pub fn fingerprint(&self) -> String {
        connection_fingerprint(
            &self.local_ip,
            self.local_port,
            self.remote_ip.as_deref(),
            self.remote_port,
            self.protocol,
            self.pid,
        )
    }

    /// Rows without an owner or in a closed/unknown state are not tracked
    pub fn is_trackable(&self) -> bool {
        self.pid != 0 && !matches!(self.state, ConnState::Close | ConnState::Unknown)
    }
}

/// `localIP:localPort-remoteIP:remotePort-protocol-pid`
pub fn connection_fingerprint(
    local_ip: &str,
    local_port: u16,
    remote_ip: Option<&str>,
    remote_port: Option<u16>,
    protocol: Protocol,
    pid: u32,
) -> String {
    format!(
        "{}:{}-{}:{}-{}-{}",
        local_ip,
        local_port,
        remote_ip.unwrap_or(""),
        remote_port.unwrap_or(0),
        protocol.as_str(),
        pid
    )
}

/// Severity of a new connection. Pure: depends only on its arguments.
pub fn network_severity(
    remote_ip: Option<&str>,
    remote_port: Option<u16>,
    bytes_sent: Option<u64>,
    bytes_received: Option<u64>,
) -> Severity {
    if let Some(ip) = remote_ip {
        if BENIGN_REMOTES.contains(&ip) {
            return Severity::Low;
        }
    }
    if let Some(port) = remote_port {
        if NON_STANDARD_PORTS.contains(&port) || port > EPHEMERAL_PORT_FLOOR {
            return Severity::Medium;
        }
    }
    if bytes_sent.unwrap_or(0) > HIGH_TRANSFER_BYTES || bytes_received.unwrap_or(0) > HIGH_TRANSFER_BYTES {
        return Severity::Medium;
    }
    Severity::Low
}

/// OS connection table access
pub trait ConnectionSource: Send {
    fn connections(&mut self) -> Result<Vec<Connection>, CollectError>;
    fn process_name(&mut self, pid: u32) -> Option<String>;
}

/// Connection table from procfs (`net/tcp*`, `net/udp*`), owners resolved through `<pid>/fd`
pub struct ProcNetSource {
    root: PathBuf,
}

impl ProcNetSource {
    /// The host's procfs; other platforms have no connection table source
    pub fn native() -> Result<Self, CollectError> {
        if cfg!(target_os = "linux") {
            Ok(Self::with_root("/proc"))
        } else {
            Err(CollectError::Unsupported("connection table"))
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn socket_owners(&self) -> HashMap<u64, u32> {
        let mut owners = HashMap::new();
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return owners;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.filter_map(|e| e.ok()) {
                let Ok(target) = std::fs::read_link(fd.path()) else {
                    continue;
                };
                let target = target.to_string_lossy();
                if let Some(inode) = target
                    .strip_prefix("socket:[")
                    .and_then(|s| s.strip_suffix(']'))
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    owners.entry(inode).or_insert(pid);
                }
            }
        }
        owners
    }
}

impl ConnectionSource for ProcNetSource {
    fn connections(&mut self) -> Result<Vec<Connection>, CollectError> {
        let tables = [
            ("tcp", Protocol::Tcp, false),
            ("tcp6", Protocol::Tcp, true),
            ("udp", Protocol::Udp, false),
            ("udp6", Protocol::Udp, true),
        ];
        let mut rows = Vec::new();
        let mut readable = 0;
        for (file, protocol, v6) in tables {
            let path = self.root.join("net").join(file);
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    readable += 1;
                    rows.extend(parse_table(&content, protocol, v6));
                }
                Err(e) => debug!(path = %path.display(), error = %e, "connection table unreadable"),
            }
        }
        if readable == 0 {
            return Err(CollectError::Enumeration(format!(
                "no connection tables under {}",
                self.root.display()
            )));
        }
        let owners = self.socket_owners();
        Ok(rows
            .into_iter()
            .map(|(mut conn, inode)| {
                conn.pid = owners.get(&inode).copied().unwrap_or(0);
                conn
            })
            .collect())
    }

    fn process_name(&mut self, pid: u32) -> Option<String> {
        let comm = std::fs::read_to_string(self.root.join(pid.to_string()).join("comm")).ok()?;
        let name = comm.trim();
        (!name.is_empty()).then(|| name.to_string())
    }
}

/// Placeholder for platforms without a connection table source
pub(crate) struct UnsupportedConnections;

impl ConnectionSource for UnsupportedConnections {
    fn connections(&mut self) -> Result<Vec<Connection>, CollectError> {
        Err(CollectError::Unsupported("connection table"))
    }

    fn process_name(&mut self, _pid: u32) -> Option<String> {
        None
    }
}

fn tcp_state(code: u8) -> ConnState {
    match code {
        0x01 => ConnState::Established,
        0x02 | 0x03 => ConnState::Opening,
        0x04 | 0x05 | 0x06 | 0x08 | 0x09 | 0x0B => ConnState::Closing,
        0x07 => ConnState::Close,
        0x0A => ConnState::Listen,
        _ => ConnState::Unknown,
    }
}

fn udp_state(code: u8) -> ConnState {
    match code {
        0x01 => ConnState::Established,
        0x07 => ConnState::Bound,
        _ => ConnState::Unknown,
    }
}

/// `0100007F:0035` -> 127.0.0.1:53. Address words are printed in host byte order.
fn parse_endpoint(field: &str, v6: bool) -> Option<(IpAddr, u16)> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = if v6 {
        if addr.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in bytes.chunks_mut(4).enumerate() {
            let word = u32::from_str_radix(&addr[i * 8..(i + 1) * 8], 16).ok()?;
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        let v6 = Ipv6Addr::from(bytes);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    } else {
        let word = u32::from_str_radix(addr, 16).ok()?;
        IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
    };
    Some((ip, port))
}

fn parse_table(content: &str, protocol: Protocol, v6: bool) -> Vec<(Connection, u64)> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let (local_ip, local_port) = parse_endpoint(fields[1], v6)?;
            let (remote_ip, remote_port) = parse_endpoint(fields[2], v6)?;
            let code = u8::from_str_radix(fields[3], 16).ok()?;
            let inode = fields[9].parse::<u64>().ok()?;
            let state = match protocol {
                Protocol::Tcp => tcp_state(code),
                _ => udp_state(code),
            };
            let (remote_ip, remote_port) = if remote_ip.is_unspecified() && remote_port == 0 {
                (None, None)
            } else {
                (Some(remote_ip.to_string()), Some(remote_port))
            };
            Some((
                Connection {
                    local_ip: local_ip.to_string(),
                    local_port,
                    remote_ip,
                    remote_port,
                    protocol,
                    pid: 0,
                    state,
                    bytes_sent: None,
                    bytes_received: None,
                },
                inode,
            ))
        })
        .collect()
}

pub struct NetworkObserver {
    agent_id: String,
    source: Mutex<Box<dyn ConnectionSource>>,
    /// Merged set from the previous poll, keyed by fingerprint
    previous: Mutex<HashMap<String, Connection>>,
    /// fingerprint -> last emission, for event-level dedup
    recent: Mutex<HashMap<String, DateTime<Utc>>>,
    poll_interval: Duration,
    samples: u32,
    sample_delay: Duration,
    recent_ttl: chrono::Duration,
    tx: EventSender<NetworkEvent>,
}

impl NetworkObserver {
    pub fn new(
        agent_id: impl Into<String>,
        source: Box<dyn ConnectionSource>,
        config: &NetworkConfig,
        tx: EventSender<NetworkEvent>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            source: Mutex::new(source),
            previous: Mutex::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            samples: config.samples.max(1),
            sample_delay: Duration::from_millis(config.sample_delay_ms),
            recent_ttl: chrono::Duration::seconds(config.recent_ttl_secs as i64),
            tx,
        }
    }

    fn lock_source(&self) -> std::sync::MutexGuard<'_, Box<dyn ConnectionSource>> {
        self.source.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Trackable rows of one table read, keyed by fingerprint
    fn sample(&self) -> Result<HashMap<String, Connection>, CollectError> {
        let conns = self.lock_source().connections()?;
        Ok(conns
            .into_iter()
            .filter(Connection::is_trackable)
            .map(|c| (c.fingerprint(), c))
            .collect())
    }

    /// One table read on the blocking pool; procfs walks every fd link
    async fn sample_blocking(self: &Arc<Self>) -> Result<HashMap<String, Connection>, CollectError> {
        let observer = Arc::clone(self);
        match tokio::task::spawn_blocking(move || observer.sample()).await {
            Ok(res) => res,
            Err(e) => Err(CollectError::Enumeration(format!("sampling task failed: {}", e))),
        }
    }

    /// Union of `samples` reads spaced `sample_delay` apart; None if every read failed
    pub async fn sample_merged(self: &Arc<Self>) -> Option<HashMap<String, Connection>> {
        let mut merged = HashMap::new();
        let mut ok = false;
        for i in 0..self.samples {
            match self.sample_blocking().await {
                Ok(conns) => {
                    ok = true;
                    merged.extend(conns);
                }
                Err(e) => debug!(sample = i, error = %e, "connection sample failed"),
            }
            if i + 1 < self.samples && !self.sample_delay.is_zero() {
                tokio::time::sleep(self.sample_delay).await;
            }
        }
        ok.then_some(merged)
    }

    /// Emit `connect` for fingerprints absent from the previous set, then make `merged` the previous set
    pub fn diff(&self, merged: HashMap<String, Connection>, now: DateTime<Utc>) -> usize {
        let fresh: Vec<(String, Connection)> = {
            let mut previous = self.previous.lock().unwrap_or_else(|p| p.into_inner());
            let fresh = merged
                .iter()
                .filter(|(k, _)| !previous.contains_key(*k))
                .map(|(k, c)| (k.clone(), c.clone()))
                .collect();
            *previous = merged;
            fresh
        };

        let mut emitted = 0;
        for (key, conn) in fresh {
            {
                let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(seen) = recent.get(&key) {
                    if now.signed_duration_since(*seen) < self.recent_ttl {
                        continue;
                    }
                }
                recent.insert(key.clone(), now);
            }
            let name = self.lock_source().process_name(conn.pid);
            let ev = self.build_event(&conn, key, name, now);
            debug!(
                connection_id = %ev.connection_id,
                severity = ev.severity.as_str(),
                "new connection"
            );
            self.tx.push(ev);
            emitted += 1;
        }
        emitted
    }

    /// One poll cycle; a cycle where every sample failed is skipped and the previous set kept
    pub async fn poll(self: &Arc<Self>) -> usize {
        match self.sample_merged().await {
            Some(merged) => {
                // process names come from procfs too
                let observer = Arc::clone(self);
                match tokio::task::spawn_blocking(move || observer.diff(merged, Utc::now())).await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "connection diff task failed");
                        0
                    }
                }
            }
            None => {
                warn!("connection enumeration failed, skipping cycle");
                0
            }
        }
    }

    /// Confirm the table is readable before the poll loop starts
    pub fn probe(&self) -> Result<usize, CollectError> {
        self.sample().map(|m| m.len())
    }

    /// `connect` event for every current connection; diff state is left untouched
    pub fn snapshot_all(&self, now: DateTime<Utc>) -> Result<Vec<NetworkEvent>, CollectError> {
        let current = self.sample()?;
        let mut source = self.lock_source();
        Ok(current
            .into_iter()
            .map(|(key, conn)| {
                let name = source.process_name(conn.pid);
                self.build_event(&conn, key, name, now)
            })
            .collect())
    }

    fn build_event(
        &self,
        conn: &Connection,
        connection_id: String,
        process_name: Option<String>,
        now: DateTime<Utc>,
    ) -> NetworkEvent {
        NetworkEvent {
            id: new_event_id(),
            agent_id: self.agent_id.clone(),
            process_id: (conn.pid > 0).then_some(conn.pid),
            process_name,
            local_ip: conn.local_ip.clone(),
            local_port: conn.local_port,
            remote_ip: conn.remote_ip.clone(),
            remote_port: conn.remote_port,
            protocol: conn.protocol,
            event_type: NetworkEventType::Connect,
            timestamp: now,
            severity: network_severity(
                conn.remote_ip.as_deref(),
                conn.remote_port,
                conn.bytes_sent,
                conn.bytes_received,
            ),
            bytes_sent: conn.bytes_sent,
            bytes_received: conn.bytes_received,
            connection_id,
            created_at: now,
        }
    }

    /// Purge recent-seen entries older than the TTL
    pub fn evict(&self, now: DateTime<Utc>) -> usize {
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        let before = recent.len();
        let cutoff = now - self.recent_ttl;
        recent.retain(|_, seen| *seen >= cutoff);
        before - recent.len()
    }

    pub fn tracked_connections(&self) -> usize {
        self.previous.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn recent_entries(&self) -> usize {
        self.recent.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn dropped(&self) -> u64 {
        self.tx.dropped()
    }

    /// Probe, then poll until shutdown. A failed probe ends the task.
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        match self.sample_blocking().await.map(|m| m.len()) {
            Ok(n) => info!(connections = n, "network monitoring started"),
            Err(e) => {
                error!(error = %e, "initial connection snapshot failed, network monitoring disabled");
                return;
            }
        }
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            // sampling sleeps between reads, so keep it cancellable too
            tokio::select! {
                _ = shutdown.wait() => break,
                n = self.poll() => {
                    if n > 0 {
                        debug!(new = n, "network changes");
                    }
                }
            }
        }
        info!("network monitoring stopped");
    }
}

impl Default for ProcNetSource {
    fn default() -> Self {
        Self::with_root(Path::new("/proc"))
    }
}
