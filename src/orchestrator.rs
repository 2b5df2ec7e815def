//! Pipeline lifecycle: one task per observer, one consumer per event type,
//! cache eviction and system snapshots, all under a single shutdown signal.

use crate::collectors::{
    event_queue, ConnectionSource, DropCounter, EventReceiver, EventSender, FileEvent, FileObserver,
    NetworkEvent, NetworkObserver, ProcNetSource, ProcessEvent, ProcessObserver, ProcessSource,
    SysinfoProcessSource, SystemCollector, SystemInfo, TelemetryRecord, UnsupportedConnections,
};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::publish::{topic_for, Envelope, Publisher};
use crate::shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
use crate::storage::EventRepository;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Supplies OS access to observers; replaced in tests with scripted sources
pub trait SourceFactory: Send + Sync {
    fn process_source(&self) -> Box<dyn ProcessSource>;
    fn connection_source(&self) -> Box<dyn ConnectionSource>;
}

/// sysinfo process table and procfs connection table
#[derive(Debug, Default)]
pub struct NativeSources;

impl SourceFactory for NativeSources {
    fn process_source(&self) -> Box<dyn ProcessSource> {
        Box::new(SysinfoProcessSource::default())
    }

    fn connection_source(&self) -> Box<dyn ConnectionSource> {
        match ProcNetSource::native() {
            Ok(source) => Box::new(source),
            Err(e) => {
                debug!(error = %e, "no native connection source");
                Box::new(UnsupportedConnections)
            }
        }
    }
}

/// On-demand collection targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectTarget {
    Processes,
    System,
    Performance,
    Files,
    Network,
    All,
}

impl CollectTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectTarget::Processes => "processes",
            CollectTarget::System => "system",
            CollectTarget::Performance => "performance",
            CollectTarget::Files => "files",
            CollectTarget::Network => "network",
            CollectTarget::All => "all",
        }
    }
}

impl fmt::Display for CollectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectTarget {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "processes" => Ok(CollectTarget::Processes),
            "system" => Ok(CollectTarget::System),
            "performance" => Ok(CollectTarget::Performance),
            "files" => Ok(CollectTarget::Files),
            "network" => Ok(CollectTarget::Network),
            "all" => Ok(CollectTarget::All),
            _ => Err(AgentError::UnknownTarget(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: &'static str,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Every task finished before the deadline
    pub clean: bool,
    pub elapsed: Duration,
    pub dropped: Vec<QueueStats>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub running: bool,
    pub known_processes: usize,
    pub cached_paths: usize,
    pub tracked_connections: usize,
    pub queues: Vec<QueueStats>,
}

#[derive(Clone, Default)]
struct Observers {
    process: Option<Arc<ProcessObserver>>,
    file: Option<Arc<FileObserver>>,
    network: Option<Arc<NetworkObserver>>,
    counters: Vec<DropCounter>,
}

impl Observers {
    fn queue_stats(&self) -> Vec<QueueStats> {
        self.counters
            .iter()
            .map(|c| QueueStats {
                queue: c.name(),
                dropped: c.get(),
            })
            .collect()
    }
}

struct Running {
    trigger: ShutdownTrigger,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    observers: Observers,
}

/// Persist, then publish. Shared by every consumer loop and by on-demand collection.
#[derive(Clone)]
struct Dispatcher {
    store: Arc<dyn EventRepository>,
    publisher: Arc<dyn Publisher>,
}

impl Dispatcher {
    /// Returns whether the event was persisted. Unpersisted events are never published.
    async fn dispatch<E: TelemetryRecord>(&self, event: E) -> bool {
        let store = Arc::clone(&self.store);
        let outcome = tokio::task::spawn_blocking(move || {
            let result = event.persist(store.as_ref());
            (event, result)
        })
        .await;
        let event = match outcome {
            Ok((event, Ok(()))) => event,
            Ok((event, Err(e))) => {
                error!(category = E::CATEGORY, event_id = %event.id(), error = %e, "failed to persist event");
                return false;
            }
            Err(e) => {
                error!(category = E::CATEGORY, error = %e, "persist task failed");
                return false;
            }
        };

        let topic = topic_for(event.agent_id(), E::CATEGORY);
        let envelope = match Envelope::from_record(&event) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %topic, event_id = %event.id(), error = %e, "failed to build envelope");
                return true;
            }
        };
        if let Err(e) = self.publisher.publish(&topic, &envelope).await {
            warn!(topic = %topic, event_id = %event.id(), error = %e, "failed to publish event");
        }
        true
    }

    async fn dispatch_all<E: TelemetryRecord>(&self, events: Vec<E>) -> usize {
        let mut persisted = 0;
        for event in events {
            if self.dispatch(event).await {
                persisted += 1;
            }
        }
        persisted
    }
}

/// Drain one queue in arrival order until shutdown; whatever is already queued at shutdown is still dispatched
async fn consume<E: TelemetryRecord>(dispatcher: Dispatcher, mut rx: EventReceiver<E>, mut shutdown: Shutdown) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            next = rx.recv() => match next {
                Some(event) => {
                    dispatcher.dispatch(event).await;
                }
                None => return,
            },
        }
    }
    let mut drained = 0usize;
    while let Ok(event) = rx.try_recv() {
        dispatcher.dispatch(event).await;
        drained += 1;
    }
    debug!(category = E::CATEGORY, drained, "consumer stopped");
}

/// Run `tick` every `period`, starting one period from now
async fn every(period: Duration, mut shutdown: Shutdown, mut tick: impl FnMut() + Send) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => tick(),
        }
    }
}

/// First snapshot immediately, then one per `period`
async fn system_snapshots(
    collector: Arc<SystemCollector>,
    agent_id: String,
    tx: EventSender<SystemInfo>,
    period: Duration,
    mut shutdown: Shutdown,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {
                let collector = Arc::clone(&collector);
                let id = agent_id.clone();
                match tokio::task::spawn_blocking(move || collector.collect(&id)).await {
                    Ok(info) => {
                        tx.push(info);
                    }
                    Err(e) => warn!(error = %e, "system snapshot failed"),
                }
            }
        }
    }
}

pub struct Orchestrator {
    config: AgentConfig,
    dispatcher: Dispatcher,
    sources: Arc<dyn SourceFactory>,
    system: Arc<SystemCollector>,
    state: Mutex<Option<Running>>,
    /// Set by stop(); the store and publisher are gone for good
    closed: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: AgentConfig, store: Arc<dyn EventRepository>, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            config,
            dispatcher: Dispatcher { store, publisher },
            sources: Arc::new(NativeSources),
            system: Arc::new(SystemCollector::new()),
            state: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_sources(mut self, sources: Arc<dyn SourceFactory>) -> Self {
        self.sources = sources;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<Running>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().is_some()
    }

    fn ensure_open(&self) -> Result<(), AgentError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AgentError::Closed);
        }
        Ok(())
    }

    /// Launch every enabled observer with its consumer. Must be called within a Tokio runtime.
    /// An orchestrator that has been stopped cannot be started again.
    pub fn start(&self) -> Result<(), AgentError> {
        let mut state = self.lock_state();
        if state.is_some() {
            return Err(AgentError::AlreadyRunning);
        }
        self.ensure_open()?;

        let (trigger, shutdown) = shutdown_channel();
        let cfg = &self.config.collectors;
        let agent_id = self.config.agent.id.clone();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
        let mut observers = Observers::default();

        if cfg.process.enabled {
            let (tx, rx) = event_queue::<ProcessEvent>("process", cfg.queue_capacity);
            observers.counters.push(tx.drop_counter());
            let observer = Arc::new(ProcessObserver::new(
                agent_id.clone(),
                self.sources.process_source(),
                cfg.process.hash_limit_bytes,
                tx,
            ));
            let period = Duration::from_millis(cfg.process.poll_interval_ms.max(1));
            tasks.push(("process-consumer", tokio::spawn(consume(self.dispatcher.clone(), rx, shutdown.clone()))));
            tasks.push(("process-observer", tokio::spawn(Arc::clone(&observer).run(period, shutdown.clone()))));
            observers.process = Some(observer);
        }

        if cfg.file.enabled {
            let (tx, rx) = event_queue::<FileEvent>("file", cfg.queue_capacity);
            observers.counters.push(tx.drop_counter());
            let observer = Arc::new(FileObserver::new(agent_id.clone(), &cfg.file, tx));
            tasks.push(("file-consumer", tokio::spawn(consume(self.dispatcher.clone(), rx, shutdown.clone()))));
            tasks.push(("file-observer", tokio::spawn(Arc::clone(&observer).run(shutdown.clone()))));
            let evicting = Arc::clone(&observer);
            tasks.push((
                "file-eviction",
                tokio::spawn(every(
                    Duration::from_secs(cfg.file.eviction_interval_secs.max(1)),
                    shutdown.clone(),
                    move || {
                        let n = evicting.evict(Utc::now());
                        if n > 0 {
                            debug!(evicted = n, "file cache eviction");
                        }
                    },
                )),
            ));
            observers.file = Some(observer);
        }

        if cfg.network.enabled {
            let (tx, rx) = event_queue::<NetworkEvent>("network", cfg.queue_capacity);
            observers.counters.push(tx.drop_counter());
            let observer = Arc::new(NetworkObserver::new(
                agent_id.clone(),
                self.sources.connection_source(),
                &cfg.network,
                tx,
            ));
            tasks.push(("network-consumer", tokio::spawn(consume(self.dispatcher.clone(), rx, shutdown.clone()))));
            tasks.push(("network-observer", tokio::spawn(Arc::clone(&observer).run(shutdown.clone()))));
            let evicting = Arc::clone(&observer);
            tasks.push((
                "network-eviction",
                tokio::spawn(every(
                    Duration::from_secs(cfg.network.eviction_interval_secs.max(1)),
                    shutdown.clone(),
                    move || {
                        let n = evicting.evict(Utc::now());
                        if n > 0 {
                            debug!(evicted = n, "connection cache eviction");
                        }
                    },
                )),
            ));
            observers.network = Some(observer);
        }

        if cfg.system.enabled {
            let (tx, rx) = event_queue::<SystemInfo>("system", cfg.queue_capacity);
            observers.counters.push(tx.drop_counter());
            tasks.push(("system-consumer", tokio::spawn(consume(self.dispatcher.clone(), rx, shutdown.clone()))));
            tasks.push((
                "system-snapshot",
                tokio::spawn(system_snapshots(
                    Arc::clone(&self.system),
                    agent_id.clone(),
                    tx,
                    Duration::from_secs(cfg.system.interval_secs.max(1)),
                    shutdown.clone(),
                )),
            ));
        }

        info!(agent_id = %agent_id, tasks = tasks.len(), "telemetry pipeline started");
        *state = Some(Running {
            trigger,
            tasks,
            observers,
        });
        Ok(())
    }

    /// Signal every task, wait up to the configured deadline, then close the bus and store.
    /// Tasks still running at the deadline are aborted and the report is marked unclean.
    /// Afterwards `start` and `collect_now` fail with `AgentError::Closed`.
    pub async fn stop(&self) -> Result<ShutdownReport, AgentError> {
        let Running {
            trigger,
            tasks,
            observers,
        } = self.lock_state().take().ok_or(AgentError::NotRunning)?;
        self.closed.store(true, Ordering::Release);
        let began = Instant::now();
        let deadline = self.config.shutdown_timeout();
        trigger.trigger();

        let aborts: Vec<_> = tasks.iter().map(|(_, h)| h.abort_handle()).collect();
        let join = async move {
            for (name, handle) in tasks {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        error!(task = name, "background task panicked");
                    }
                }
            }
        };
        let clean = match tokio::time::timeout(deadline, join).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    timeout_ms = deadline.as_millis() as u64,
                    "shutdown deadline elapsed, proceeding with unfinished tasks"
                );
                for handle in aborts {
                    handle.abort();
                }
                false
            }
        };

        if let Err(e) = self.dispatcher.publisher.close().await {
            warn!(error = %e, "failed to close publisher");
        }
        if let Err(e) = self.dispatcher.store.close() {
            warn!(error = %e, "failed to close event store");
        }

        let report = ShutdownReport {
            clean,
            elapsed: began.elapsed(),
            dropped: observers.queue_stats(),
        };
        info!(
            clean = report.clean,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "telemetry pipeline stopped"
        );
        Ok(report)
    }

    pub fn stats(&self) -> PipelineStats {
        let state = self.lock_state();
        let Some(running) = state.as_ref() else {
            return PipelineStats::default();
        };
        let obs = &running.observers;
        PipelineStats {
            running: true,
            known_processes: obs.process.as_ref().map_or(0, |p| p.known_count()),
            cached_paths: obs.file.as_ref().map_or(0, |f| f.cached_paths()),
            tracked_connections: obs.network.as_ref().map_or(0, |n| n.tracked_connections()),
            queues: obs.queue_stats(),
        }
    }

    fn running_observers(&self) -> Observers {
        self.lock_state()
            .as_ref()
            .map(|r| r.observers.clone())
            .unwrap_or_default()
    }

    /// One immediate collection, persisted and published like live events.
    /// Uses the running observers when present so their dedup state applies.
    /// Returns the number of events persisted.
    pub async fn collect_now(&self, target: CollectTarget) -> Result<usize, AgentError> {
        self.ensure_open()?;
        if target == CollectTarget::All {
            let mut total = 0;
            for t in [
                CollectTarget::Processes,
                CollectTarget::System,
                CollectTarget::Performance,
                CollectTarget::Files,
                CollectTarget::Network,
            ] {
                match self.collect_one(t).await {
                    Ok(n) => total += n,
                    Err(e) => warn!(target = t.as_str(), error = %e, "on-demand collection failed"),
                }
            }
            return Ok(total);
        }
        self.collect_one(target).await
    }

    async fn collect_one(&self, target: CollectTarget) -> Result<usize, AgentError> {
        let agent_id = self.config.agent.id.clone();
        let cfg = &self.config.collectors;
        let observers = self.running_observers();
        let task_err = |e: tokio::task::JoinError| AgentError::Task(e.to_string());

        let persisted = match target {
            CollectTarget::Processes => {
                let observer = observers.process.unwrap_or_else(|| {
                    let (tx, _) = event_queue("process-adhoc", 1);
                    Arc::new(ProcessObserver::new(
                        agent_id.clone(),
                        self.sources.process_source(),
                        cfg.process.hash_limit_bytes,
                        tx,
                    ))
                });
                let events = tokio::task::spawn_blocking(move || observer.snapshot_all(Utc::now()))
                    .await
                    .map_err(task_err)??;
                self.dispatcher.dispatch_all(events).await
            }
            CollectTarget::Files => {
                let observer = observers.file.unwrap_or_else(|| {
                    let (tx, _) = event_queue("file-adhoc", 1);
                    Arc::new(FileObserver::new(agent_id.clone(), &cfg.file, tx))
                });
                let events = tokio::task::spawn_blocking(move || observer.scan(Utc::now()))
                    .await
                    .map_err(task_err)?;
                self.dispatcher.dispatch_all(events).await
            }
            CollectTarget::Network => {
                let observer = observers.network.unwrap_or_else(|| {
                    let (tx, _) = event_queue("network-adhoc", 1);
                    Arc::new(NetworkObserver::new(
                        agent_id.clone(),
                        self.sources.connection_source(),
                        &cfg.network,
                        tx,
                    ))
                });
                let events = tokio::task::spawn_blocking(move || observer.snapshot_all(Utc::now()))
                    .await
                    .map_err(task_err)??;
                self.dispatcher.dispatch_all(events).await
            }
            CollectTarget::System => {
                let collector = Arc::clone(&self.system);
                let info = tokio::task::spawn_blocking(move || collector.collect(&agent_id))
                    .await
                    .map_err(task_err)?;
                usize::from(self.dispatcher.dispatch(info).await)
            }
            CollectTarget::Performance => {
                let collector = Arc::clone(&self.system);
                let sample = tokio::task::spawn_blocking(move || collector.performance(&agent_id))
                    .await
                    .map_err(task_err)?;
                usize::from(self.dispatcher.dispatch(sample).await)
            }
            CollectTarget::All => 0,
        };
        info!(target = target.as_str(), persisted, "on-demand collection complete");
        Ok(persisted)
    }
}
