//! Orchestrator lifecycle, persist-then-publish ordering and the shutdown deadline.

mod common;

use common::{eventually, proc, tcp, RecordingPublisher, RecordingStore, ScriptedSources};
use endpoint_agent::config::AgentConfig;
use endpoint_agent::error::AgentError;
use endpoint_agent::orchestrator::{CollectTarget, Orchestrator};
use endpoint_agent::publish::Publisher;
use endpoint_agent::storage::EventRepository;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_config(shutdown_timeout_ms: u64) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.agent.id = "test-agent".to_string();
    config.shutdown_timeout_ms = shutdown_timeout_ms;
    config.collectors.process.poll_interval_ms = 20;
    config.collectors.network.poll_interval_ms = 20;
    config.collectors.network.samples = 1;
    config.collectors.network.sample_delay_ms = 0;
    // no real directories or host sampling in these tests
    config.collectors.file.enabled = false;
    config.collectors.system.enabled = false;
    config
}

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<RecordingStore>,
    publisher: Arc<RecordingPublisher>,
    sources: ScriptedSources,
}

fn harness(config: AgentConfig) -> Harness {
    let store = Arc::new(RecordingStore::default());
    let publisher = Arc::new(RecordingPublisher::default());
    let sources = ScriptedSources::default();
    sources.processes.add(proc(1, "init"));
    sources.processes.add(proc(2, "sshd"));
    let repo: Arc<dyn EventRepository> = store.clone();
    let bus: Arc<dyn Publisher> = publisher.clone();
    let orchestrator = Orchestrator::new(config, repo, bus).with_sources(Arc::new(sources.clone()));
    Harness {
        orchestrator,
        store,
        publisher,
        sources,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lifecycle_misuse_is_reported() {
    let h = harness(test_config(2_000));
    assert!(!h.orchestrator.is_running());
    assert!(matches!(h.orchestrator.stop().await, Err(AgentError::NotRunning)));

    h.orchestrator.start().unwrap();
    assert!(h.orchestrator.is_running());
    assert!(matches!(h.orchestrator.start(), Err(AgentError::AlreadyRunning)));

    let report = h.orchestrator.stop().await.unwrap();
    assert!(report.clean);
    assert!(!h.orchestrator.is_running());
    assert!(matches!(h.orchestrator.stop().await, Err(AgentError::NotRunning)));
    assert!(h.store.closed.load(Ordering::SeqCst));
    assert!(h.publisher.closed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_orchestrator_refuses_to_restart() {
    let h = harness(test_config(2_000));
    h.orchestrator.start().unwrap();
    assert!(h.orchestrator.stop().await.unwrap().clean);

    assert!(matches!(h.orchestrator.start(), Err(AgentError::Closed)));
    assert!(!h.orchestrator.is_running());
    assert!(matches!(
        h.orchestrator.collect_now(CollectTarget::Processes).await,
        Err(AgentError::Closed)
    ));

    h.sources.processes.add(proc(9, "late"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.store.count(), 0);
    assert_eq!(h.publisher.count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observed_events_are_persisted_then_published() {
    let h = harness(test_config(2_000));
    h.sources.connections.set(vec![tcp(5000, "93.184.216.34", 443, 2)]);
    h.orchestrator.start().unwrap();

    assert!(eventually(Duration::from_secs(3), || h.orchestrator.stats().known_processes == 2).await);
    h.sources.processes.add(proc(3, "curl"));
    h.sources.processes.remove(1);

    assert!(eventually(Duration::from_secs(3), || h.store.ids("process").len() == 2).await);
    assert!(eventually(Duration::from_secs(3), || h.store.ids("network").len() == 1).await);
    assert!(eventually(Duration::from_secs(3), || h.publisher.count() == 3).await);

    let topics = h.publisher.topics();
    assert_eq!(
        topics.iter().filter(|t| *t == "events.raw.test-agent.process").count(),
        2
    );
    assert!(topics.contains(&"events.raw.test-agent.network".to_string()));

    let persisted = h.store.ids("process");
    let published: Vec<String> = h
        .publisher
        .published
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, env)| env.event_type == "process")
        .map(|(_, env)| env.event_id.clone())
        .collect();
    assert_eq!(published, persisted);

    let stats = h.orchestrator.stats();
    assert!(stats.running);
    assert_eq!(stats.known_processes, 2);
    assert_eq!(stats.tracked_connections, 1);
    assert!(stats.queues.iter().all(|q| q.dropped == 0));

    let report = h.orchestrator.stop().await.unwrap();
    assert!(report.clean);
    assert_eq!(report.dropped.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_failure_does_not_stop_the_consumer() {
    let h = harness(test_config(2_000));
    h.publisher.failing.store(true, Ordering::SeqCst);
    h.orchestrator.start().unwrap();
    assert!(eventually(Duration::from_secs(3), || h.orchestrator.stats().known_processes == 2).await);

    h.sources.processes.add(proc(3, "a"));
    assert!(eventually(Duration::from_secs(3), || h.store.ids("process").len() == 1).await);
    h.sources.processes.add(proc(4, "b"));
    assert!(eventually(Duration::from_secs(3), || h.store.ids("process").len() == 2).await);
    assert_eq!(h.publisher.count(), 0);

    assert!(h.orchestrator.stop().await.unwrap().clean);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_meets_the_deadline_when_tasks_yield() {
    let h = harness(test_config(10_000));
    h.orchestrator.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let began = Instant::now();
    let report = h.orchestrator.stop().await.unwrap();
    assert!(report.clean);
    assert!(began.elapsed() < Duration::from_secs(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_proceeds_when_a_consumer_hangs() {
    let h = harness(test_config(300));
    h.publisher.hang.store(true, Ordering::SeqCst);
    h.orchestrator.start().unwrap();
    assert!(eventually(Duration::from_secs(3), || h.orchestrator.stats().known_processes == 2).await);

    h.sources.processes.add(proc(3, "stuck"));
    // persisted means the consumer is now blocked in publish
    assert!(eventually(Duration::from_secs(3), || h.store.ids("process").len() == 1).await);

    let began = Instant::now();
    let report = h.orchestrator.stop().await.unwrap();
    assert!(!report.clean);
    assert!(began.elapsed() >= Duration::from_millis(300));
    assert!(began.elapsed() < Duration::from_secs(5));
    assert!(!h.orchestrator.is_running());
    assert!(h.store.closed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn collect_now_without_running_pipeline() {
    let h = harness(test_config(2_000));
    h.sources.connections.set(vec![
        tcp(5000, "93.184.216.34", 443, 2),
        tcp(5001, "1.2.3.4", 22, 2),
    ]);

    assert_eq!(h.orchestrator.collect_now(CollectTarget::Processes).await.unwrap(), 2);
    assert_eq!(h.orchestrator.collect_now(CollectTarget::Network).await.unwrap(), 2);
    assert_eq!(h.store.ids("process").len(), 2);
    assert_eq!(h.publisher.count(), 4);
    assert!(!h.orchestrator.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persist_failure_skips_publish() {
    let h = harness(test_config(2_000));
    h.store.failing.store(true, Ordering::SeqCst);
    assert_eq!(h.orchestrator.collect_now(CollectTarget::Processes).await.unwrap(), 0);
    assert_eq!(h.publisher.count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn collect_all_tolerates_failing_targets() {
    let watched = tempfile::tempdir().unwrap();
    let mut config = test_config(2_000);
    config.collectors.file.watch_dirs = vec![watched.path().to_path_buf()];
    let h = harness(config);
    h.sources.connections.failing.store(true, Ordering::SeqCst);
    let n = h.orchestrator.collect_now(CollectTarget::All).await.unwrap();
    // processes, system info and one performance sample; no files; network failed
    assert_eq!(n, 4);
    assert_eq!(h.store.ids("system").len(), 1);
    assert_eq!(h.store.ids("performance").len(), 1);
    assert!(h.store.ids("network").is_empty());
}
