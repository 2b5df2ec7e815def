//! Endpoint telemetry agent: observes process lifecycle, file activity and network
//! connections, and turns them into typed events that are persisted locally and
//! forwarded to a message bus.
//!
//! Modular structure:
//! - [`collectors`]: event model, observers and their bounded queues
//! - [`orchestrator`]: pipeline lifecycle, consumers, on-demand collection
//! - [`storage`]: encrypted SQLite event store
//! - [`publish`]: bus envelopes and publishers
//! - [`scanner`]: batch indicator matching over stored events
//! - [`logging`]: structured JSON logging

pub mod collectors;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod publish;
pub mod scanner;
pub mod shutdown;
pub mod storage;

pub use config::AgentConfig;
pub use error::{AgentError, CollectError, PublishError, StoreError};
pub use logging::StructuredLogger;
pub use orchestrator::{CollectTarget, Orchestrator, ShutdownReport};
pub use publish::{Envelope, Publisher};
pub use scanner::IndicatorScanner;
pub use storage::{EventRepository, SecureStore};
