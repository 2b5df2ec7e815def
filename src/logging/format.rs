//! Log output: tracing subscriber setup plus single ndjson lines for CLI summaries.

use serde::Serialize;
use std::io::Write;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// One CLI result line
#[derive(Debug, Serialize)]
pub struct SummaryLine<'a, T: Serialize> {
    pub ts: String,
    pub agent_id: &'a str,
    pub command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<&'a str>,
    pub result: T,
}

impl<'a, T: Serialize> SummaryLine<'a, T> {
    pub fn new(agent_id: &'a str, command: &'a str, result: T) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            agent_id,
            command,
            target: None,
            result,
        }
    }

    pub fn with_target(mut self, target: &'a str) -> Self {
        self.target = Some(target);
        self
    }
}

pub struct StructuredLogger;

impl StructuredLogger {
    /// Install the global subscriber on stderr; `RUST_LOG` overrides `default_level`.
    /// A second call is a no-op.
    pub fn init(json: bool, default_level: &str) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        let result = if json {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_span_events(FmtSpan::NONE)
                        .with_writer(std::io::stderr),
                )
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
        };
        if result.is_err() {
            tracing::debug!("tracing subscriber already installed");
        }
    }

    /// Write one JSON object as a line, bypassing tracing
    pub fn emit_json(value: &impl Serialize, w: &mut impl Write) -> std::io::Result<()> {
        let line = serde_json::to_string(value).map_err(std::io::Error::from)?;
        writeln!(w, "{}", line)
    }
}
