//! Structured logging setup.

mod format;

pub use format::{StructuredLogger, SummaryLine};
