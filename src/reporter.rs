//! Status reporting abstraction
//!
//! The driver never prints on its own. Operator-facing messages go through a
//! [`StatusReporter`] handed in at construction, so a host can route them to
//! its own log, a console, or nowhere.

use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportLevel {
    Status,
    Warning,
    Error,
}

/// Sink for driver status messages
pub trait StatusReporter: Send {
    fn report(&self, level: ReportLevel, message: &str);

    fn status(&self, message: &str) {
        self.report(ReportLevel::Status, message)
    }

    fn warning(&self, message: &str) {
        self.report(ReportLevel::Warning, message)
    }

    fn error(&self, message: &str) {
        self.report(ReportLevel::Error, message)
    }
}

/// Forwards to `tracing`; the default
#[derive(Debug, Clone, Default)]
pub struct TracingReporter;

impl StatusReporter for TracingReporter {
    fn report(&self, level: ReportLevel, message: &str) {
        match level {
            ReportLevel::Status => info!("{}", message),
            ReportLevel::Warning => warn!("{}", message),
            ReportLevel::Error => error!("{}", message),
        }
    }
}

/// Discards everything
#[derive(Debug, Clone, Default)]
pub struct NoOpReporter;

impl StatusReporter for NoOpReporter {
    fn report(&self, _level: ReportLevel, _message: &str) {}
}

/// One status line as written by [`ConsoleReporter`]
#[derive(Debug, Clone, Serialize)]
pub struct StatusMessage {
    /// Unix time (s)
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub level: ReportLevel,
    pub message: String,
}

impl StatusMessage {
    pub fn new(level: ReportLevel, message: &str) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "status".to_string(),
            level,
            message: message.to_string(),
        }
    }
}

/// Current Unix time in seconds, millisecond resolution
pub fn current_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Prints JSON lines to stdout
#[derive(Debug, Clone, Default)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    pub fn new() -> Self {
        Self
    }

    pub fn format(&self, message: &StatusMessage) -> crate::Result<String> {
        Ok(serde_json::to_string(message)?)
    }
}

impl StatusReporter for ConsoleReporter {
    fn report(&self, level: ReportLevel, message: &str) {
        match self.format(&StatusMessage::new(level, message)) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!("Failed to format status message: {}", e),
        }
    }
}
