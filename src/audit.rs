//! Structured JSONL audit logging for admission decisions.

use serde::Serialize;
use std::net::IpAddr;
use std::path::Path;

/// Event type for an audit entry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    RequestAllowed,
    RequestBlocked,
    AuthFailed,
}

/// Decision outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Allowed,
    Blocked,
}

/// Reason for the decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditReason {
    Admitted,
    InstanceNotFound,
    InboundDenied,
    OutboundDenied,
    AuthFailed,
    BadTarget,
}

/// A single audit log entry.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub event: AuditEvent,
    pub instance: String,
    pub client_ip: IpAddr,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub decision: AuditDecision,
    pub reason: AuditReason,
}

/// Returns the current UTC time as an ISO 8601 / RFC 3339 string.
pub fn now_iso8601() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Audit logger that writes JSONL entries to a file.
///
/// Uses `std::fs::File` with a `std::sync::Mutex` since writes are small
/// and fast, avoiding the need for tokio's `fs` feature.
pub struct AuditLogger {
    writer: std::sync::Mutex<std::io::BufWriter<std::fs::File>>,
}

impl AuditLogger {
    /// Open (or create) the audit log file in append mode.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: std::sync::Mutex::new(std::io::BufWriter::new(file)),
        })
    }

    /// Write an audit entry as a JSON line. Errors are logged but never propagated.
    pub fn log(&self, entry: &AuditEntry) {
        use std::io::Write;
        let json = match serde_json::to_string(entry) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize audit entry");
                return;
            }
        };
        let mut writer = self.writer.lock().unwrap();
        if let Err(e) = writeln!(writer, "{}", json) {
            tracing::warn!(error = %e, "Failed to write audit entry");
        }
        let _ = writer.flush();
    }
}

impl AuditEntry {
    /// Entry for an admitted request.
    pub fn allowed(instance: &str, client_ip: IpAddr, method: &str, url: &str) -> Self {
        Self {
            timestamp: now_iso8601(),
            event: AuditEvent::RequestAllowed,
            instance: instance.to_string(),
            client_ip,
            method: method.to_string(),
            url: Some(url.to_string()),
            decision: AuditDecision::Allowed,
            reason: AuditReason::Admitted,
        }
    }

    /// Entry for a blocked request.
    pub fn blocked(
        instance: &str,
        client_ip: IpAddr,
        method: &str,
        url: Option<&str>,
        reason: AuditReason,
    ) -> Self {
        let event = match reason {
            AuditReason::AuthFailed => AuditEvent::AuthFailed,
            _ => AuditEvent::RequestBlocked,
        };
        Self {
            timestamp: now_iso8601(),
            event,
            instance: instance.to_string(),
            client_ip,
            method: method.to_string(),
            url: url.map(str::to_string),
            decision: AuditDecision::Blocked,
            reason,
        }
    }
}
