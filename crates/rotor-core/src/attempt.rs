use std::net::IpAddr;
use std::time::Duration;

use tracing::{info, warn};

/// One row of the per-attempt audit trail: which key was tried for which
/// request, how it ended, and how long it took.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub trace_id: String,
    pub caller_ip: Option<IpAddr>,
    pub access_key_id: Option<i64>,
    pub credential_id: i64,
    pub model: String,
    pub stream: bool,
    /// 200 on success, otherwise the classified status of the failure.
    pub status: u16,
    pub elapsed: Duration,
    pub error: Option<String>,
}

/// Attempt records are emitted fire-and-forget; implementations must not
/// block the request path and their failures never propagate.
pub trait AttemptSink: Send + Sync {
    fn record(&self, record: AttemptRecord);
}

/// Default sink: one structured log line per attempt.
#[derive(Debug, Default)]
pub struct TracingAttemptSink;

impl AttemptSink for TracingAttemptSink {
    fn record(&self, record: AttemptRecord) {
        if record.error.is_none() {
            info!(
                event = "attempt",
                trace_id = %record.trace_id,
                caller_ip = record.caller_ip.map(tracing::field::display),
                access_key_id = record.access_key_id,
                credential_id = record.credential_id,
                model = %record.model,
                stream = record.stream,
                status = record.status,
                elapsed_ms = record.elapsed.as_millis() as u64,
            );
        } else {
            warn!(
                event = "attempt",
                trace_id = %record.trace_id,
                caller_ip = record.caller_ip.map(tracing::field::display),
                access_key_id = record.access_key_id,
                credential_id = record.credential_id,
                model = %record.model,
                stream = record.stream,
                status = record.status,
                elapsed_ms = record.elapsed.as_millis() as u64,
                error = record.error.as_deref().unwrap_or(""),
            );
        }
    }
}
