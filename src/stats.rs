//! Read-only observability snapshot.
//!
//! Counters that must outlive a single channel (channel failures) live in
//! [`TunnelMetrics`], which is shared by every channel a process creates.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::session::{Role, SessionState};

/// Process-wide counters, shared as `Arc<TunnelMetrics>`.
#[derive(Debug, Default)]
pub struct TunnelMetrics {
    channel_failures: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_accepted: AtomicU64,
}

impl TunnelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_failures(&self) -> u64 {
        self.channel_failures.load(Ordering::Relaxed)
    }

    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn sessions_accepted(&self) -> u64 {
        self.sessions_accepted.load(Ordering::Relaxed)
    }

    pub(crate) fn record_channel_failure(&self) {
        self.channel_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accepted(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: u32,
    pub state: SessionState,
    pub destination: Option<String>,
    pub locally_initiated: bool,
    pub age_ms: u64,
    pub idle_ms: u64,
    /// Received bytes not yet read by the consumer.
    pub inbound_bytes: usize,
    /// Sent bytes not yet written to the channel.
    pub outbound_backlog: usize,
}

/// Snapshot of a channel and its sessions.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStats {
    pub role: Role,
    pub channel_alive: bool,
    pub live_sessions: usize,
    pub channel_failures: u64,
    pub sessions_opened: u64,
    pub sessions_accepted: u64,
    pub sessions: Vec<SessionSnapshot>,
}

impl TunnelStats {
    /// Render as JSON, for logs and debug endpoints.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_accumulate() {
        let metrics = TunnelMetrics::new();
        metrics.record_channel_failure();
        metrics.record_channel_failure();
        metrics.record_opened();
        assert_eq!(metrics.channel_failures(), 2);
        assert_eq!(metrics.sessions_opened(), 1);
        assert_eq!(metrics.sessions_accepted(), 0);
    }

    #[test]
    fn test_stats_json_shape() {
        let stats = TunnelStats {
            role: Role::Enclave,
            channel_alive: true,
            live_sessions: 1,
            channel_failures: 0,
            sessions_opened: 1,
            sessions_accepted: 0,
            sessions: vec![SessionSnapshot {
                id: 1,
                state: SessionState::LocalClosing,
                destination: Some("example.org:443".into()),
                locally_initiated: true,
                age_ms: 12,
                idle_ms: 3,
                inbound_bytes: 0,
                outbound_backlog: 0,
            }],
        };
        let value: serde_json::Value = serde_json::from_str(&stats.to_json().unwrap()).unwrap();
        assert_eq!(value["role"], "enclave");
        assert_eq!(value["live_sessions"], 1);
        assert_eq!(value["sessions"][0]["state"], "local_closing");
        assert_eq!(value["sessions"][0]["age_ms"], 12);
    }
}
