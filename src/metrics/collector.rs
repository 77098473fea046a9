//! Zero-cost hub metrics using atomic operations.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use crate::session::CloseState;

/// Hub-wide metrics using lock-free atomics
pub struct HubMetrics {
    sessions_opened: AtomicU64,
    sessions_active: AtomicU32,
    sessions_rejected: AtomicU64,
    closes_by_state: [AtomicU64; CloseState::COUNT],
    messages_received: AtomicU64,
    messages_delivered: AtomicU64,
    sends_total: AtomicU64,
    sends_acked: AtomicU64,
    sends_timed_out: AtomicU64,
    start_time: Instant,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self {
            sessions_opened: AtomicU64::new(0),
            sessions_active: AtomicU32::new(0),
            sessions_rejected: AtomicU64::new(0),
            closes_by_state: Default::default(),
            messages_received: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            sends_total: AtomicU64::new(0),
            sends_acked: AtomicU64::new(0),
            sends_timed_out: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record the start of a session
    #[inline]
    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the terminal event of a session
    #[inline]
    pub fn session_closed(&self, state: CloseState, delivered: usize) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
        self.closes_by_state[state as usize].fetch_add(1, Ordering::Relaxed);
        self.messages_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
    }

    /// Record an open request that failed validation
    #[inline]
    pub fn session_rejected(&self) {
        self.sessions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_received(&self, count: usize) {
        self.messages_received
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn send_started(&self) {
        self.sends_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn send_acked(&self) {
        self.sends_acked.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn send_timed_out(&self) {
        self.sends_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let closes = |state: CloseState| self.closes_by_state[state as usize].load(Ordering::Relaxed);
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            closed_reconnect: closes(CloseState::Reconnect),
            closed_new_messages: closes(CloseState::NewMessages),
            closed_error: closes(CloseState::Error),
            closed_server_destroyed: closes(CloseState::ServerDestroyed),
            closed_client_abort: closes(CloseState::ClientAbort),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            sends_total: self.sends_total.load(Ordering::Relaxed),
            sends_acked: self.sends_acked.load(Ordering::Relaxed),
            sends_timed_out: self.sends_timed_out.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for HubMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of hub metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_active: u32,
    pub sessions_rejected: u64,
    pub closed_reconnect: u64,
    pub closed_new_messages: u64,
    pub closed_error: u64,
    pub closed_server_destroyed: u64,
    pub closed_client_abort: u64,
    pub messages_received: u64,
    pub messages_delivered: u64,
    pub sends_total: u64,
    pub sends_acked: u64,
    pub sends_timed_out: u64,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// Format as human-readable string
    pub fn to_string_pretty(&self) -> String {
        format!(
            "Sessions: {} opened ({} active, {} rejected)\n\
             Closes: {} reconnect, {} new-messages, {} error, {} destroyed, {} aborted\n\
             Messages: {} received, {} delivered\n\
             Push: {} sent, {} acked, {} timed out\n\
             Uptime: {}s",
            self.sessions_opened,
            self.sessions_active,
            self.sessions_rejected,
            self.closed_reconnect,
            self.closed_new_messages,
            self.closed_error,
            self.closed_server_destroyed,
            self.closed_client_abort,
            self.messages_received,
            self.messages_delivered,
            self.sends_total,
            self.sends_acked,
            self.sends_timed_out,
            self.uptime_seconds,
        )
    }
}
