//! Process-wide counters for the connection core.
//! Cheap relaxed atomics; hosts read them through [`snapshot`].
use std::sync::atomic::{AtomicU64, Ordering};

static CONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static CONNECT_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static CONNECTIONS_ABANDONED: AtomicU64 = AtomicU64::new(0);
static HANDSHAKES_COMPLETED: AtomicU64 = AtomicU64::new(0);
static DECODE_FAILURES: AtomicU64 = AtomicU64::new(0);
static PERSISTENCE_FAILURES: AtomicU64 = AtomicU64::new(0);
static ADMIN_SENT: AtomicU64 = AtomicU64::new(0);
static ADMIN_RESOLVED: AtomicU64 = AtomicU64::new(0);
static ADMIN_EXPIRED: AtomicU64 = AtomicU64::new(0);
static PACKETS_DISPATCHED: AtomicU64 = AtomicU64::new(0);
static PACKETS_UNHANDLED: AtomicU64 = AtomicU64::new(0);

pub fn inc_connect_attempts() {
    CONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connect_timeouts() {
    CONNECT_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connections_abandoned() {
    CONNECTIONS_ABANDONED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_handshakes_completed() {
    HANDSHAKES_COMPLETED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_decode_failures() {
    DECODE_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_persistence_failures() {
    PERSISTENCE_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_admin_sent() {
    ADMIN_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_admin_resolved() {
    ADMIN_RESOLVED.fetch_add(1, Ordering::Relaxed);
}
pub fn add_admin_expired(n: u64) {
    ADMIN_EXPIRED.fetch_add(n, Ordering::Relaxed);
}
pub fn inc_packets_dispatched() {
    PACKETS_DISPATCHED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_packets_unhandled() {
    PACKETS_UNHANDLED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub connect_attempts: u64,
    pub connect_timeouts: u64,
    pub connections_abandoned: u64,
    pub handshakes_completed: u64,
    pub decode_failures: u64,
    pub persistence_failures: u64,
    pub admin_sent: u64,
    pub admin_resolved: u64,
    pub admin_expired: u64,
    pub packets_dispatched: u64,
    pub packets_unhandled: u64,
}

impl Snapshot {
    /// Admin requests neither resolved nor expired yet.
    pub fn admin_outstanding(&self) -> u64 {
        self.admin_sent
            .saturating_sub(self.admin_resolved)
            .saturating_sub(self.admin_expired)
    }
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        connect_attempts: CONNECT_ATTEMPTS.load(Ordering::Relaxed),
        connect_timeouts: CONNECT_TIMEOUTS.load(Ordering::Relaxed),
        connections_abandoned: CONNECTIONS_ABANDONED.load(Ordering::Relaxed),
        handshakes_completed: HANDSHAKES_COMPLETED.load(Ordering::Relaxed),
        decode_failures: DECODE_FAILURES.load(Ordering::Relaxed),
        persistence_failures: PERSISTENCE_FAILURES.load(Ordering::Relaxed),
        admin_sent: ADMIN_SENT.load(Ordering::Relaxed),
        admin_resolved: ADMIN_RESOLVED.load(Ordering::Relaxed),
        admin_expired: ADMIN_EXPIRED.load(Ordering::Relaxed),
        packets_dispatched: PACKETS_DISPATCHED.load(Ordering::Relaxed),
        packets_unhandled: PACKETS_UNHANDLED.load(Ordering::Relaxed),
    }
}
