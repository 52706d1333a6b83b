//! In-process delivery and link counters.
//! Read through [`snapshot`]; logged when the client shuts down.
use std::sync::atomic::{AtomicU64, Ordering};

static DIRECT_SENT: AtomicU64 = AtomicU64::new(0);
static DIRECT_ACKED: AtomicU64 = AtomicU64::new(0);
static DIRECT_FAILED: AtomicU64 = AtomicU64::new(0);
static DIRECT_RETRIES: AtomicU64 = AtomicU64::new(0);
static CHANNEL_SENT: AtomicU64 = AtomicU64::new(0);
static CHANNEL_FAILED: AtomicU64 = AtomicU64::new(0);
static ACK_RTT_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ACK_RTT_COUNT: AtomicU64 = AtomicU64::new(0);
static DUPLICATES_REJECTED: AtomicU64 = AtomicU64::new(0);
static RECONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static INBOUND_RECEIVED: AtomicU64 = AtomicU64::new(0);

pub fn inc_direct_sent() {
    DIRECT_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_direct_acked() {
    DIRECT_ACKED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_direct_failed() {
    DIRECT_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_direct_retries() {
    DIRECT_RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_channel_sent() {
    CHANNEL_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_channel_failed() {
    CHANNEL_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_duplicates_rejected() {
    DUPLICATES_REJECTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnect_attempts() {
    RECONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_inbound_received() {
    INBOUND_RECEIVED.fetch_add(1, Ordering::Relaxed);
}

/// Round trip as reported by the device with the ack.
pub fn observe_ack_round_trip(ms: u64) {
    ACK_RTT_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    ACK_RTT_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub direct_sent: u64,
    pub direct_acked: u64,
    pub direct_failed: u64,
    pub direct_retries: u64,
    pub channel_sent: u64,
    pub channel_failed: u64,
    pub ack_round_trip_avg_ms: Option<u64>,
    pub duplicates_rejected: u64,
    pub reconnect_attempts: u64,
    pub inbound_received: u64,
}

pub fn snapshot() -> Snapshot {
    let sum = ACK_RTT_SUM_MS.load(Ordering::Relaxed);
    let count = ACK_RTT_COUNT.load(Ordering::Relaxed);
    Snapshot {
        direct_sent: DIRECT_SENT.load(Ordering::Relaxed),
        direct_acked: DIRECT_ACKED.load(Ordering::Relaxed),
        direct_failed: DIRECT_FAILED.load(Ordering::Relaxed),
        direct_retries: DIRECT_RETRIES.load(Ordering::Relaxed),
        channel_sent: CHANNEL_SENT.load(Ordering::Relaxed),
        channel_failed: CHANNEL_FAILED.load(Ordering::Relaxed),
        ack_round_trip_avg_ms: if count > 0 { Some(sum / count) } else { None },
        duplicates_rejected: DUPLICATES_REJECTED.load(Ordering::Relaxed),
        reconnect_attempts: RECONNECT_ATTEMPTS.load(Ordering::Relaxed),
        inbound_received: INBOUND_RECEIVED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are process-global and other tests bump them concurrently,
    // so only monotonic growth is asserted.
    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        inc_direct_sent();
        inc_direct_retries();
        observe_ack_round_trip(1200);
        let after = snapshot();
        assert!(after.direct_sent > before.direct_sent);
        assert!(after.direct_retries > before.direct_retries);
        assert!(after.ack_round_trip_avg_ms.is_some());
    }
}
