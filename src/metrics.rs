//! Engine counters for rounds, bets and settlement health

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct EngineMetrics {
    start_time: Instant,
    rounds_settled: AtomicU64,
    duplicate_settlements: AtomicU64,
    settlement_failures: AtomicU64,
    bets_accepted: AtomicU64,
    bets_rejected: AtomicU64,
    clock_drift_events: AtomicU64,
    total_staked: AtomicU64,
    total_paid_out: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub rounds_settled: u64,
    pub duplicate_settlements: u64,
    pub settlement_failures: u64,
    pub bets_accepted: u64,
    pub bets_rejected: u64,
    pub clock_drift_events: u64,
    pub total_staked: u64,
    pub total_paid_out: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            rounds_settled: AtomicU64::new(0),
            duplicate_settlements: AtomicU64::new(0),
            settlement_failures: AtomicU64::new(0),
            bets_accepted: AtomicU64::new(0),
            bets_rejected: AtomicU64::new(0),
            clock_drift_events: AtomicU64::new(0),
            total_staked: AtomicU64::new(0),
            total_paid_out: AtomicU64::new(0),
        }
    }

    pub fn record_bet_accepted(&self, stake: u64) {
        self.bets_accepted.fetch_add(1, Ordering::SeqCst);
        self.total_staked.fetch_add(stake, Ordering::SeqCst);
    }

    pub fn record_bet_rejected(&self) {
        self.bets_rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_round_settled(&self, paid_out: u64) {
        self.rounds_settled.fetch_add(1, Ordering::SeqCst);
        self.total_paid_out.fetch_add(paid_out, Ordering::SeqCst);
    }

    pub fn record_duplicate_settlement(&self) {
        self.duplicate_settlements.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_settlement_failure(&self) {
        self.settlement_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_clock_drift(&self) {
        self.clock_drift_events.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            rounds_settled: self.rounds_settled.load(Ordering::SeqCst),
            duplicate_settlements: self.duplicate_settlements.load(Ordering::SeqCst),
            settlement_failures: self.settlement_failures.load(Ordering::SeqCst),
            bets_accepted: self.bets_accepted.load(Ordering::SeqCst),
            bets_rejected: self.bets_rejected.load(Ordering::SeqCst),
            clock_drift_events: self.clock_drift_events.load(Ordering::SeqCst),
            total_staked: self.total_staked.load(Ordering::SeqCst),
            total_paid_out: self.total_paid_out.load(Ordering::SeqCst),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
