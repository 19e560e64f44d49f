//! Settlement of a closed round
//!
//! Resolution is pure: `PayoutTable::resolve` turns bets plus an outcome into
//! settlement records and per-user credit totals. `SettlementEngine` then
//! commits those through the store in one atomic call and publishes the
//! results. A round whose outcome is already persisted is never paid again.

use crate::config::PayoutConfig;
use crate::errors::{SettlementError, StorageError};
use crate::games::types::{Amount, Bet, BetSelection, Outcome, RoundId, SettlementRecord, UserId};
use crate::metrics::EngineMetrics;
use crate::notifications::{GameEvent, NotificationSink};
use crate::storage::{bounded, CommitStatus, SettlementCommit, Store};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BPS_DENOMINATOR: u128 = 10_000;

/// Multipliers and fee used to price winning bets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutTable {
    pub number_multiplier: u64,
    pub color_multiplier: u64,
    pub size_multiplier: u64,
    pub house_fee_bps: u64,
}

impl From<&PayoutConfig> for PayoutTable {
    fn from(config: &PayoutConfig) -> Self {
        Self {
            number_multiplier: config.number_multiplier,
            color_multiplier: config.color_multiplier,
            size_multiplier: config.size_multiplier,
            house_fee_bps: config.house_fee_bps,
        }
    }
}

impl Default for PayoutTable {
    fn default() -> Self {
        Self::from(&PayoutConfig::default())
    }
}

impl PayoutTable {
    pub fn multiplier(&self, selection: &BetSelection) -> u64 {
        match selection {
            BetSelection::Number(_) => self.number_multiplier,
            BetSelection::Color(_) => self.color_multiplier,
            BetSelection::Size(_) => self.size_multiplier,
        }
    }

    /// Payout before the house fee
    pub fn gross(&self, bet: &Bet) -> u128 {
        bet.stake as u128 * self.multiplier(&bet.selection) as u128
    }

    /// Net payout for `bet` against `outcome`; zero for a losing bet.
    /// Rounds down to the nearest minor unit.
    pub fn payout(&self, bet: &Bet, outcome: &Outcome) -> Amount {
        if !bet.selection.wins(outcome) {
            return 0;
        }
        let fee_factor = BPS_DENOMINATOR - self.house_fee_bps.min(10_000) as u128;
        let net = self.gross(bet) * fee_factor / BPS_DENOMINATOR;
        net.min(Amount::MAX as u128) as Amount
    }

    /// Price every bet and total the credits per bettor
    pub fn resolve(&self, bets: &[Bet], outcome: &Outcome) -> Resolution {
        let settled_at = Utc::now();
        let mut records = Vec::with_capacity(bets.len());
        let mut credits: BTreeMap<UserId, Amount> = BTreeMap::new();

        for bet in bets {
            let payout = self.payout(bet, outcome);
            let total = credits.entry(bet.user_id.clone()).or_insert(0);
            *total = total.saturating_add(payout);

            records.push(SettlementRecord {
                bet: bet.clone(),
                outcome_round_id: outcome.round_id,
                outcome_number: outcome.number,
                win: bet.selection.wins(outcome),
                payout,
                settled_at,
            });
        }

        Resolution { records, credits }
    }
}

/// Pure result of pricing a round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub records: Vec<SettlementRecord>,
    pub credits: BTreeMap<UserId, Amount>,
}

impl Resolution {
    pub fn total_payout(&self) -> Amount {
        self.credits.values().fold(0, |acc, c| acc.saturating_add(*c))
    }

    pub fn winners(&self) -> usize {
        self.records.iter().filter(|r| r.win).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementSummary {
    pub round_id: RoundId,
    pub outcome: Outcome,
    pub bets_settled: usize,
    pub winners: usize,
    pub total_staked: Amount,
    pub total_payout: Amount,
    /// Balance of every bettor after the credits
    pub balances: BTreeMap<UserId, Amount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    Settled(SettlementSummary),
    /// Outcome history already holds this round; nothing was paid
    AlreadySettled { round_id: RoundId },
}

pub struct SettlementEngine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn NotificationSink>,
    payouts: PayoutTable,
    storage_timeout: Duration,
    metrics: Arc<EngineMetrics>,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn NotificationSink>,
        payouts: PayoutTable,
        storage_timeout: Duration,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            notifier,
            payouts,
            storage_timeout,
            metrics,
        }
    }

    pub fn payouts(&self) -> &PayoutTable {
        &self.payouts
    }

    /// Resolve `bets` against `outcome`, credit winners and archive the round.
    ///
    /// Safe to call again after a failure: the store commit is all-or-nothing
    /// and refuses a round that already has an outcome record.
    pub async fn settle(
        &self,
        round_id: RoundId,
        bets: &[Bet],
        outcome: &Outcome,
    ) -> Result<SettlementOutcome, SettlementError> {
        let unavailable = |source: StorageError| SettlementError::StorageUnavailable { round_id, source };

        if bounded(self.storage_timeout, self.store.outcome_exists_for_round(round_id))
            .await
            .map_err(unavailable)?
        {
            return Ok(self.duplicate(round_id));
        }

        let stray = bets.iter().filter(|bet| bet.round_id != round_id).count();
        if stray > 0 {
            warn!("Round {}: ignoring {} bets placed against other rounds", round_id, stray);
        }
        let bets: Vec<Bet> = bets.iter().filter(|bet| bet.round_id == round_id).cloned().collect();

        let resolution = self.payouts.resolve(&bets, outcome);
        let commit = SettlementCommit {
            outcome: outcome.clone(),
            records: resolution.records.clone(),
            credits: resolution.credits.clone(),
        };

        let balances = match bounded(self.storage_timeout, self.store.commit_settlement(&commit))
            .await
            .map_err(unavailable)?
        {
            CommitStatus::Committed { balances } => balances,
            CommitStatus::AlreadySettled => return Ok(self.duplicate(round_id)),
        };

        let summary = SettlementSummary {
            round_id,
            outcome: outcome.clone(),
            bets_settled: bets.len(),
            winners: resolution.winners(),
            total_staked: bets.iter().fold(0, |acc: Amount, b| acc.saturating_add(b.stake)),
            total_payout: resolution.total_payout(),
            balances,
        };
        self.metrics.record_round_settled(summary.total_payout);
        self.publish(&summary);

        info!(
            "Round {} settled: number {} ({} / {}), {} bets, {} winners, paid {}",
            round_id,
            outcome.number,
            outcome.color,
            outcome.size,
            summary.bets_settled,
            summary.winners,
            summary.total_payout
        );

        Ok(SettlementOutcome::Settled(summary))
    }

    fn duplicate(&self, round_id: RoundId) -> SettlementOutcome {
        self.metrics.record_duplicate_settlement();
        debug!("Round {} already has an outcome record; settlement skipped", round_id);
        SettlementOutcome::AlreadySettled { round_id }
    }

    fn publish(&self, summary: &SettlementSummary) {
        for (user_id, balance) in &summary.balances {
            self.notifier.send_to_user(
                user_id,
                GameEvent::BalanceUpdate {
                    user_id: user_id.clone(),
                    balance: *balance,
                },
            );
        }
        self.notifier.broadcast(GameEvent::NewOutcome {
            outcome: summary.outcome.clone(),
        });
        self.notifier.broadcast(GameEvent::RoundSettled {
            round_id: summary.round_id,
            bets_settled: summary.bets_settled,
            total_payout: summary.total_payout,
        });
    }
}
