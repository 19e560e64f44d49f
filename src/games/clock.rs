//! Round clock
//!
//! Drives the `Open -> Locked -> Settled -> Open` cycle on a fixed cadence.
//! The round state is a plain value owned by whoever drives the clock: `tick`
//! takes it and hands back the next one, so there is no shared round global.
//!
//! A round that fails to settle stays `Locked` with its drained bets and drawn
//! outcome parked in the state. The next tick retries with exactly the same
//! inputs, and the store refuses a second commit for the round, so retries
//! can neither lose nor duplicate a payout. Bets drained from a round whose
//! outcome already exists are refunded instead of paid.

use crate::config::RoundConfig;
use crate::errors::{ClockDrift, SettlementError};
use crate::games::ledger::BetLedger;
use crate::games::outcome::OutcomeGenerator;
use crate::games::settlement::{SettlementEngine, SettlementOutcome, SettlementSummary};
use crate::games::types::{Bet, Outcome, Phase, RoundId, RoundSnapshot};
use crate::metrics::EngineMetrics;
use crate::notifications::{GameEvent, NotificationSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Inputs of a locked round, kept for retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawnRound {
    pub bets: Vec<Bet>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundState {
    pub round_id: RoundId,
    pub phase: Phase,
    pub countdown: u32,
    pending: Option<DrawnRound>,
}

impl RoundState {
    pub fn new(round_id: RoundId, round_duration_secs: u32) -> Self {
        Self {
            round_id,
            phase: Phase::Open,
            countdown: round_duration_secs,
            pending: None,
        }
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            round_id: self.round_id,
            phase: self.phase,
            countdown: self.countdown,
        }
    }

    /// Drawn inputs of a round whose settlement is being retried
    pub fn pending(&self) -> Option<&DrawnRound> {
        self.pending.as_ref()
    }
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickReport {
    Counting { round_id: RoundId, countdown: u32 },
    Settled(SettlementSummary),
    /// The round already had an outcome record; the clock moved on without paying
    Duplicate { round_id: RoundId },
    /// Settlement failed; the round stays locked and is retried next tick
    Deferred(SettlementError),
}

pub struct RoundClock {
    ledger: Arc<BetLedger>,
    generator: Arc<dyn OutcomeGenerator>,
    settlement: Arc<SettlementEngine>,
    notifier: Arc<dyn NotificationSink>,
    config: RoundConfig,
    snapshot: watch::Sender<RoundSnapshot>,
    metrics: Arc<EngineMetrics>,
}

impl RoundClock {
    pub fn new(
        ledger: Arc<BetLedger>,
        generator: Arc<dyn OutcomeGenerator>,
        settlement: Arc<SettlementEngine>,
        notifier: Arc<dyn NotificationSink>,
        config: RoundConfig,
        initial: RoundSnapshot,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (snapshot, _rx) = watch::channel(initial);
        Self {
            ledger,
            generator,
            settlement,
            notifier,
            config,
            snapshot,
            metrics,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RoundSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        *self.snapshot.borrow()
    }

    /// Advance the clock by one tick.
    ///
    /// Ticks must be issued serially by a single driver.
    pub async fn tick(&self, mut state: RoundState) -> (RoundState, TickReport) {
        if state.phase == Phase::Open {
            state.countdown = state.countdown.saturating_sub(1);
            if state.countdown > 0 {
                let report = TickReport::Counting {
                    round_id: state.round_id,
                    countdown: state.countdown,
                };
                self.publish(&state);
                return (state, report);
            }

            state.phase = Phase::Locked;
            self.ledger.window().close(state.round_id).await;
            info!("Round {} locked", state.round_id);
        }

        let report = self.settle_locked(&mut state).await;
        self.publish(&state);
        (state, report)
    }

    async fn settle_locked(&self, state: &mut RoundState) -> TickReport {
        let round_id = state.round_id;

        let drawn = match state.pending.take() {
            Some(drawn) => {
                debug!("Retrying settlement of round {}", round_id);
                drawn
            }
            None => match self.ledger.drain_round(round_id).await {
                Ok(bets) => {
                    let outcome = self.generator.generate(round_id, &bets);
                    debug!(
                        "Round {} drew {} with {} ({} bets)",
                        round_id,
                        outcome.number,
                        self.generator.name(),
                        bets.len()
                    );
                    DrawnRound { bets, outcome }
                }
                Err(source) => return self.defer(SettlementError::StorageUnavailable { round_id, source }),
            },
        };

        match self.settlement.settle(round_id, &drawn.bets, &drawn.outcome).await {
            Ok(SettlementOutcome::Settled(summary)) => {
                self.open_next(state).await;
                TickReport::Settled(summary)
            }
            Ok(SettlementOutcome::AlreadySettled { round_id }) => {
                if !drawn.bets.is_empty() {
                    warn!(
                        "Round {} was already settled; refunding {} drained bets",
                        round_id,
                        drawn.bets.len()
                    );
                    if let Err((remaining, source)) = self.ledger.refund_bets(drawn.bets).await {
                        state.pending = Some(DrawnRound {
                            bets: remaining,
                            outcome: drawn.outcome,
                        });
                        return self.defer(SettlementError::StorageUnavailable { round_id, source });
                    }
                }
                self.open_next(state).await;
                TickReport::Duplicate { round_id }
            }
            Err(error) => {
                state.pending = Some(drawn);
                self.defer(error)
            }
        }
    }

    fn defer(&self, error: SettlementError) -> TickReport {
        self.metrics.record_settlement_failure();
        warn!("{}; round stays locked, retrying next tick", error);
        TickReport::Deferred(error)
    }

    async fn open_next(&self, state: &mut RoundState) {
        state.phase = Phase::Settled;
        self.publish(state);
        *state = RoundState::new(state.round_id + 1, self.config.round_duration_secs);
        self.ledger.window().open(state.round_id).await;
        info!("Round {} open for {}s", state.round_id, state.countdown);
    }

    fn publish(&self, state: &RoundState) {
        self.snapshot.send_replace(state.snapshot());
        self.notifier.broadcast(GameEvent::TimerUpdate {
            round_id: state.round_id,
            countdown: state.countdown,
            phase: state.phase,
        });
    }

    /// Tick on the configured cadence until `running` is cleared.
    /// Returns the state as of the last completed tick.
    pub async fn run(self: Arc<Self>, mut state: RoundState, running: Arc<AtomicBool>) -> RoundState {
        let period = self.config.tick_interval();
        let tolerance = self.config.drift_tolerance();

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        let mut last = Instant::now();

        info!(
            "Round clock started at round {} ({}ms ticks)",
            state.round_id, self.config.tick_interval_ms
        );

        while running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if !running.load(Ordering::SeqCst) {
                break;
            }

            let now = Instant::now();
            let actual = now.duration_since(last);
            last = now;
            if actual > period + tolerance {
                self.metrics.record_clock_drift();
                warn!(
                    "{}",
                    ClockDrift {
                        expected: period,
                        actual,
                    }
                );
            }

            let (next, _report) = self.tick(state).await;
            state = next;
        }

        info!("Round clock stopped at round {}", state.round_id);
        state
    }
}
