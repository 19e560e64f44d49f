//! Engine assembly
//!
//! `GameEngine` wires the store, notifier, ledger, settlement engine and
//! round clock together from a `GameConfig`, and is the surface a transport
//! layer talks to. Exactly one clock driver may run per engine.

use crate::config::{ConfigLoader, GameConfig};
use crate::errors::{BetError, ColorbetError, ColorbetResult, StorageError};
use crate::games::clock::{RoundClock, RoundState};
use crate::games::ledger::{BetLedger, BettingWindow, PlacedBet};
use crate::games::outcome::generator_from_config;
use crate::games::settlement::{PayoutTable, SettlementEngine};
use crate::games::types::{Amount, Bet, BetSelection, Outcome, RoundId, RoundSnapshot, SettlementRecord, User};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::notifications::{ChannelNotifier, GameEvent, NotificationSink, NotifierStats};
use crate::storage::{bounded, Store};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct GameEngine {
    config: GameConfig,
    store: Arc<dyn Store>,
    notifier: Arc<ChannelNotifier>,
    ledger: Arc<BetLedger>,
    clock: Arc<RoundClock>,
    metrics: Arc<EngineMetrics>,
    starting_round: RoundId,
    started: AtomicBool,
}

impl GameEngine {
    /// Validate `config` and assemble an engine over `store`.
    ///
    /// Round numbering resumes after the newest outcome already in the store.
    pub async fn new(config: GameConfig, store: Arc<dyn Store>) -> ColorbetResult<Self> {
        ConfigLoader::new().validate(&config)?;

        let timeout = config.storage.timeout();
        let starting_round = bounded(timeout, store.latest_round_id())
            .await?
            .map_or(1, |latest| latest + 1);

        let metrics = Arc::new(EngineMetrics::new());
        let notifier = Arc::new(ChannelNotifier::new(&config.notifications));
        let payouts = PayoutTable::from(&config.payout);

        let ledger = Arc::new(BetLedger::new(
            store.clone(),
            BettingWindow::open_for(starting_round),
            timeout,
            metrics.clone(),
        ));
        let settlement = Arc::new(SettlementEngine::new(
            store.clone(),
            notifier.clone(),
            payouts,
            timeout,
            metrics.clone(),
        ));
        let generator = generator_from_config(&config.outcome, payouts);
        let initial = RoundState::new(starting_round, config.round.round_duration_secs);
        let clock = Arc::new(RoundClock::new(
            ledger.clone(),
            generator,
            settlement,
            notifier.clone(),
            config.round.clone(),
            initial.snapshot(),
            metrics.clone(),
        ));

        info!(
            "Engine ready: round {} ({}s rounds, {:?} outcomes, {:?} store)",
            starting_round, config.round.round_duration_secs, config.outcome.strategy, config.storage.backend
        );

        Ok(Self {
            config,
            store,
            notifier,
            ledger,
            clock,
            metrics,
            starting_round,
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    /// State of the first round this engine will run
    pub fn starting_state(&self) -> RoundState {
        RoundState::new(self.starting_round, self.config.round.round_duration_secs)
    }

    /// Clock for callers that drive ticks themselves instead of calling `spawn`
    pub fn clock(&self) -> Arc<RoundClock> {
        self.clock.clone()
    }

    pub fn ledger(&self) -> Arc<BetLedger> {
        self.ledger.clone()
    }

    /// Start the round clock on its own task
    pub fn spawn(&self) -> ColorbetResult<EngineHandle> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ColorbetError::AlreadyRunning);
        }

        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(self.clock.clone().run(self.starting_state(), running.clone()));
        Ok(EngineHandle { running, task })
    }

    pub async fn place_bet(
        &self,
        user_id: &str,
        category: &str,
        value: &str,
        stake: Amount,
    ) -> Result<PlacedBet, BetError> {
        self.ledger.place_bet(user_id, category, value, stake).await
    }

    pub async fn place_selection(
        &self,
        user_id: &str,
        selection: BetSelection,
        stake: Amount,
    ) -> Result<PlacedBet, BetError> {
        self.ledger.place_selection(user_id, selection, stake).await
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        self.clock.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<RoundSnapshot> {
        self.clock.subscribe()
    }

    /// Newest first; `None` uses the configured default
    pub async fn recent_outcomes(&self, limit: Option<usize>) -> Result<Vec<Outcome>, StorageError> {
        let limit = self.config.history.clamp(limit);
        bounded(self.timeout(), self.store.recent_outcomes(limit)).await
    }

    /// The user's settled bets, newest first
    pub async fn my_bets(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<SettlementRecord>, StorageError> {
        let limit = self.config.history.clamp(limit);
        bounded(self.timeout(), self.store.settlement_records_for_user(user_id, limit)).await
    }

    /// The user's bets in the round currently open
    pub async fn current_bets(&self, user_id: &str) -> Result<Vec<Bet>, StorageError> {
        self.ledger.current_bets(user_id).await
    }

    pub async fn register_user(&self, user_id: &str, balance: Amount) -> Result<User, StorageError> {
        let user = bounded(self.timeout(), self.store.create_user(user_id, balance)).await?;
        info!("Registered {} with balance {}", user_id, balance);
        Ok(user)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<User, StorageError> {
        bounded(self.timeout(), self.store.get_user(user_id)).await
    }

    /// Deposit (positive) or withdraw (negative) outside of betting.
    /// Fails without changes if the balance would go negative.
    pub async fn adjust_balance(&self, user_id: &str, delta: i64) -> Result<Amount, StorageError> {
        let balance = bounded(self.timeout(), self.store.adjust_balance(user_id, delta)).await?;
        self.notifier.send_to_user(
            user_id,
            GameEvent::BalanceUpdate {
                user_id: user_id.to_string(),
                balance,
            },
        );
        Ok(balance)
    }

    /// Register a live connection; it receives this user's balance updates
    pub fn connect(&self, user_id: &str) -> mpsc::Receiver<GameEvent> {
        self.notifier.connect(user_id)
    }

    pub fn disconnect(&self, user_id: &str) -> bool {
        self.notifier.disconnect(user_id)
    }

    /// Timer, outcome and settlement events for every listener
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.notifier.subscribe()
    }

    pub fn notifier_stats(&self) -> NotifierStats {
        self.notifier.stats()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn timeout(&self) -> Duration {
        self.config.storage.timeout()
    }
}

/// Handle to a spawned round clock
pub struct EngineHandle {
    running: Arc<AtomicBool>,
    task: JoinHandle<RoundState>,
}

impl EngineHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Stop after the tick in progress and return the clock's final state
    pub async fn shutdown(self) -> Option<RoundState> {
        self.running.store(false, Ordering::SeqCst);
        match self.task.await {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Round clock task ended abnormally: {}", e);
                None
            }
        }
    }
}
