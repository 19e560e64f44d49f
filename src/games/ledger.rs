//! Bet ledger
//!
//! Bets are accepted only while the betting window is open. Placement first
//! takes a per-user lock for its check-then-act sequence, then holds the
//! window for reading until the bet is appended. The clock takes the window
//! for writing to close a round, so nothing lands in a round after it is
//! drained. Queued placements of the same user wait on the user lock, not on
//! the window, so a close waits for at most one placement per user.

use crate::errors::{BetError, StorageError};
use crate::games::types::{Amount, Bet, BetSelection, RoundId, UserId};
use crate::metrics::EngineMetrics;
use crate::storage::{bounded, Store};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub round_id: RoundId,
    pub open: bool,
}

/// Shared gate between bet placement and the round clock
#[derive(Clone)]
pub struct BettingWindow {
    state: Arc<RwLock<WindowState>>,
}

impl BettingWindow {
    pub fn open_for(round_id: RoundId) -> Self {
        Self {
            state: Arc::new(RwLock::new(WindowState { round_id, open: true })),
        }
    }

    /// Close `round_id`; returns once every in-flight placement has finished
    pub async fn close(&self, round_id: RoundId) {
        let mut state = self.state.write().await;
        state.round_id = round_id;
        state.open = false;
    }

    pub async fn open(&self, round_id: RoundId) {
        let mut state = self.state.write().await;
        state.round_id = round_id;
        state.open = true;
    }

    pub async fn current(&self) -> WindowState {
        *self.state.read().await
    }
}

/// Successful placement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedBet {
    pub bet: Bet,
    pub balance: Amount,
}

pub struct BetLedger {
    store: Arc<dyn Store>,
    window: BettingWindow,
    user_locks: DashMap<UserId, Arc<Mutex<()>>>,
    storage_timeout: Duration,
    metrics: Arc<EngineMetrics>,
}

impl BetLedger {
    pub fn new(
        store: Arc<dyn Store>,
        window: BettingWindow,
        storage_timeout: Duration,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            window,
            user_locks: DashMap::new(),
            storage_timeout,
            metrics,
        }
    }

    pub fn window(&self) -> &BettingWindow {
        &self.window
    }

    /// Place a bet from raw client input
    pub async fn place_bet(
        &self,
        user_id: &str,
        category: &str,
        value: &str,
        stake: Amount,
    ) -> Result<PlacedBet, BetError> {
        let result = self.place_inner(user_id, || BetSelection::parse(category, value), stake).await;
        self.record(&result);
        result
    }

    /// Place a bet from an already-typed selection
    pub async fn place_selection(
        &self,
        user_id: &str,
        selection: BetSelection,
        stake: Amount,
    ) -> Result<PlacedBet, BetError> {
        let result = self
            .place_inner(user_id, || selection.validate().map(|_| selection), stake)
            .await;
        self.record(&result);
        result
    }

    async fn place_inner<F>(&self, user_id: &str, selection: F, stake: Amount) -> Result<PlacedBet, BetError>
    where
        F: FnOnce() -> Result<BetSelection, BetError>,
    {
        let user_lock = self
            .user_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _user_guard = user_lock.lock().await;
            self.place_locked(user_id, selection, stake).await
        };

        drop(user_lock);
        // Only the map itself still references an idle lock
        self.user_locks
            .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Runs with the user's lock held
    async fn place_locked<F>(&self, user_id: &str, selection: F, stake: Amount) -> Result<PlacedBet, BetError>
    where
        F: FnOnce() -> Result<BetSelection, BetError>,
    {
        // Held until the bet is appended so the clock cannot drain underneath us
        let window = self.window.state.read().await;
        if !window.open {
            return Err(BetError::BettingClosed {
                round_id: window.round_id,
            });
        }

        let selection = selection()?;
        if stake == 0 {
            return Err(BetError::InvalidStake);
        }

        let user = bounded(self.storage_timeout, self.store.get_user(user_id)).await?;
        if stake > user.balance {
            return Err(BetError::InsufficientFunds {
                balance: user.balance,
                stake,
            });
        }

        let bet = Bet::new(user_id.to_string(), window.round_id, selection, stake);
        let balance = bounded(self.storage_timeout, self.store.place_bet(&bet)).await?;

        debug!(
            "Bet {} accepted: {} staked {} on {} in round {} (balance {})",
            bet.bet_id, user_id, stake, selection, bet.round_id, balance
        );
        Ok(PlacedBet { bet, balance })
    }

    fn record(&self, result: &Result<PlacedBet, BetError>) {
        match result {
            Ok(placed) => self.metrics.record_bet_accepted(placed.bet.stake),
            Err(_) => self.metrics.record_bet_rejected(),
        }
    }

    /// Remove and return every bet of `round_id`. Later calls return empty.
    pub async fn drain_round(&self, round_id: RoundId) -> Result<Vec<Bet>, StorageError> {
        bounded(self.storage_timeout, self.store.drain_bets_for_round(round_id)).await
    }

    /// Return the stakes of `bets` to their owners, one balance adjustment
    /// per user. On failure the bets of users not yet refunded are handed
    /// back with the error so the caller can retry exactly those.
    pub async fn refund_bets(&self, bets: Vec<Bet>) -> Result<(), (Vec<Bet>, StorageError)> {
        let mut by_user: BTreeMap<UserId, Vec<Bet>> = BTreeMap::new();
        for bet in bets {
            by_user.entry(bet.user_id.clone()).or_default().push(bet);
        }

        while let Some((user_id, user_bets)) = by_user.pop_first() {
            let total: Amount = user_bets.iter().map(|bet| bet.stake).sum();
            let refunded = match i64::try_from(total) {
                Ok(delta) => bounded(self.storage_timeout, self.store.adjust_balance(&user_id, delta)).await,
                Err(_) => Err(StorageError::Corrupted(format!(
                    "refund of {} for {} does not fit a balance delta",
                    total, user_id
                ))),
            };

            if let Err(e) = refunded {
                let mut remaining = user_bets;
                remaining.extend(by_user.into_values().flatten());
                return Err((remaining, e));
            }
            debug!("Refunded {} to {} for {} bets", total, user_id, user_bets.len());
        }
        Ok(())
    }

    /// The user's bets in the open round
    pub async fn current_bets(&self, user_id: &str) -> Result<Vec<Bet>, StorageError> {
        let round_id = self.window.current().await.round_id;
        let bets = bounded(self.storage_timeout, self.store.pending_bets_for_user(user_id)).await?;
        Ok(bets.into_iter().filter(|bet| bet.round_id == round_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::types::Color;
    use crate::storage::MemoryStore;

    async fn ledger_with_user(balance: Amount) -> (Arc<BetLedger>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.create_user("alice", balance).await.unwrap();
        let ledger = BetLedger::new(
            store.clone(),
            BettingWindow::open_for(1),
            Duration::from_secs(1),
            Arc::new(EngineMetrics::new()),
        );
        (Arc::new(ledger), store)
    }

    #[tokio::test]
    async fn test_place_then_drain_returns_bet_once() {
        let (ledger, store) = ledger_with_user(10_000).await;

        let placed = ledger.place_bet("alice", "color", "red", 1_000).await.unwrap();
        assert_eq!(placed.balance, 9_000);
        assert_eq!(placed.bet.round_id, 1);
        assert_eq!(placed.bet.selection, BetSelection::Color(Color::Red));
        assert_eq!(store.get_user("alice").await.unwrap().balance, 9_000);

        assert_eq!(ledger.drain_round(1).await.unwrap(), vec![placed.bet]);
        assert!(ledger.drain_round(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejections_leave_balance_untouched() {
        let (ledger, store) = ledger_with_user(1_000).await;

        assert!(matches!(
            ledger.place_bet("alice", "parity", "odd", 100).await,
            Err(BetError::InvalidCategory(_))
        ));
        assert!(matches!(
            ledger.place_bet("alice", "number", "12", 100).await,
            Err(BetError::InvalidValue { .. })
        ));
        assert_eq!(
            ledger.place_bet("alice", "size", "big", 0).await,
            Err(BetError::InvalidStake)
        );
        assert_eq!(
            ledger.place_bet("alice", "size", "big", 1_001).await,
            Err(BetError::InsufficientFunds {
                balance: 1_000,
                stake: 1_001
            })
        );
        assert!(matches!(
            ledger.place_bet("nobody", "size", "big", 1).await,
            Err(BetError::UserNotFound(_))
        ));

        assert_eq!(store.get_user("alice").await.unwrap().balance, 1_000);
        assert!(ledger.drain_round(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_window_rejects() {
        let (ledger, _store) = ledger_with_user(1_000).await;
        ledger.window().close(1).await;

        assert_eq!(
            ledger.place_bet("alice", "color", "red", 100).await,
            Err(BetError::BettingClosed { round_id: 1 })
        );

        ledger.window().open(2).await;
        let placed = ledger.place_bet("alice", "color", "red", 100).await.unwrap();
        assert_eq!(placed.bet.round_id, 2);
    }

    #[tokio::test]
    async fn test_typed_selection_is_validated() {
        let (ledger, _store) = ledger_with_user(1_000).await;
        assert!(matches!(
            ledger.place_selection("alice", BetSelection::Number(11), 100).await,
            Err(BetError::InvalidValue { .. })
        ));
        assert!(ledger
            .place_selection("alice", BetSelection::Number(9), 100)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_bets_never_overdraw() {
        let (ledger, store) = ledger_with_user(1_000).await;

        let tasks: Vec<_> = (0..25)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.place_bet("alice", "number", "3", 300).await })
            })
            .collect();

        let mut accepted = 0;
        let mut insufficient = 0;
        for task in futures::future::join_all(tasks).await {
            match task.unwrap() {
                Ok(_) => accepted += 1,
                Err(BetError::InsufficientFunds { .. }) => insufficient += 1,
                Err(other) => panic!("unexpected rejection: {other}"),
            }
        }

        // floor(1000 / 300)
        assert_eq!(accepted, 3);
        assert_eq!(insufficient, 22);
        assert_eq!(store.get_user("alice").await.unwrap().balance, 100);
        let drained = ledger.drain_round(1).await.unwrap();
        assert_eq!(drained.iter().map(|b| b.stake).sum::<u64>(), 900);
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_placement() {
        let (ledger, store) = ledger_with_user(1_000).await;
        store.set_latency(Duration::from_millis(50));

        let placing = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.place_bet("alice", "size", "small", 100).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        ledger.window().close(1).await;
        store.set_latency(Duration::ZERO);

        // The placement started before the close, so it lands in round 1
        assert!(placing.await.unwrap().is_ok());
        assert_eq!(ledger.drain_round(1).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_not_blocked_by_queued_bets_of_one_user() {
        let (ledger, store) = ledger_with_user(1_000_000).await;
        store.set_latency(Duration::from_millis(100));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.place_bet("alice", "color", "red", 100).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // One placement is in flight (get_user + place_bet); the rest queue on alice's lock
        let started = tokio::time::Instant::now();
        ledger.window().close(1).await;
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "close waited {:?}",
            started.elapsed()
        );

        let mut accepted = 0;
        let mut closed = 0;
        for task in futures::future::join_all(tasks).await {
            match task.unwrap() {
                Ok(_) => accepted += 1,
                Err(BetError::BettingClosed { round_id: 1 }) => closed += 1,
                Err(other) => panic!("unexpected rejection: {other}"),
            }
        }
        assert!(accepted >= 1 && accepted <= 2, "accepted {accepted}");
        assert_eq!(accepted + closed, 50);

        store.set_latency(Duration::ZERO);
        assert_eq!(ledger.drain_round(1).await.unwrap().len(), accepted);
        assert_eq!(
            store.get_user("alice").await.unwrap().balance,
            1_000_000 - 100 * accepted as u64
        );
    }

    #[tokio::test]
    async fn test_user_locks_are_released_after_placement() {
        let (ledger, store) = ledger_with_user(10_000).await;
        store.create_user("bob", 10_000).await.unwrap();

        let tasks: Vec<_> = ["alice", "bob", "alice", "bob", "nobody"]
            .into_iter()
            .map(|user| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.place_bet(user, "size", "big", 100).await })
            })
            .collect();
        futures::future::join_all(tasks).await;

        assert!(ledger.user_locks.is_empty());
        assert_eq!(store.get_user("alice").await.unwrap().balance, 9_800);
        assert_eq!(store.get_user("bob").await.unwrap().balance, 9_800);
    }

    #[tokio::test]
    async fn test_refund_returns_stakes_per_user() {
        let (ledger, store) = ledger_with_user(1_000).await;
        store.create_user("bob", 1_000).await.unwrap();
        ledger.place_bet("alice", "color", "red", 300).await.unwrap();
        ledger.place_bet("alice", "number", "4", 200).await.unwrap();
        ledger.place_bet("bob", "size", "small", 700).await.unwrap();

        let drained = ledger.drain_round(1).await.unwrap();
        assert_eq!(drained.len(), 3);
        ledger.refund_bets(drained).await.unwrap();

        assert_eq!(store.get_user("alice").await.unwrap().balance, 1_000);
        assert_eq!(store.get_user("bob").await.unwrap().balance, 1_000);
    }

    #[tokio::test]
    async fn test_refund_hands_back_unrefunded_bets_on_outage() {
        let (ledger, store) = ledger_with_user(1_000).await;
        ledger.place_bet("alice", "color", "red", 300).await.unwrap();
        let drained = ledger.drain_round(1).await.unwrap();

        store.set_available(false);
        let (remaining, err) = ledger.refund_bets(drained.clone()).await.unwrap_err();
        assert_eq!(remaining, drained);
        assert!(matches!(err, StorageError::Unavailable(_)));

        store.set_available(true);
        ledger.refund_bets(remaining).await.unwrap();
        assert_eq!(store.get_user("alice").await.unwrap().balance, 1_000);
    }

    #[tokio::test]
    async fn test_current_bets_filters_open_round() {
        let (ledger, _store) = ledger_with_user(1_000).await;
        ledger.place_bet("alice", "color", "green", 100).await.unwrap();
        ledger.window().close(1).await;
        ledger.window().open(2).await;
        ledger.place_bet("alice", "color", "purple", 100).await.unwrap();

        let current = ledger.current_bets("alice").await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].round_id, 2);
    }
}
