//! In-process store
//!
//! All state sits behind one `RwLock` that is never held across an await, so
//! every `Store` method is atomic. Outage and latency switches let tests
//! exercise the retry and timeout paths.

use super::{CommitStatus, SettlementCommit, Store};
use crate::errors::StorageError;
use crate::games::types::{Amount, Bet, Outcome, RoundId, SettlementRecord, User, UserId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

#[derive(Default)]
struct MemoryState {
    balances: HashMap<UserId, Amount>,
    pending_bets: BTreeMap<RoundId, Vec<Bet>>,
    outcomes: BTreeMap<RoundId, Outcome>,
    records: HashMap<UserId, Vec<SettlementRecord>>,
}

pub struct MemoryStore {
    state: RwLock<MemoryState>,
    available: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` while false
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of outcome records persisted so far
    pub fn outcome_count(&self) -> usize {
        self.state.read().map(|s| s.outcomes.len()).unwrap_or(0)
    }

    async fn gate(&self) -> Result<(), StorageError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>, StorageError> {
        self.state
            .read()
            .map_err(|_| StorageError::Corrupted("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, StorageError> {
        self.state
            .write()
            .map_err(|_| StorageError::Corrupted("memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_delta(user_id: &str, balance: Amount, delta: i64) -> Result<Amount, StorageError> {
    let next = if delta >= 0 {
        balance.checked_add(delta as u64)
    } else {
        balance.checked_sub(delta.unsigned_abs())
    };
    next.ok_or_else(|| StorageError::NegativeBalance {
        user_id: user_id.to_string(),
        balance,
        delta,
    })
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<User, StorageError> {
        self.gate().await?;
        let state = self.read()?;
        state
            .balances
            .get(user_id)
            .map(|balance| User {
                user_id: user_id.to_string(),
                balance: *balance,
            })
            .ok_or_else(|| StorageError::UserNotFound(user_id.to_string()))
    }

    async fn create_user(&self, user_id: &str, balance: Amount) -> Result<User, StorageError> {
        self.gate().await?;
        let mut state = self.write()?;
        if state.balances.contains_key(user_id) {
            return Err(StorageError::UserExists(user_id.to_string()));
        }
        state.balances.insert(user_id.to_string(), balance);
        Ok(User {
            user_id: user_id.to_string(),
            balance,
        })
    }

    async fn adjust_balance(&self, user_id: &str, delta: i64) -> Result<Amount, StorageError> {
        self.gate().await?;
        let mut state = self.write()?;
        let balance = state
            .balances
            .get_mut(user_id)
            .ok_or_else(|| StorageError::UserNotFound(user_id.to_string()))?;
        *balance = apply_delta(user_id, *balance, delta)?;
        Ok(*balance)
    }

    async fn place_bet(&self, bet: &Bet) -> Result<Amount, StorageError> {
        self.gate().await?;
        let mut state = self.write()?;
        let balance = state
            .balances
            .get_mut(&bet.user_id)
            .ok_or_else(|| StorageError::UserNotFound(bet.user_id.clone()))?;
        let next = balance.checked_sub(bet.stake).ok_or_else(|| StorageError::NegativeBalance {
            user_id: bet.user_id.clone(),
            balance: *balance,
            delta: -(bet.stake.min(i64::MAX as u64) as i64),
        })?;
        *balance = next;
        state
            .pending_bets
            .entry(bet.round_id)
            .or_default()
            .push(bet.clone());
        Ok(next)
    }

    async fn drain_bets_for_round(&self, round_id: RoundId) -> Result<Vec<Bet>, StorageError> {
        self.gate().await?;
        let mut state = self.write()?;
        Ok(state.pending_bets.remove(&round_id).unwrap_or_default())
    }

    async fn outcome_exists_for_round(&self, round_id: RoundId) -> Result<bool, StorageError> {
        self.gate().await?;
        Ok(self.read()?.outcomes.contains_key(&round_id))
    }

    async fn commit_settlement(&self, commit: &SettlementCommit) -> Result<CommitStatus, StorageError> {
        self.gate().await?;
        let mut state = self.write()?;
        let round_id = commit.round_id();
        if state.outcomes.contains_key(&round_id) {
            return Ok(CommitStatus::AlreadySettled);
        }

        // Validate every credit before mutating anything
        let mut balances = BTreeMap::new();
        for (user_id, credit) in &commit.credits {
            let balance = state
                .balances
                .get(user_id)
                .ok_or_else(|| StorageError::UserNotFound(user_id.clone()))?;
            let next = balance.checked_add(*credit).ok_or_else(|| {
                StorageError::Corrupted(format!("balance overflow for {}", user_id))
            })?;
            balances.insert(user_id.clone(), next);
        }

        for (user_id, balance) in &balances {
            state.balances.insert(user_id.clone(), *balance);
        }
        for record in &commit.records {
            state
                .records
                .entry(record.bet.user_id.clone())
                .or_default()
                .push(record.clone());
        }
        state.outcomes.insert(round_id, commit.outcome.clone());

        Ok(CommitStatus::Committed { balances })
    }

    async fn recent_outcomes(&self, limit: usize) -> Result<Vec<Outcome>, StorageError> {
        self.gate().await?;
        let state = self.read()?;
        Ok(state.outcomes.values().rev().take(limit).cloned().collect())
    }

    async fn settlement_records_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<SettlementRecord>, StorageError> {
        self.gate().await?;
        let state = self.read()?;
        Ok(state
            .records
            .get(user_id)
            .map(|records| records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn pending_bets_for_user(&self, user_id: &str) -> Result<Vec<Bet>, StorageError> {
        self.gate().await?;
        let state = self.read()?;
        Ok(state
            .pending_bets
            .values()
            .flatten()
            .filter(|bet| bet.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn latest_round_id(&self) -> Result<Option<RoundId>, StorageError> {
        self.gate().await?;
        Ok(self.read()?.outcomes.keys().next_back().copied())
    }
}
