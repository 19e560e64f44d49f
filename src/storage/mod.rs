//! Persistent store interface
//!
//! The engine only ever talks to storage through `Store`. Every method that
//! touches more than one record (placing a bet, committing a settlement) is a
//! single atomic operation in the implementation, so callers never observe a
//! debit without its bet or a credit without its outcome record.

use crate::config::{StorageBackend, StorageConfig};
use crate::errors::{ColorbetResult, StorageError};
use crate::games::types::{Amount, Bet, Outcome, RoundId, SettlementRecord, User, UserId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
#[cfg(feature = "rocksdb-store")]
pub mod rocks;

pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-store")]
pub use rocks::RocksStore;

/// Everything settlement writes for one round, applied as one unit
#[derive(Debug, Clone)]
pub struct SettlementCommit {
    pub outcome: Outcome,
    pub records: Vec<SettlementRecord>,
    /// Total payout per bettor; zero entries are reported back but not applied
    pub credits: BTreeMap<UserId, Amount>,
}

impl SettlementCommit {
    pub fn round_id(&self) -> RoundId {
        self.outcome.round_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStatus {
    /// Credits applied; balances after the commit for every bettor
    Committed { balances: BTreeMap<UserId, Amount> },
    /// An outcome for this round was already persisted; nothing was written
    AlreadySettled,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<User, StorageError>;

    async fn create_user(&self, user_id: &str, balance: Amount) -> Result<User, StorageError>;

    /// Atomic increment/decrement; refuses to take a balance below zero
    async fn adjust_balance(&self, user_id: &str, delta: i64) -> Result<Amount, StorageError>;

    /// Debit `bet.stake` and append the bet to its round in one step.
    /// Returns the balance after the debit.
    async fn place_bet(&self, bet: &Bet) -> Result<Amount, StorageError>;

    /// Remove and return every pending bet for `round_id`
    async fn drain_bets_for_round(&self, round_id: RoundId) -> Result<Vec<Bet>, StorageError>;

    async fn outcome_exists_for_round(&self, round_id: RoundId) -> Result<bool, StorageError>;

    /// Apply credits, settlement records and the outcome record atomically.
    /// Must return `AlreadySettled` without writing if the outcome exists.
    async fn commit_settlement(&self, commit: &SettlementCommit) -> Result<CommitStatus, StorageError>;

    /// Newest first
    async fn recent_outcomes(&self, limit: usize) -> Result<Vec<Outcome>, StorageError>;

    /// Newest first
    async fn settlement_records_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<SettlementRecord>, StorageError>;

    async fn pending_bets_for_user(&self, user_id: &str) -> Result<Vec<Bet>, StorageError>;

    /// Highest round id with a persisted outcome
    async fn latest_round_id(&self) -> Result<Option<RoundId>, StorageError>;
}

/// Run a store call with an upper bound on its duration
pub async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout(timeout.as_millis() as u64)),
    }
}

/// Open the store selected by configuration
pub fn open_store(config: &StorageConfig) -> ColorbetResult<Arc<dyn Store>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "rocksdb-store")]
        StorageBackend::Rocksdb => Ok(Arc::new(RocksStore::open(&config.data_directory)?)),
        #[cfg(not(feature = "rocksdb-store"))]
        StorageBackend::Rocksdb => Err(crate::errors::ConfigurationError::InvalidValue {
            field: "storage.backend".to_string(),
            value: "rocksdb".to_string(),
            reason: "Built without the rocksdb-store feature".to_string(),
        }
        .into()),
    }
}
