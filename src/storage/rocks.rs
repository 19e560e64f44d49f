//! Durable store backed by RocksDB
//!
//! Values are JSON. Multi-key updates go through one `WriteBatch` while
//! `write_lock` is held, which makes every read-modify-write sequence atomic
//! with respect to other writers in this process.

use super::{CommitStatus, SettlementCommit, Store};
use crate::errors::StorageError;
use crate::games::types::{Amount, Bet, Outcome, RoundId, SettlementRecord, User};
use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

const USER_PREFIX: &[u8] = b"user:";
const PENDING_BET_PREFIX: &[u8] = b"bet:pending:";
const OUTCOME_PREFIX: &[u8] = b"outcome:";
const RECORD_PREFIX: &[u8] = b"record:";
const LATEST_ROUND_KEY: &[u8] = b"meta:latest_round";

fn user_key(user_id: &str) -> Vec<u8> {
    let mut key = USER_PREFIX.to_vec();
    key.extend_from_slice(user_id.as_bytes());
    key
}

fn pending_round_prefix(round_id: RoundId) -> Vec<u8> {
    let mut key = PENDING_BET_PREFIX.to_vec();
    key.extend_from_slice(&round_id.to_be_bytes());
    key
}

fn pending_bet_key(bet: &Bet) -> Vec<u8> {
    let mut key = pending_round_prefix(bet.round_id);
    key.extend_from_slice(bet.bet_id.as_bytes());
    key
}

fn outcome_key(round_id: RoundId) -> Vec<u8> {
    // Newest-first iteration: inverted round id as the sort key
    let mut key = OUTCOME_PREFIX.to_vec();
    key.extend_from_slice(&(u64::MAX - round_id).to_be_bytes());
    key
}

fn record_user_prefix(user_id: &str) -> Vec<u8> {
    let mut key = RECORD_PREFIX.to_vec();
    key.extend_from_slice(user_id.as_bytes());
    key.push(0);
    key
}

fn record_key(record: &SettlementRecord) -> Vec<u8> {
    let mut key = record_user_prefix(&record.bet.user_id);
    key.extend_from_slice(&(u64::MAX - record.outcome_round_id).to_be_bytes());
    key.extend_from_slice(record.bet.bet_id.as_bytes());
    key
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::Corrupted(format!("encode failed: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupted(format!("decode failed: {}", e)))
}

fn decode_amount(bytes: &[u8]) -> Result<Amount, StorageError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StorageError::Corrupted("balance is not 8 bytes".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

fn db_error(e: rocksdb::Error) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

#[derive(Clone)]
pub struct RocksStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        std::fs::create_dir_all(path.as_ref()).map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path).map_err(db_error)?;
        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn balance(&self, user_id: &str) -> Result<Amount, StorageError> {
        match self.db.get(user_key(user_id)).map_err(db_error)? {
            Some(bytes) => decode_amount(&bytes),
            None => Err(StorageError::UserNotFound(user_id.to_string())),
        }
    }

    fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut rows = Vec::new();
        for item in self.db.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(db_error)?;
            if !key.starts_with(prefix) || rows.len() >= limit {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, ()>, StorageError> {
        self.write_lock
            .lock()
            .map_err(|_| StorageError::Corrupted("write lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for RocksStore {
    async fn get_user(&self, user_id: &str) -> Result<User, StorageError> {
        Ok(User {
            user_id: user_id.to_string(),
            balance: self.balance(user_id)?,
        })
    }

    async fn create_user(&self, user_id: &str, balance: Amount) -> Result<User, StorageError> {
        let _guard = self.locked()?;
        if self.db.get(user_key(user_id)).map_err(db_error)?.is_some() {
            return Err(StorageError::UserExists(user_id.to_string()));
        }
        self.db
            .put(user_key(user_id), balance.to_be_bytes())
            .map_err(db_error)?;
        Ok(User {
            user_id: user_id.to_string(),
            balance,
        })
    }

    async fn adjust_balance(&self, user_id: &str, delta: i64) -> Result<Amount, StorageError> {
        let _guard = self.locked()?;
        let balance = self.balance(user_id)?;
        let next = if delta >= 0 {
            balance.checked_add(delta as u64)
        } else {
            balance.checked_sub(delta.unsigned_abs())
        }
        .ok_or_else(|| StorageError::NegativeBalance {
            user_id: user_id.to_string(),
            balance,
            delta,
        })?;
        self.db.put(user_key(user_id), next.to_be_bytes()).map_err(db_error)?;
        Ok(next)
    }

    async fn place_bet(&self, bet: &Bet) -> Result<Amount, StorageError> {
        let _guard = self.locked()?;
        let balance = self.balance(&bet.user_id)?;
        let next = balance.checked_sub(bet.stake).ok_or_else(|| StorageError::NegativeBalance {
            user_id: bet.user_id.clone(),
            balance,
            delta: -(bet.stake.min(i64::MAX as u64) as i64),
        })?;

        let mut batch = WriteBatch::default();
        batch.put(user_key(&bet.user_id), next.to_be_bytes());
        batch.put(pending_bet_key(bet), encode(bet)?);
        self.db.write(batch).map_err(db_error)?;
        Ok(next)
    }

    async fn drain_bets_for_round(&self, round_id: RoundId) -> Result<Vec<Bet>, StorageError> {
        let _guard = self.locked()?;
        let rows = self.scan_prefix(&pending_round_prefix(round_id), usize::MAX)?;

        let mut bets = Vec::with_capacity(rows.len());
        let mut batch = WriteBatch::default();
        for (key, value) in rows {
            bets.push(decode::<Bet>(&value)?);
            batch.delete(key);
        }
        self.db.write(batch).map_err(db_error)?;
        bets.sort_by_key(|bet| bet.placed_at);
        Ok(bets)
    }

    async fn outcome_exists_for_round(&self, round_id: RoundId) -> Result<bool, StorageError> {
        Ok(self.db.get(outcome_key(round_id)).map_err(db_error)?.is_some())
    }

    async fn commit_settlement(&self, commit: &SettlementCommit) -> Result<CommitStatus, StorageError> {
        let _guard = self.locked()?;
        let round_id = commit.round_id();
        if self.db.get(outcome_key(round_id)).map_err(db_error)?.is_some() {
            return Ok(CommitStatus::AlreadySettled);
        }

        let mut batch = WriteBatch::default();
        let mut balances = BTreeMap::new();
        for (user_id, credit) in &commit.credits {
            let next = self
                .balance(user_id)?
                .checked_add(*credit)
                .ok_or_else(|| StorageError::Corrupted(format!("balance overflow for {}", user_id)))?;
            if *credit > 0 {
                batch.put(user_key(user_id), next.to_be_bytes());
            }
            balances.insert(user_id.clone(), next);
        }
        for record in &commit.records {
            batch.put(record_key(record), encode(record)?);
        }
        batch.put(outcome_key(round_id), encode(&commit.outcome)?);

        let latest = self
            .db
            .get(LATEST_ROUND_KEY)
            .map_err(db_error)?
            .map(|bytes| decode_amount(&bytes))
            .transpose()?
            .unwrap_or(0);
        if round_id > latest {
            batch.put(LATEST_ROUND_KEY, round_id.to_be_bytes());
        }

        self.db.write(batch).map_err(db_error)?;
        Ok(CommitStatus::Committed { balances })
    }

    async fn recent_outcomes(&self, limit: usize) -> Result<Vec<Outcome>, StorageError> {
        self.scan_prefix(OUTCOME_PREFIX, limit)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    async fn settlement_records_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<SettlementRecord>, StorageError> {
        self.scan_prefix(&record_user_prefix(user_id), limit)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    async fn pending_bets_for_user(&self, user_id: &str) -> Result<Vec<Bet>, StorageError> {
        let mut bets = Vec::new();
        for (_, value) in self.scan_prefix(PENDING_BET_PREFIX, usize::MAX)? {
            let bet: Bet = decode(&value)?;
            if bet.user_id == user_id {
                bets.push(bet);
            }
        }
        Ok(bets)
    }

    async fn latest_round_id(&self) -> Result<Option<RoundId>, StorageError> {
        self.db
            .get(LATEST_ROUND_KEY)
            .map_err(db_error)?
            .map(|bytes| decode_amount(&bytes))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::games::types::{BetSelection, Size};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bet_survives_reopen_and_drains_once() {
        let dir = TempDir::new().unwrap();
        let bet = Bet::new("alice".to_string(), 3, BetSelection::Size(Size::Big), 400);

        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.create_user("alice", 1_000).await.unwrap();
            assert_eq!(store.place_bet(&bet).await.unwrap(), 600);
        }

        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.get_user("alice").await.unwrap().balance, 600);
        assert_eq!(store.pending_bets_for_user("alice").await.unwrap(), vec![bet.clone()]);
        assert_eq!(store.drain_bets_for_round(3).await.unwrap(), vec![bet]);
        assert!(store.drain_bets_for_round(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_settlement_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.create_user("bob", 0).await.unwrap();

        let bet = Bet::new("bob".to_string(), 8, BetSelection::Number(7), 2_000);
        let outcome = Outcome::from_number(8, 7).unwrap();
        let record = SettlementRecord {
            bet,
            outcome_round_id: 8,
            outcome_number: 7,
            win: true,
            payout: 17_460,
            settled_at: outcome.drawn_at,
        };
        let commit = SettlementCommit {
            outcome: outcome.clone(),
            records: vec![record.clone()],
            credits: BTreeMap::from([("bob".to_string(), 17_460)]),
        };

        assert!(matches!(
            store.commit_settlement(&commit).await.unwrap(),
            CommitStatus::Committed { .. }
        ));
        assert_eq!(store.commit_settlement(&commit).await.unwrap(), CommitStatus::AlreadySettled);
        assert_eq!(store.get_user("bob").await.unwrap().balance, 17_460);
        assert_eq!(store.recent_outcomes(10).await.unwrap(), vec![outcome]);
        assert_eq!(store.settlement_records_for_user("bob", 10).await.unwrap(), vec![record]);
        assert_eq!(store.latest_round_id().await.unwrap(), Some(8));
    }
}
