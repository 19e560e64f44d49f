//! Error types for the colorbet round engine
//!
//! User-facing bet rejections, storage failures on the settlement path,
//! configuration problems and clock drift each get their own enum. The root
//! `ColorbetError` aggregates them for callers that do not care which layer
//! failed.

use crate::games::types::{Amount, RoundId};
use std::time::Duration;

/// Root error type for all colorbet operations
#[derive(Debug, thiserror::Error)]
pub enum ColorbetError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Bet rejected: {0}")]
    Bet(#[from] BetError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Round clock is already running")]
    AlreadyRunning,
}

/// Configuration loading and validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Failures reported by a `Store` implementation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage operation timed out after {0}ms")]
    Timeout(u64),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("User already exists: {0}")]
    UserExists(String),

    #[error("Balance of {user_id} cannot absorb {delta} (balance {balance})")]
    NegativeBalance {
        user_id: String,
        balance: Amount,
        delta: i64,
    },

    #[error("Corrupted data: {0}")]
    Corrupted(String),
}

/// Reasons a bet placement is rejected
///
/// Everything except `Storage` is a final answer for the caller; nothing has
/// been debited when any of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BetError {
    #[error("Betting is closed for round {round_id}")]
    BettingClosed { round_id: RoundId },

    #[error("Invalid bet category '{0}' (expected color, size or number)")]
    InvalidCategory(String),

    #[error("Invalid value '{value}' for {category} bet")]
    InvalidValue { category: String, value: String },

    #[error("Stake must be positive")]
    InvalidStake,

    #[error("Insufficient funds: balance {balance}, stake {stake}")]
    InsufficientFunds { balance: Amount, stake: Amount },

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Storage failure while placing bet: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for BetError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::UserNotFound(user_id) => BetError::UserNotFound(user_id),
            StorageError::NegativeBalance { balance, delta, .. } => BetError::InsufficientFunds {
                balance,
                stake: delta.unsigned_abs(),
            },
            other => BetError::Storage(other),
        }
    }
}

/// Settlement-path failures; the round stays locked and is retried
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettlementError {
    #[error("Storage unavailable during settlement of round {round_id}: {source}")]
    StorageUnavailable {
        round_id: RoundId,
        #[source]
        source: StorageError,
    },
}

impl SettlementError {
    pub fn round_id(&self) -> RoundId {
        match self {
            SettlementError::StorageUnavailable { round_id, .. } => *round_id,
        }
    }
}

/// A tick arrived later than the configured tolerance allows.
///
/// Never fatal; logged and counted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Clock drift: tick arrived after {actual:?}, expected every {expected:?}")]
pub struct ClockDrift {
    pub expected: Duration,
    pub actual: Duration,
}

impl From<std::io::Error> for ColorbetError {
    fn from(e: std::io::Error) -> Self {
        ColorbetError::Configuration(ConfigurationError::LoadFailed(e.to_string()))
    }
}

// Convenience type alias for Results
pub type ColorbetResult<T> = Result<T, ColorbetError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_display() {
        let config_error = ConfigurationError::ValidationFailed("test".to_string());
        let error = ColorbetError::Configuration(config_error);

        assert!(error.to_string().contains("Configuration error"));
        assert!(error.to_string().contains("test"));
    }

    #[test]
    fn test_negative_balance_maps_to_insufficient_funds() {
        let storage = StorageError::NegativeBalance {
            user_id: "alice".to_string(),
            balance: 500,
            delta: -1_000,
        };

        assert_eq!(
            BetError::from(storage),
            BetError::InsufficientFunds {
                balance: 500,
                stake: 1_000
            }
        );
    }

    #[test]
    fn test_unknown_user_maps_to_user_not_found() {
        let err: BetError = StorageError::UserNotFound("ghost".to_string()).into();
        assert_eq!(err, BetError::UserNotFound("ghost".to_string()));

        let err: BetError = StorageError::Timeout(100).into();
        assert!(matches!(err, BetError::Storage(StorageError::Timeout(100))));
    }

    #[test]
    fn test_settlement_error_source() {
        let err = SettlementError::StorageUnavailable {
            round_id: 7,
            source: StorageError::Unavailable("down".to_string()),
        };

        assert_eq!(err.round_id(), 7);
        assert!(err.source().is_some());
        assert!(err.to_string().contains("round 7"));
    }
}
