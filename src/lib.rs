//! Colorbet - round lifecycle engine for a color/number betting game
//!
//! A fixed-cadence clock opens and closes betting rounds, draws an outcome
//! from 0-9 (mapped to a color and a size), and settles every wager of the
//! closed round against it in a single atomic store commit. Bet placement is
//! safe under concurrent callers; notifications are best effort.

pub mod config;
pub mod engine;
pub mod errors;
pub mod games;
pub mod metrics;
pub mod notifications;
pub mod storage;

pub use config::{ConfigBuilder, ConfigLoader, GameConfig};
pub use engine::{EngineHandle, GameEngine};
pub use errors::{BetError, ColorbetError, ColorbetResult, SettlementError, StorageError};
pub use games::{
    Bet, BetSelection, Color, Outcome, Phase, RoundClock, RoundSnapshot, RoundState, SettlementRecord, Size,
    TickReport,
};
pub use notifications::{ChannelNotifier, GameEvent, NotificationSink};
pub use storage::{open_store, MemoryStore, Store};
