pub mod clock;
pub mod ledger;
pub mod outcome;
pub mod settlement;
pub mod types;

pub use clock::{DrawnRound, RoundClock, RoundState, TickReport};
pub use ledger::{BetLedger, BettingWindow, PlacedBet};
pub use outcome::{generator_from_config, MinimizePayoutGenerator, OutcomeGenerator, UniformOutcomeGenerator};
pub use settlement::{PayoutTable, SettlementEngine, SettlementOutcome, SettlementSummary};
pub use types::*;
