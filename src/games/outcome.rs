//! Outcome generation
//!
//! `UniformOutcomeGenerator` is the engine's contract: every number 0–9 is
//! equally likely and rounds are independent. `MinimizePayoutGenerator` is an
//! optional extension that must be selected explicitly in configuration.

use crate::config::{OutcomeConfig, OutcomeStrategy};
use crate::games::settlement::PayoutTable;
use crate::games::types::{color_of, size_of, Bet, Outcome, RoundId};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};

pub trait OutcomeGenerator: Send + Sync {
    /// Draw the outcome for `round_id`. `bets` are the round's wagers;
    /// strategies are free to ignore them.
    fn generate(&self, round_id: RoundId, bets: &[Bet]) -> Outcome;

    fn name(&self) -> &'static str;
}

fn seeded_rng(seed: Option<u64>) -> Mutex<StdRng> {
    Mutex::new(match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    })
}

fn outcome_for(round_id: RoundId, number: u8) -> Outcome {
    let number = number % 10;
    Outcome {
        round_id,
        number,
        color: color_of(number),
        size: size_of(number),
        drawn_at: Utc::now(),
    }
}

/// Uniform draw over 0..=9
pub struct UniformOutcomeGenerator {
    rng: Mutex<StdRng>,
}

impl UniformOutcomeGenerator {
    pub fn new(seed: Option<u64>) -> Self {
        Self { rng: seeded_rng(seed) }
    }
}

impl Default for UniformOutcomeGenerator {
    fn default() -> Self {
        Self::new(None)
    }
}

impl OutcomeGenerator for UniformOutcomeGenerator {
    fn generate(&self, round_id: RoundId, _bets: &[Bet]) -> Outcome {
        let number = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            rng.gen_range(0..10u8)
        };
        outcome_for(round_id, number)
    }

    fn name(&self) -> &'static str {
        "uniform"
    }
}

/// Extension strategy: draws uniformly among the numbers whose gross
/// liability against the round's bets is lowest. Not the default.
pub struct MinimizePayoutGenerator {
    payouts: PayoutTable,
    rng: Mutex<StdRng>,
}

impl MinimizePayoutGenerator {
    pub fn new(payouts: PayoutTable, seed: Option<u64>) -> Self {
        Self {
            payouts,
            rng: seeded_rng(seed),
        }
    }

    /// Gross amount the house would pay out for each possible number
    pub fn liabilities(&self, round_id: RoundId, bets: &[Bet]) -> [u128; 10] {
        let mut liabilities = [0u128; 10];
        for (number, liability) in liabilities.iter_mut().enumerate() {
            let outcome = outcome_for(round_id, number as u8);
            *liability = bets
                .iter()
                .filter(|bet| bet.selection.wins(&outcome))
                .map(|bet| self.payouts.gross(bet))
                .sum();
        }
        liabilities
    }
}

impl OutcomeGenerator for MinimizePayoutGenerator {
    fn generate(&self, round_id: RoundId, bets: &[Bet]) -> Outcome {
        let liabilities = self.liabilities(round_id, bets);
        let lowest = liabilities.iter().copied().min().unwrap_or(0);
        let candidates: Vec<u8> = (0..10u8)
            .filter(|n| liabilities[*n as usize] == lowest)
            .collect();

        let number = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            candidates.choose(&mut *rng).copied().unwrap_or(0)
        };
        outcome_for(round_id, number)
    }

    fn name(&self) -> &'static str {
        "minimize_payout"
    }
}

/// Build the generator selected in configuration
pub fn generator_from_config(config: &OutcomeConfig, payouts: PayoutTable) -> Arc<dyn OutcomeGenerator> {
    match config.strategy {
        OutcomeStrategy::Uniform => Arc::new(UniformOutcomeGenerator::new(config.seed)),
        OutcomeStrategy::MinimizePayout => Arc::new(MinimizePayoutGenerator::new(payouts, config.seed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PayoutConfig;
    use crate::games::types::{BetSelection, Color, Size};

    #[test]
    fn test_uniform_covers_all_digits() {
        let generator = UniformOutcomeGenerator::new(Some(7));
        let mut counts = [0u32; 10];
        for round_id in 0..10_000 {
            let outcome = generator.generate(round_id, &[]);
            assert_eq!(outcome.round_id, round_id);
            counts[outcome.number as usize] += 1;
        }

        // Expected 1000 per digit; a fair draw stays well inside this band
        for count in counts {
            assert!((850..=1150).contains(&count), "skewed counts: {:?}", counts);
        }
    }

    #[test]
    fn test_seeded_generators_repeat() {
        let a = UniformOutcomeGenerator::new(Some(99));
        let b = UniformOutcomeGenerator::new(Some(99));
        let left: Vec<u8> = (0..50).map(|r| a.generate(r, &[]).number).collect();
        let right: Vec<u8> = (0..50).map(|r| b.generate(r, &[]).number).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn test_outcomes_are_internally_consistent() {
        let generator = UniformOutcomeGenerator::new(None);
        for round_id in 0..200 {
            let outcome = generator.generate(round_id, &[]);
            let expected = Outcome::from_number(round_id, outcome.number).unwrap();
            assert_eq!(outcome.color, expected.color);
            assert_eq!(outcome.size, expected.size);
        }
    }

    #[test]
    fn test_minimize_payout_avoids_heavy_numbers() {
        let generator = MinimizePayoutGenerator::new(PayoutTable::from(&PayoutConfig::default()), Some(1));
        let bets = vec![
            Bet::new("a".to_string(), 1, BetSelection::Color(Color::Red), 10_000),
            Bet::new("b".to_string(), 1, BetSelection::Size(Size::Big), 10_000),
            Bet::new("c".to_string(), 1, BetSelection::Color(Color::Green), 10_000),
        ];

        // Only purple-small (0) carries no liability
        for _ in 0..20 {
            assert_eq!(generator.generate(1, &bets).number, 0);
        }
    }

    #[test]
    fn test_minimize_payout_liabilities() {
        let generator = MinimizePayoutGenerator::new(PayoutTable::from(&PayoutConfig::default()), None);
        let bets = vec![Bet::new("a".to_string(), 1, BetSelection::Number(7), 100)];

        let liabilities = generator.liabilities(1, &bets);
        assert_eq!(liabilities[7], 900);
        assert_eq!(liabilities.iter().sum::<u128>(), 900);
    }

    #[test]
    fn test_generator_from_config() {
        let payouts = PayoutTable::from(&PayoutConfig::default());
        let uniform = generator_from_config(&OutcomeConfig::default(), payouts);
        assert_eq!(uniform.name(), "uniform");

        let config = OutcomeConfig {
            strategy: OutcomeStrategy::MinimizePayout,
            seed: Some(3),
        };
        assert_eq!(generator_from_config(&config, payouts).name(), "minimize_payout");
    }
}
