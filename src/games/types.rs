use crate::errors::BetError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Monotonically increasing round identifier
pub type RoundId = u64;

/// Opaque user reference owned by the excluded auth layer
pub type UserId = String;

/// Balance/stake/payout amount in minor units (1/100 of the display currency)
pub type Amount = u64;

/// Round phase; only `Open` accepts bets
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Open,
    Locked,
    Settled,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Open => write!(f, "open"),
            Phase::Locked => write!(f, "locked"),
            Phase::Settled => write!(f, "settled"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Red,
    Green,
    Purple,
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::Red => write!(f, "red"),
            Color::Green => write!(f, "green"),
            Color::Purple => write!(f, "purple"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Size {
    Big,
    Small,
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Size::Big => write!(f, "big"),
            Size::Small => write!(f, "small"),
        }
    }
}

/// Fixed number → color table
pub const COLOR_TABLE: [Color; 10] = [
    Color::Purple, // 0
    Color::Red,    // 1
    Color::Green,  // 2
    Color::Red,    // 3
    Color::Green,  // 4
    Color::Purple, // 5
    Color::Green,  // 6
    Color::Red,    // 7
    Color::Green,  // 8
    Color::Red,    // 9
];

/// Numbers at or above this threshold are `big`
pub const BIG_THRESHOLD: u8 = 5;

pub fn color_of(number: u8) -> Color {
    COLOR_TABLE[(number % 10) as usize]
}

pub fn size_of(number: u8) -> Size {
    if number % 10 >= BIG_THRESHOLD {
        Size::Big
    } else {
        Size::Small
    }
}

/// The kind of wager, as named on the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BetCategory {
    Color,
    Size,
    Number,
}

impl fmt::Display for BetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetCategory::Color => write!(f, "color"),
            BetCategory::Size => write!(f, "size"),
            BetCategory::Number => write!(f, "number"),
        }
    }
}

impl FromStr for BetCategory {
    type Err = BetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "color" => Ok(BetCategory::Color),
            "size" => Ok(BetCategory::Size),
            "number" => Ok(BetCategory::Number),
            _ => Err(BetError::InvalidCategory(s.to_string())),
        }
    }
}

/// A category together with a value that is legal for it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "category", content = "value", rename_all = "lowercase")]
pub enum BetSelection {
    Color(Color),
    Size(Size),
    Number(u8),
}

impl BetSelection {
    /// Parse the raw `(category, value)` pair submitted by a client
    pub fn parse(category: &str, value: &str) -> Result<Self, BetError> {
        let category: BetCategory = category.parse()?;
        let raw = value.trim().to_ascii_lowercase();
        let invalid = || BetError::InvalidValue {
            category: category.to_string(),
            value: value.to_string(),
        };

        let selection = match category {
            BetCategory::Color => match raw.as_str() {
                "red" => BetSelection::Color(Color::Red),
                "green" => BetSelection::Color(Color::Green),
                "purple" => BetSelection::Color(Color::Purple),
                _ => return Err(invalid()),
            },
            BetCategory::Size => match raw.as_str() {
                "big" => BetSelection::Size(Size::Big),
                "small" => BetSelection::Size(Size::Small),
                _ => return Err(invalid()),
            },
            BetCategory::Number => {
                let number: u8 = raw.parse().map_err(|_| invalid())?;
                BetSelection::Number(number)
            }
        };

        selection.validate()?;
        Ok(selection)
    }

    /// Reject number selections outside 0..=9
    pub fn validate(&self) -> Result<(), BetError> {
        match self {
            BetSelection::Number(n) if *n > 9 => Err(BetError::InvalidValue {
                category: BetCategory::Number.to_string(),
                value: n.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn category(&self) -> BetCategory {
        match self {
            BetSelection::Color(_) => BetCategory::Color,
            BetSelection::Size(_) => BetCategory::Size,
            BetSelection::Number(_) => BetCategory::Number,
        }
    }

    /// Whether this selection wins against `outcome`. Pure.
    pub fn wins(&self, outcome: &Outcome) -> bool {
        match self {
            BetSelection::Color(color) => *color == outcome.color,
            BetSelection::Size(size) => *size == outcome.size,
            BetSelection::Number(number) => *number == outcome.number,
        }
    }
}

impl fmt::Display for BetSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BetSelection::Color(c) => write!(f, "color:{}", c),
            BetSelection::Size(s) => write!(f, "size:{}", s),
            BetSelection::Number(n) => write!(f, "number:{}", n),
        }
    }
}

/// A single wager against one round. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bet {
    pub bet_id: Uuid,
    pub user_id: UserId,
    pub round_id: RoundId,
    #[serde(flatten)]
    pub selection: BetSelection,
    pub stake: Amount,
    pub placed_at: DateTime<Utc>,
}

impl Bet {
    pub fn new(user_id: UserId, round_id: RoundId, selection: BetSelection, stake: Amount) -> Self {
        Self {
            bet_id: Uuid::new_v4(),
            user_id,
            round_id,
            selection,
            stake,
            placed_at: Utc::now(),
        }
    }
}

/// The drawn number of a round and its derived color and size
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Outcome {
    pub round_id: RoundId,
    pub number: u8,
    pub color: Color,
    pub size: Size,
    pub drawn_at: DateTime<Utc>,
}

impl Outcome {
    /// Build the outcome for `number`, or `None` if it is not a single digit
    pub fn from_number(round_id: RoundId, number: u8) -> Option<Self> {
        if number > 9 {
            return None;
        }
        Some(Self {
            round_id,
            number,
            color: color_of(number),
            size: size_of(number),
            drawn_at: Utc::now(),
        })
    }
}

/// Audit entry written for every settled bet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettlementRecord {
    pub bet: Bet,
    pub outcome_round_id: RoundId,
    pub outcome_number: u8,
    pub win: bool,
    pub payout: Amount,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub user_id: UserId,
    pub balance: Amount,
}

/// Read-only view of the clock, published after every transition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundSnapshot {
    pub round_id: RoundId,
    pub phase: Phase,
    pub countdown: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_table_matches_lookup() {
        let expected = [
            "purple", "red", "green", "red", "green", "purple", "green", "red", "green", "red",
        ];
        for (number, color) in expected.iter().enumerate() {
            let outcome = Outcome::from_number(1, number as u8).expect("digit");
            assert_eq!(outcome.color.to_string(), *color);
            let size = if number >= 5 { Size::Big } else { Size::Small };
            assert_eq!(outcome.size, size);
        }
    }

    #[test]
    fn test_outcome_rejects_non_digit() {
        assert!(Outcome::from_number(1, 10).is_none());
    }

    #[test]
    fn test_parse_selection() {
        assert_eq!(
            BetSelection::parse("color", "Green").unwrap(),
            BetSelection::Color(Color::Green)
        );
        assert_eq!(
            BetSelection::parse("size", "small").unwrap(),
            BetSelection::Size(Size::Small)
        );
        assert_eq!(
            BetSelection::parse("number", "7").unwrap(),
            BetSelection::Number(7)
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            BetSelection::parse("parity", "odd"),
            Err(BetError::InvalidCategory(_))
        ));
        assert!(matches!(
            BetSelection::parse("color", "blue"),
            Err(BetError::InvalidValue { .. })
        ));
        assert!(matches!(
            BetSelection::parse("size", "7"),
            Err(BetError::InvalidValue { .. })
        ));
        assert!(matches!(
            BetSelection::parse("number", "10"),
            Err(BetError::InvalidValue { .. })
        ));
        assert!(matches!(
            BetSelection::parse("number", "-1"),
            Err(BetError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_bet_wire_shape() {
        let bet = Bet::new("alice".to_string(), 3, BetSelection::Color(Color::Red), 1_000);
        let json = serde_json::to_value(&bet).unwrap();

        assert_eq!(json["category"], "color");
        assert_eq!(json["value"], "red");
        assert_eq!(json["round_id"], 3);
        assert_eq!(json["stake"], 1_000);

        let back: Bet = serde_json::from_value(json).unwrap();
        assert_eq!(back, bet);
    }
}
