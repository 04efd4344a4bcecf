//! Train and unit identifiers recovered from submission file names.
//!
//! Extraction runs an ordered list of strategies after the train token has
//! been found. The first strategy returning a pair wins; there is no scoring
//! across strategies.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use wts_core::{TrainId, UnitNumber};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("no train token in file name {0:?}")]
    NoTrainToken(String),
    #[error("no unit pair recoverable for {train} in file name {file_name:?}")]
    NoUnitPair { train: TrainId, file_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedIdentifier {
    pub train_id: TrainId,
    pub unit1: UnitNumber,
    pub unit2: UnitNumber,
    /// Name of the strategy that produced the pair.
    pub strategy: &'static str,
}

/// Static train id to unit pair table, the last-resort strategy.
#[derive(Debug, Clone, Default)]
pub struct TrainUnitTable {
    pairs: BTreeMap<TrainId, (UnitNumber, UnitNumber)>,
}

impl TrainUnitTable {
    pub fn insert(&mut self, train: TrainId, unit1: UnitNumber, unit2: UnitNumber) {
        self.pairs.insert(train, (unit1, unit2));
    }

    pub fn get(&self, train: TrainId) -> Option<&(UnitNumber, UnitNumber)> {
        self.pairs.get(&train)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// What every strategy gets to look at.
pub struct StrategyInput<'a> {
    pub file_name: &'a str,
    pub train_id: TrainId,
    /// File name text following the train token.
    pub after_train_token: &'a str,
    pub series_prefix: &'a str,
    pub table: &'a TrainUnitTable,
}

#[derive(Clone, Copy)]
pub struct ExtractionStrategy {
    pub name: &'static str,
    pub attempt: fn(&StrategyInput<'_>) -> Option<(String, String)>,
}

impl std::fmt::Debug for ExtractionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionStrategy")
            .field("name", &self.name)
            .finish()
    }
}

pub const DEFAULT_STRATEGIES: [ExtractionStrategy; 5] = [
    ExtractionStrategy {
        name: "full_pair",
        attempt: full_pair,
    },
    ExtractionStrategy {
        name: "short_pair",
        attempt: short_pair,
    },
    ExtractionStrategy {
        name: "short_pair_after_train",
        attempt: short_pair_after_train,
    },
    ExtractionStrategy {
        name: "parenthesized_pair",
        attempt: parenthesized_pair,
    },
    ExtractionStrategy {
        name: "train_table",
        attempt: train_table,
    },
];

fn train_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:T|Train\s*)(\d{1,3})\b").expect("valid train token regex")
    })
}

fn full_pair_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{5})\s*(?:&|,|\band\b)\s*(\d{5})\b").expect("valid full pair regex")
    })
}

fn short_pair_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(\d{3})\s*(?:&|,|\band\b)\s*(\d{3})\b").expect("valid short pair regex")
    })
}

fn short_pair_after_train_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[^0-9]*?(\d{3})\s+(\d{3})\b").expect("valid trailing short pair regex")
    })
}

fn parenthesized_pair_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\([^()\d]*(\d{5})[\s,]+(\d{5})\s*\)").expect("valid parenthesized regex")
    })
}

fn captured_pair(re: &Regex, haystack: &str) -> Option<(String, String)> {
    let caps = re.captures(haystack)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

fn full_pair(input: &StrategyInput<'_>) -> Option<(String, String)> {
    captured_pair(full_pair_re(), input.file_name)
}

fn short_pair(input: &StrategyInput<'_>) -> Option<(String, String)> {
    captured_pair(short_pair_re(), input.file_name).map(|(a, b)| {
        (
            format!("{}{a}", input.series_prefix),
            format!("{}{b}", input.series_prefix),
        )
    })
}

fn short_pair_after_train(input: &StrategyInput<'_>) -> Option<(String, String)> {
    captured_pair(short_pair_after_train_re(), input.after_train_token).map(|(a, b)| {
        (
            format!("{}{a}", input.series_prefix),
            format!("{}{b}", input.series_prefix),
        )
    })
}

fn parenthesized_pair(input: &StrategyInput<'_>) -> Option<(String, String)> {
    captured_pair(parenthesized_pair_re(), input.file_name)
}

fn train_table(input: &StrategyInput<'_>) -> Option<(String, String)> {
    input
        .table
        .get(input.train_id)
        .map(|(a, b)| (a.as_str().to_string(), b.as_str().to_string()))
}

#[derive(Debug, Clone)]
pub struct IdentifierExtractor {
    strategies: Vec<ExtractionStrategy>,
    series_prefix: String,
    table: TrainUnitTable,
}

impl IdentifierExtractor {
    pub fn new(series_prefix: impl Into<String>, table: TrainUnitTable) -> Self {
        Self::with_strategies(series_prefix, table, DEFAULT_STRATEGIES.to_vec())
    }

    pub fn with_strategies(
        series_prefix: impl Into<String>,
        table: TrainUnitTable,
        strategies: Vec<ExtractionStrategy>,
    ) -> Self {
        Self {
            strategies,
            series_prefix: series_prefix.into(),
            table,
        }
    }

    pub fn strategies(&self) -> &[ExtractionStrategy] {
        &self.strategies
    }

    pub fn extract(&self, file_name: &str) -> Result<ExtractedIdentifier, IdentifierError> {
        let token = train_token_re()
            .captures(file_name)
            .ok_or_else(|| IdentifierError::NoTrainToken(file_name.to_string()))?;
        let train_id = token[1]
            .parse::<u16>()
            .map(TrainId::new)
            .map_err(|_| IdentifierError::NoTrainToken(file_name.to_string()))?;
        let token_end = token.get(0).map(|m| m.end()).unwrap_or(0);

        let input = StrategyInput {
            file_name,
            train_id,
            after_train_token: &file_name[token_end..],
            series_prefix: &self.series_prefix,
            table: &self.table,
        };

        for strategy in &self.strategies {
            let Some((a, b)) = (strategy.attempt)(&input) else {
                continue;
            };
            // A strategy that yields something other than two unit numbers
            // counts as a miss.
            if let (Ok(unit1), Ok(unit2)) = (UnitNumber::parse(&a), UnitNumber::parse(&b)) {
                return Ok(ExtractedIdentifier {
                    train_id,
                    unit1,
                    unit2,
                    strategy: strategy.name,
                });
            }
        }

        Err(IdentifierError::NoUnitPair {
            train: train_id,
            file_name: file_name.to_string(),
        })
    }
}
