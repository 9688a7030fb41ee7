//! Decimal conversion and rounding.
//!
//! Converted values are a compliance contract: everything is computed in
//! decimal arithmetic (`rust_decimal`), never in binary floating point, and
//! rendered with a fixed number of fractional digits.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Upper bound on configurable fractional precision.
pub const MAX_PRECISION: u32 = 10;

/// Rounding mode applied when reducing a converted value to its
/// configured precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundingMode {
    /// IEEE 754 round-half-to-even.
    #[serde(rename = "BANKERS_ROUND")]
    Bankers,
    /// Classical round-half-away-from-zero.
    #[serde(rename = "ARITHMETIC_ROUND")]
    Arithmetic,
    /// Truncate toward zero. Still reduces to the configured precision.
    #[serde(rename = "NO_ROUND")]
    NoRound,
}

impl RoundingMode {
    fn strategy(self) -> RoundingStrategy {
        match self {
            RoundingMode::Bankers => RoundingStrategy::MidpointNearestEven,
            RoundingMode::Arithmetic => RoundingStrategy::MidpointAwayFromZero,
            RoundingMode::NoRound => RoundingStrategy::ToZero,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoundingMode::Bankers => "BANKERS_ROUND",
            RoundingMode::Arithmetic => "ARITHMETIC_ROUND",
            RoundingMode::NoRound => "NO_ROUND",
        }
    }
}

/// Currency value rounding engine.
#[derive(Debug, Clone, Copy)]
pub struct Engine {
    mode: RoundingMode,
    precision: u32,
}

impl Engine {
    pub fn new(mode: RoundingMode, precision: u32) -> Self {
        Self { mode, precision }
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    /// Reduce `value` to the configured precision under the configured mode.
    pub fn round(&self, value: Decimal) -> Decimal {
        let mut rounded = value.round_dp_with_strategy(self.precision, self.mode.strategy());
        if rounded.is_zero() {
            rounded.set_sign_positive(true);
        }
        rounded
    }

    /// Convert a source integer-denominated value: `source / ratio`, rounded.
    pub fn convert(&self, source: Decimal, ratio: u32) -> Decimal {
        self.round(source / Decimal::from(ratio))
    }

    /// Convert and render as a fixed-point literal.
    pub fn convert_to_literal(&self, source: Decimal, ratio: u32) -> String {
        format_fixed(self.convert(source, ratio), self.precision)
    }
}

/// Render a decimal with exactly `precision` fractional digits.
pub fn format_fixed(value: Decimal, precision: u32) -> String {
    let mut value = value;
    value.rescale(precision);
    value.to_string()
}

/// Parse a SQL numeric literal (plain or scientific form) into a decimal.
pub fn parse_decimal(text: &str) -> Option<Decimal> {
    text.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}
