//! Mass units and gram arithmetic for nutrient amounts.
//!
//! # Responsibility
//! - Convert between grams, milligrams and micrograms.
//! - Pick the most readable unit for a gram value.
//! - Suppress binary floating-point residue in derived gram values.
//!
//! # Invariants
//! - Conversion factors are fixed: g=1, mg=1e-3, µg=1e-6.
//! - Unknown unit input resolves to grams, never to an error.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Number of decimal places kept for gram values derived from deltas.
pub const GRAM_PRECISION_DECIMALS: i32 = 6;

const MILLIGRAM_THRESHOLD_GRAMS: f64 = 1e-3;
const GRAM_THRESHOLD_GRAMS: f64 = 1.0;

/// Mass unit attached to every nutrient amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MassUnit {
    #[default]
    Grams,
    Milligrams,
    Micrograms,
}

impl MassUnit {
    /// Grams per one unit.
    pub fn factor(self) -> f64 {
        match self {
            Self::Grams => 1.0,
            Self::Milligrams => 1e-3,
            Self::Micrograms => 1e-6,
        }
    }

    /// Short symbol used in logs, storage and CLI output.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Grams => "g",
            Self::Milligrams => "mg",
            Self::Micrograms => "ug",
        }
    }

    /// Converts `amount` in this unit to grams.
    pub fn to_grams(self, amount: f64) -> f64 {
        amount * self.factor()
    }

    /// Converts a gram value into this unit.
    pub fn from_grams(self, grams: f64) -> f64 {
        grams / self.factor()
    }

    /// Returns the most readable unit for a gram value.
    ///
    /// `< 1e-3 g` → micrograms, `[1e-3, 1) g` → milligrams, `>= 1 g` → grams.
    /// Zero is kept in grams so an emptied node does not flip to µg.
    pub fn best_for_grams(grams: f64) -> Self {
        let magnitude = grams.abs();
        if magnitude == 0.0 || magnitude >= GRAM_THRESHOLD_GRAMS {
            Self::Grams
        } else if magnitude >= MILLIGRAM_THRESHOLD_GRAMS {
            Self::Milligrams
        } else {
            Self::Micrograms
        }
    }

    /// Parses unit text leniently. Unrecognized input defaults to grams.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().trim_end_matches('.').to_ascii_lowercase().as_str() {
            "mg" | "milligram" | "milligrams" => Self::Milligrams,
            "ug" | "µg" | "μg" | "mcg" | "microgram" | "micrograms" => Self::Micrograms,
            _ => Self::Grams,
        }
    }

    /// Parses the storage symbol. Returns `None` for unknown symbols so that
    /// repository reads can reject corrupted rows.
    pub fn from_symbol(value: &str) -> Option<Self> {
        match value {
            "g" => Some(Self::Grams),
            "mg" => Some(Self::Milligrams),
            "ug" => Some(Self::Micrograms),
            _ => None,
        }
    }
}

impl Display for MassUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Rounds a gram value to 6 decimal places.
///
/// Intended-zero results such as `3e-8` collapse to `0.0`.
pub fn round_grams(grams: f64) -> f64 {
    let scale = 10f64.powi(GRAM_PRECISION_DECIMALS);
    let rounded = (grams * scale).round() / scale;
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// Compares two gram values at storage precision.
pub fn grams_eq(left: f64, right: f64) -> bool {
    round_grams(left) == round_grams(right)
}

#[cfg(test)]
mod tests {
    use super::{grams_eq, round_grams, MassUnit};

    #[test]
    fn best_unit_follows_thresholds() {
        assert_eq!(MassUnit::best_for_grams(0.0005), MassUnit::Micrograms);
        assert_eq!(MassUnit::best_for_grams(0.001), MassUnit::Milligrams);
        assert_eq!(MassUnit::best_for_grams(0.5), MassUnit::Milligrams);
        assert_eq!(MassUnit::best_for_grams(1.0), MassUnit::Grams);
        assert_eq!(MassUnit::best_for_grams(0.0), MassUnit::Grams);
    }

    #[test]
    fn conversion_chain_preserves_gram_value() {
        let grams = 2.345_678;
        let mg = MassUnit::Milligrams.from_grams(grams);
        let ug = MassUnit::Micrograms.from_grams(MassUnit::Milligrams.to_grams(mg));
        let back = MassUnit::Micrograms.to_grams(ug);
        assert!((back - grams).abs() < 1e-6);
    }

    #[test]
    fn rounding_removes_float_residue() {
        assert_eq!(round_grams(3e-8), 0.0);
        assert_eq!(round_grams(0.1 + 0.2), 0.3);
        assert!(grams_eq(1.000_000_4, 1.0));
    }

    #[test]
    fn unknown_unit_text_defaults_to_grams() {
        assert_eq!(MassUnit::parse_lenient("MG"), MassUnit::Milligrams);
        assert_eq!(MassUnit::parse_lenient(" mcg "), MassUnit::Micrograms);
        assert_eq!(MassUnit::parse_lenient("kcal"), MassUnit::Grams);
        assert_eq!(MassUnit::parse_lenient(""), MassUnit::Grams);
    }
}
