//! Unit handling
//!
//! The machine works in millimetres; inch-mode input is converted at
//! parse time and never stored.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Input unit system (G20/G21)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    /// Millimetres (G21)
    Mm,
    /// Inches (G20)
    Inch,
}

impl Units {
    /// Conversion factor from this unit to millimetres
    pub fn to_mm(self) -> f64 {
        match self {
            Units::Mm => 1.0,
            Units::Inch => 25.4,
        }
    }
}

impl Default for Units {
    fn default() -> Self {
        Units::Mm
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::Mm => write!(f, "mm"),
            Units::Inch => write!(f, "inch"),
        }
    }
}

impl FromStr for Units {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mm" | "metric" => Ok(Units::Mm),
            "inch" | "in" | "imperial" => Ok(Units::Inch),
            _ => Err(format!("Unknown unit system: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inch_factor() {
        assert_eq!(Units::Inch.to_mm(), 25.4);
        assert_eq!(Units::Mm.to_mm(), 1.0);
    }

    #[test]
    fn parses_aliases() {
        assert_eq!("in".parse::<Units>().unwrap(), Units::Inch);
        assert_eq!("metric".parse::<Units>().unwrap(), Units::Mm);
        assert!("furlong".parse::<Units>().is_err());
    }
}
