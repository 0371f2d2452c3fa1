//! Fixed-point contract price.
//!
//! Prediction-market prices are probabilities quoted in cents (0–100).
//! Upstream feeds mix integer cents, fractional cents and dollar strings, so
//! the canonical representation is an integer count of hundredths of a cent.
//! Storing ticks instead of floats keeps cached values bit-exact.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ValidationError;

/// Ticks per cent.
pub const TICKS_PER_CENT: u32 = 100;

/// Upper bound: 100 cents.
pub const MAX_TICKS: u32 = 100 * TICKS_PER_CENT;

/// A price in `[0, 100]` cents with 1/100-cent resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Price(u32);

impl Price {
    pub const ZERO: Price = Price(0);
    pub const MAX: Price = Price(MAX_TICKS);

    /// Build from raw ticks (hundredths of a cent).
    pub fn from_ticks(ticks: u32) -> Result<Self, ValidationError> {
        if ticks > MAX_TICKS {
            return Err(ValidationError::PriceOutOfRange(ticks as f64 / TICKS_PER_CENT as f64));
        }
        Ok(Self(ticks))
    }

    /// Build from whole cents (the Kalshi wire format).
    pub fn from_cents(cents: u32) -> Result<Self, ValidationError> {
        Self::from_ticks(cents.saturating_mul(TICKS_PER_CENT))
    }

    /// Build from fractional cents, rounding to the nearest tick.
    pub fn from_cents_f64(cents: f64) -> Result<Self, ValidationError> {
        if !cents.is_finite() || !(0.0..=100.0).contains(&cents) {
            return Err(ValidationError::PriceOutOfRange(cents));
        }
        Self::from_ticks((cents * TICKS_PER_CENT as f64).round() as u32)
    }

    /// Parse a decimal dollar string such as `"0.535"` (Polymarket style).
    ///
    /// Parsing is done on the digits, not through `f64`, so `"0.1234"`
    /// yields exactly 1234 ticks.
    pub fn from_dollars_str(s: &str) -> Result<Self, ValidationError> {
        let s = s.trim();
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(ValidationError::InvalidPrice(s.to_string()));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ValidationError::InvalidPrice(s.to_string()));
        }
        // One dollar == MAX_TICKS, so four fractional digits are exact.
        if frac.len() > 4 && frac[4..].chars().any(|c| c != '0') {
            return Err(ValidationError::InvalidPrice(s.to_string()));
        }
        let whole: u32 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| ValidationError::InvalidPrice(s.to_string()))?
        };
        let mut frac_digits: String = frac.chars().take(4).collect();
        while frac_digits.len() < 4 {
            frac_digits.push('0');
        }
        let frac: u32 = frac_digits
            .parse()
            .map_err(|_| ValidationError::InvalidPrice(s.to_string()))?;
        let ticks = whole
            .checked_mul(MAX_TICKS)
            .and_then(|w| w.checked_add(frac))
            .ok_or_else(|| ValidationError::InvalidPrice(s.to_string()))?;
        Self::from_ticks(ticks)
    }

    pub fn ticks(self) -> u32 {
        self.0
    }

    /// Price in cents as a float, for display and aggregation only.
    pub fn as_cents(self) -> f64 {
        self.0 as f64 / TICKS_PER_CENT as f64
    }
}

impl TryFrom<u32> for Price {
    type Error = ValidationError;

    fn try_from(ticks: u32) -> Result<Self, Self::Error> {
        Self::from_ticks(ticks)
    }
}

impl From<Price> for u32 {
    fn from(p: Price) -> u32 {
        p.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cents = self.0 / TICKS_PER_CENT;
        let rem = self.0 % TICKS_PER_CENT;
        if rem == 0 {
            write!(f, "{cents}¢")
        } else {
            write!(f, "{cents}.{rem:02}¢")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn cents_map_to_ticks() {
        assert_eq!(Price::from_cents(45).unwrap().ticks(), 4500);
        assert_eq!(Price::from_cents(100).unwrap(), Price::MAX);
        assert!(Price::from_cents(101).is_err());
    }

    #[test]
    fn dollar_strings_parse_exactly() {
        assert_eq!(Price::from_dollars_str("0.535").unwrap().ticks(), 5350);
        assert_eq!(Price::from_dollars_str("0.1234").unwrap().ticks(), 1234);
        assert_eq!(Price::from_dollars_str("1").unwrap(), Price::MAX);
        assert_eq!(Price::from_dollars_str(".5").unwrap().ticks(), 5000);
        assert_eq!(Price::from_dollars_str("0.50000").unwrap().ticks(), 5000);
        assert!(Price::from_dollars_str("0.12345").is_err());
        assert!(Price::from_dollars_str("1.01").is_err());
        assert!(Price::from_dollars_str("-0.2").is_err());
        assert!(Price::from_dollars_str("abc").is_err());
    }

    #[test]
    fn fractional_cents_round_to_nearest_tick() {
        assert_eq!(Price::from_cents_f64(53.5).unwrap().ticks(), 5350);
        assert!(Price::from_cents_f64(f64::NAN).is_err());
        assert!(Price::from_cents_f64(-0.01).is_err());
    }

    #[test]
    fn display_formats_cents() {
        assert_eq!(Price::from_cents(7).unwrap().to_string(), "7¢");
        assert_eq!(Price::from_ticks(5350).unwrap().to_string(), "53.50¢");
    }

    #[test]
    fn serde_rejects_out_of_range_ticks() {
        let ok: Price = serde_json::from_str("4500").unwrap();
        assert_eq!(ok.ticks(), 4500);
        assert!(serde_json::from_str::<Price>("10001").is_err());
    }

    proptest! {
        #[test]
        fn from_ticks_accepts_exactly_the_bounded_range(ticks in 0u32..20_000) {
            let parsed = Price::from_ticks(ticks);
            prop_assert_eq!(parsed.is_ok(), ticks <= MAX_TICKS);
            if let Ok(p) = parsed {
                prop_assert!(p >= Price::ZERO && p <= Price::MAX);
            }
        }
    }
}
