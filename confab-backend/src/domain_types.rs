//! Domain value types shared across the ledger core
//!
//! `Usdc` is a fixed-point stablecoin amount in micro-units (6 decimals), the
//! same unit the token contract uses on chain, so a decoded `Transfer` value
//! and a ledger balance compare without rounding.

use ethers::types::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const MICROS_PER_UNIT: i64 = 1_000_000;
const DECIMALS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Usdc(i64);

impl Usdc {
    pub const ZERO: Usdc = Usdc(0);

    pub const fn from_micros(micros: i64) -> Self {
        Usdc(micros)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, other: Usdc) -> Option<Usdc> {
        self.0.checked_add(other.0).map(Usdc)
    }

    pub fn checked_sub(self, other: Usdc) -> Option<Usdc> {
        self.0.checked_sub(other.0).map(Usdc)
    }

    /// Convert a raw token amount (6-decimal units). `None` if it does not fit.
    pub fn from_token_units(value: U256) -> Option<Usdc> {
        if value > U256::from(i64::MAX as u64) {
            return None;
        }
        Some(Usdc(value.as_u64() as i64))
    }
}

impl fmt::Display for Usdc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let whole = abs / MICROS_PER_UNIT as u64;
        let frac = format!("{:06}", abs % MICROS_PER_UNIT as u64);
        let trimmed = frac.trim_end_matches('0');
        let frac = if trimmed.len() < 2 { &frac[..2] } else { trimmed };
        write!(f, "{}{}.{}", sign, whole, frac)
    }
}

impl FromStr for Usdc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty amount".to_string());
        }
        if s.starts_with('-') || s.starts_with('+') {
            return Err(format!("amount must be unsigned: '{}'", s));
        }

        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(format!("invalid amount: '{}'", s));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid amount: '{}'", s));
        }
        if frac.len() > DECIMALS {
            return Err(format!("amount has more than {} decimals: '{}'", DECIMALS, s));
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| format!("amount too large: '{}'", s))?
        };
        let frac_micros: i64 = if frac.is_empty() {
            0
        } else {
            format!("{:0<6}", frac)
                .parse()
                .map_err(|_| format!("invalid amount: '{}'", s))?
        };

        whole
            .checked_mul(MICROS_PER_UNIT)
            .and_then(|w| w.checked_add(frac_micros))
            .map(Usdc)
            .ok_or_else(|| format!("amount too large: '{}'", s))
    }
}

impl Serialize for Usdc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Usdc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(serde_json::Number),
        }

        let text = match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s,
            Raw::Number(n) => n.to_string(),
        };
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal_amounts() {
        assert_eq!("0.50".parse::<Usdc>().unwrap(), Usdc::from_micros(500_000));
        assert_eq!("1.5".parse::<Usdc>().unwrap(), Usdc::from_micros(1_500_000));
        assert_eq!("2".parse::<Usdc>().unwrap(), Usdc::from_micros(2_000_000));
        assert_eq!(".25".parse::<Usdc>().unwrap(), Usdc::from_micros(250_000));
        assert_eq!("0.000001".parse::<Usdc>().unwrap(), Usdc::from_micros(1));
        assert_eq!("  3.10 ".parse::<Usdc>().unwrap(), Usdc::from_micros(3_100_000));
    }

    #[test]
    fn test_parse_rejects_bad_amounts() {
        assert!("".parse::<Usdc>().is_err());
        assert!("-1".parse::<Usdc>().is_err());
        assert!("1.0000001".parse::<Usdc>().is_err());
        assert!("abc".parse::<Usdc>().is_err());
        assert!("1.2.3".parse::<Usdc>().is_err());
        assert!(".".parse::<Usdc>().is_err());
    }

    #[test]
    fn test_display_keeps_two_decimals() {
        assert_eq!(Usdc::from_micros(500_000).to_string(), "0.50");
        assert_eq!(Usdc::from_micros(1_000_000).to_string(), "1.00");
        assert_eq!(Usdc::from_micros(1_234_500).to_string(), "1.2345");
        assert_eq!(Usdc::ZERO.to_string(), "0.00");
    }

    #[test]
    fn test_json_accepts_string_or_number() {
        let a: Usdc = serde_json::from_value(serde_json::json!("0.30")).unwrap();
        let b: Usdc = serde_json::from_value(serde_json::json!(0.3)).unwrap();
        let c: Usdc = serde_json::from_value(serde_json::json!(2)).unwrap();
        assert_eq!(a, b);
        assert_eq!(c, Usdc::from_micros(2_000_000));
        assert_eq!(serde_json::to_value(a).unwrap(), serde_json::json!("0.30"));
    }

    #[test]
    fn test_from_token_units() {
        assert_eq!(Usdc::from_token_units(U256::from(1_500_000u64)), Some(Usdc::from_micros(1_500_000)));
        assert_eq!(Usdc::from_token_units(U256::MAX), None);
    }
}
