//! Coin amounts held in escrow.
//!
//! [`Coins`] is the canonical multiset form: sorted by denom, one entry per
//! denom, every amount strictly positive. Every constructor enforces that,
//! so any `Coins` value in the system is already normalized.

use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{LockupError, Result, constants};

/// Check a denomination string: 2..=128 chars, leading ASCII letter, then
/// ASCII alphanumerics or `/ : . _ -`.
///
/// # Errors
/// Returns `InvalidDenom` if the string breaks any of those rules.
pub fn validate_denom(denom: &str) -> Result<()> {
    let len = denom.chars().count();
    let mut chars = denom.chars();
    let leading_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let rest_ok =
        chars.all(|c| c.is_ascii_alphanumeric() || constants::DENOM_EXTRA_CHARS.contains(&c));
    if (constants::MIN_DENOM_LEN..=constants::MAX_DENOM_LEN).contains(&len) && leading_ok && rest_ok
    {
        Ok(())
    } else {
        Err(LockupError::InvalidDenom(denom.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Coin
// ---------------------------------------------------------------------------

/// A single positive amount of one denomination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: Decimal,
}

impl Coin {
    /// # Errors
    /// Returns `InvalidDenom` or `InvalidCoins` for a bad denom or a
    /// non-positive amount.
    pub fn new(denom: impl Into<String>, amount: Decimal) -> Result<Self> {
        let coin = Self {
            denom: denom.into(),
            amount,
        };
        coin.validate()?;
        Ok(coin)
    }

    fn validate(&self) -> Result<()> {
        validate_denom(&self.denom)?;
        if self.amount <= Decimal::ZERO {
            return Err(LockupError::InvalidCoins {
                reason: format!("non-positive amount {} for {}", self.amount, self.denom),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

// ---------------------------------------------------------------------------
// Coins
// ---------------------------------------------------------------------------

/// Sorted, denom-unique, strictly positive set of coins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Coin>", into = "Vec<Coin>")]
pub struct Coins(Vec<Coin>);

impl Coins {
    /// Normalize a list of coins.
    ///
    /// # Errors
    /// Returns `InvalidCoins` on duplicate denoms or non-positive amounts,
    /// and `InvalidDenom` on malformed denoms.
    pub fn new(mut coins: Vec<Coin>) -> Result<Self> {
        for coin in &coins {
            coin.validate()?;
        }
        coins.sort_by(|a, b| a.denom.cmp(&b.denom));
        if let Some(pair) = coins.windows(2).find(|w| w[0].denom == w[1].denom) {
            return Err(LockupError::InvalidCoins {
                reason: format!("duplicate denom {}", pair[0].denom),
            });
        }
        Ok(Self(coins))
    }

    #[must_use]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Shorthand for a single-coin set.
    ///
    /// # Errors
    /// Same as [`Coin::new`].
    pub fn single(denom: impl Into<String>, amount: Decimal) -> Result<Self> {
        Ok(Self(vec![Coin::new(denom, amount)?]))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Coin> {
        self.0.iter()
    }

    /// Denominations in ascending order.
    pub fn denoms(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|c| c.denom.as_str())
    }

    /// Amount held of `denom`, zero if absent.
    #[must_use]
    pub fn amount_of(&self, denom: &str) -> Decimal {
        self.0
            .binary_search_by(|c| c.denom.as_str().cmp(denom))
            .map_or(Decimal::ZERO, |i| self.0[i].amount)
    }

    /// The only coin, if exactly one denomination is held.
    #[must_use]
    pub fn as_single(&self) -> Option<&Coin> {
        match self.0.as_slice() {
            [coin] => Some(coin),
            _ => None,
        }
    }

    /// Sum of two coin sets.
    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        for coin in &other.0 {
            match merged.binary_search_by(|c| c.denom.cmp(&coin.denom)) {
                Ok(i) => merged[i].amount += coin.amount,
                Err(i) => merged.insert(i, coin.clone()),
            }
        }
        Self(merged)
    }

    /// `self - other`, or `None` if any denom of `other` exceeds what is held.
    /// Denoms that reach zero are dropped.
    #[must_use]
    pub fn checked_sub(&self, other: &Self) -> Option<Self> {
        let mut remaining = self.0.clone();
        for coin in &other.0 {
            let i = remaining
                .binary_search_by(|c| c.denom.cmp(&coin.denom))
                .ok()?;
            if remaining[i].amount < coin.amount {
                return None;
            }
            remaining[i].amount -= coin.amount;
        }
        remaining.retain(|c| c.amount > Decimal::ZERO);
        Some(Self(remaining))
    }

    /// True if every denom of `other` is held in at least that amount.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        other.iter().all(|c| self.amount_of(&c.denom) >= c.amount)
    }

    /// Deterministic fixture: `amount` of `denom`.
    #[cfg(any(test, feature = "test-helpers"))]
    #[must_use]
    pub fn dummy(amount: i64, denom: &str) -> Self {
        Self(vec![Coin {
            denom: denom.to_string(),
            amount: Decimal::new(amount, 0),
        }])
    }
}

impl TryFrom<Vec<Coin>> for Coins {
    type Error = LockupError;

    fn try_from(coins: Vec<Coin>) -> Result<Self> {
        Self::new(coins)
    }
}

impl From<Coins> for Vec<Coin> {
    fn from(coins: Coins) -> Self {
        coins.0
    }
}

impl From<Coin> for Coins {
    fn from(coin: Coin) -> Self {
        Self(vec![coin])
    }
}

impl fmt::Display for Coins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, coin) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{coin}")?;
        }
        Ok(())
    }
}

impl FromStr for Coins {
    type Err = LockupError;

    /// Parses `"10stake,5uosmo"`. An empty string is the empty set.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::empty());
        }
        let mut coins = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            let split = part
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(|| LockupError::InvalidCoins {
                    reason: format!("missing denom in {part:?}"),
                })?;
            let (amount, denom) = part.split_at(split);
            let amount = Decimal::from_str(amount).map_err(|e| LockupError::InvalidCoins {
                reason: format!("bad amount in {part:?}: {e}"),
            })?;
            coins.push(Coin::new(denom, amount)?);
        }
        Self::new(coins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coins(s: &str) -> Coins {
        s.parse().unwrap()
    }

    #[test]
    fn denom_rules() {
        assert!(validate_denom("stake").is_ok());
        assert!(validate_denom("gamm/pool/1").is_ok());
        assert!(validate_denom("ibc/27394FB092D2ECCD").is_ok());
        assert!(validate_denom("s").is_err());
        assert!(validate_denom("1stake").is_err());
        assert!(validate_denom("sta ke").is_err());
        assert!(validate_denom(&"a".repeat(129)).is_err());
    }

    #[test]
    fn new_sorts_and_rejects_duplicates() {
        let c = Coins::new(vec![
            Coin::new("uosmo", Decimal::new(5, 0)).unwrap(),
            Coin::new("stake", Decimal::new(10, 0)).unwrap(),
        ])
        .unwrap();
        assert_eq!(c.denoms().collect::<Vec<_>>(), vec!["stake", "uosmo"]);

        let dup = Coins::new(vec![
            Coin::new("stake", Decimal::ONE).unwrap(),
            Coin::new("stake", Decimal::ONE).unwrap(),
        ]);
        assert!(matches!(dup, Err(LockupError::InvalidCoins { .. })));
    }

    #[test]
    fn non_positive_amounts_rejected() {
        assert!(Coin::new("stake", Decimal::ZERO).is_err());
        assert!(Coin::new("stake", Decimal::NEGATIVE_ONE).is_err());
        assert!("0stake".parse::<Coins>().is_err());
    }

    #[test]
    fn parse_and_display() {
        let c = coins("5uosmo,10stake");
        assert_eq!(c.to_string(), "10stake,5uosmo");
        assert_eq!(c.amount_of("uosmo"), Decimal::new(5, 0));
        assert_eq!(c.amount_of("atom"), Decimal::ZERO);
        assert_eq!(coins("1.5stake").amount_of("stake"), Decimal::new(15, 1));
        assert!(coins("").is_empty());
        assert!("stake".parse::<Coins>().is_err());
        assert!("10".parse::<Coins>().is_err());
    }

    #[test]
    fn add_merges_denoms() {
        let sum = coins("10stake").add(&coins("5stake,3uosmo"));
        assert_eq!(sum, coins("15stake,3uosmo"));
    }

    #[test]
    fn checked_sub_drops_zeroes_and_detects_shortfall() {
        let held = coins("10stake,3uosmo");
        assert_eq!(held.checked_sub(&coins("3uosmo")), Some(coins("10stake")));
        assert_eq!(held.checked_sub(&held), Some(Coins::empty()));
        assert_eq!(held.checked_sub(&coins("11stake")), None);
        assert_eq!(held.checked_sub(&coins("1atom")), None);
        assert!(held.covers(&coins("10stake")));
        assert!(!held.covers(&coins("1atom")));
    }

    #[test]
    fn single_coin_accessor() {
        assert_eq!(coins("10stake").as_single().unwrap().denom, "stake");
        assert!(coins("10stake,1uosmo").as_single().is_none());
        assert!(Coins::empty().as_single().is_none());
    }

    #[test]
    fn serde_enforces_normalization() {
        let json = serde_json::to_string(&coins("10stake")).unwrap();
        let back: Coins = serde_json::from_str(&json).unwrap();
        assert_eq!(back, coins("10stake"));

        let dup = r#"[{"denom":"stake","amount":"1"},{"denom":"stake","amount":"2"}]"#;
        assert!(serde_json::from_str::<Coins>(dup).is_err());
    }
}
