//! Balance and escrow collaborator.
//!
//! The lock store never owns balances itself. It moves coins between an
//! owner's account and a single module escrow account through [`Bank`].
//! [`BalanceManager`] is the in-memory implementation used by tests and
//! embedders without a ledger of their own.

use std::collections::HashMap;

use chronolock_types::{Coin, Coins, LockupError, Owner, Result};
use rust_decimal::Decimal;

/// The narrow escrow interface the lock store consumes.
///
/// Both transfers must be all-or-nothing across the coins they are given.
pub trait Bank {
    /// Move `coins` from `owner` into escrow.
    ///
    /// # Errors
    /// `InsufficientBalance` if the owner cannot fund every coin.
    fn transfer_to_escrow(&mut self, owner: &Owner, coins: &Coins) -> Result<()>;

    /// Move `coins` out of escrow to `recipient`.
    ///
    /// # Errors
    /// `EscrowTransferFailed` if escrow does not hold every coin.
    fn transfer_from_escrow(&mut self, recipient: &Owner, coins: &Coins) -> Result<()>;

    /// Everything currently held in escrow.
    fn escrow_balance(&self) -> Coins;
}

/// In-memory per-(owner, denom) balances plus the escrow account.
#[derive(Debug, Clone, Default)]
pub struct BalanceManager {
    balances: HashMap<(Owner, String), Decimal>,
    escrow: Coins,
}

impl BalanceManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit an owner's account from outside the system.
    ///
    /// # Errors
    /// `InvalidCoins`/`InvalidDenom` for a malformed coin.
    pub fn deposit(&mut self, owner: &Owner, denom: &str, amount: Decimal) -> Result<()> {
        let coin = Coin::new(denom, amount)?;
        *self
            .balances
            .entry((owner.clone(), coin.denom))
            .or_insert(Decimal::ZERO) += coin.amount;
        Ok(())
    }

    /// Spendable balance of `denom` for `owner`.
    #[must_use]
    pub fn balance(&self, owner: &Owner, denom: &str) -> Decimal {
        self.balances
            .get(&(owner.clone(), denom.to_string()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Every positive balance of `owner`.
    #[must_use]
    pub fn all_balances(&self, owner: &Owner) -> Coins {
        let coins: Vec<Coin> = self
            .balances
            .iter()
            .filter(|((o, _), amount)| o == owner && **amount > Decimal::ZERO)
            .map(|((_, denom), amount)| Coin {
                denom: denom.clone(),
                amount: *amount,
            })
            .collect();
        // Keys are unique per denom and amounts positive, so this cannot fail.
        Coins::new(coins).unwrap_or_default()
    }

    /// Accounts plus escrow for one denom.
    #[must_use]
    pub fn total_supply(&self, denom: &str) -> Decimal {
        self.balances
            .iter()
            .filter(|((_, d), _)| d == denom)
            .map(|(_, amount)| *amount)
            .sum::<Decimal>()
            + self.escrow.amount_of(denom)
    }
}

impl Bank for BalanceManager {
    fn transfer_to_escrow(&mut self, owner: &Owner, coins: &Coins) -> Result<()> {
        for coin in coins.iter() {
            let available = self.balance(owner, &coin.denom);
            if available < coin.amount {
                return Err(LockupError::InsufficientBalance {
                    denom: coin.denom.clone(),
                    needed: coin.amount,
                    available,
                });
            }
        }
        for coin in coins.iter() {
            if let Some(entry) = self.balances.get_mut(&(owner.clone(), coin.denom.clone())) {
                *entry -= coin.amount;
            }
        }
        self.escrow = self.escrow.add(coins);
        Ok(())
    }

    fn transfer_from_escrow(&mut self, recipient: &Owner, coins: &Coins) -> Result<()> {
        let remaining =
            self.escrow
                .checked_sub(coins)
                .ok_or_else(|| LockupError::EscrowTransferFailed {
                    reason: format!("escrow holds {}, cannot pay {coins}", self.escrow),
                })?;
        self.escrow = remaining;
        for coin in coins.iter() {
            *self
                .balances
                .entry((recipient.clone(), coin.denom.clone()))
                .or_insert(Decimal::ZERO) += coin.amount;
        }
        Ok(())
    }

    fn escrow_balance(&self) -> Coins {
        self.escrow.clone()
    }
}
