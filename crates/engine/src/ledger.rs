//! Balance ledger. Every fund movement goes through [`Ledger::transfer`]
//! inside the caller's transaction.

use tracing::debug;

use relay_core::{Address, Amount};
use relay_store::StoreTx;

use crate::error::RelayError;

/// Sorted, de-duplicated lock sequence for `addresses`.
pub fn lock_order(addresses: &[Address]) -> Vec<Address> {
    let mut order = addresses.to_vec();
    order.sort();
    order.dedup();
    order
}

/// Stateless ledger operations over an open transaction.
pub struct Ledger;

impl Ledger {
    /// Move `amount` from `from` to `to`.
    ///
    /// Both rows are locked in ascending address order whatever the argument
    /// order, so opposite-direction transfers cannot deadlock.
    pub async fn transfer(
        tx: &mut dyn StoreTx,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), RelayError> {
        let (first, second) = if from <= to { (from, to) } else { (to, from) };
        let first_balance = tx.lock_balance(first).await?;
        let second_balance = if first == second {
            first_balance
        } else {
            tx.lock_balance(second).await?
        };
        let (from_balance, to_balance) = if from == first {
            (first_balance, second_balance)
        } else {
            (second_balance, first_balance)
        };

        if from_balance < amount {
            return Err(RelayError::InsufficientBalance {
                address: *from,
                available: from_balance,
                required: amount,
            });
        }
        if from == to || amount.is_zero() {
            return Ok(());
        }

        let credited = to_balance
            .checked_add(amount)
            .ok_or_else(|| RelayError::InvalidRequest(format!("balance overflow for {to}")))?;
        tx.set_balance(from, from_balance - amount).await?;
        tx.set_balance(to, credited).await?;
        debug!(from = %from, to = %to, amount = %amount, "transfer");
        Ok(())
    }

    /// Lock every balance a multi-transfer transaction touches, ascending.
    ///
    /// Call before the first transfer: the per-transfer ordering alone does not
    /// order locks across transfers.
    pub async fn lock_all(tx: &mut dyn StoreTx, addresses: &[Address]) -> Result<(), RelayError> {
        for address in lock_order(addresses) {
            tx.lock_balance(&address).await?;
        }
        Ok(())
    }

    /// Credit funds entering from outside the ledger (chain deposits).
    pub async fn credit(tx: &mut dyn StoreTx, to: &Address, amount: Amount) -> Result<(), RelayError> {
        let balance = tx.lock_balance(to).await?;
        let credited = balance
            .checked_add(amount)
            .ok_or_else(|| RelayError::InvalidRequest(format!("balance overflow for {to}")))?;
        tx.set_balance(to, credited).await?;
        Ok(())
    }

    pub async fn balance(tx: &mut dyn StoreTx, address: &Address) -> Result<Amount, RelayError> {
        Ok(tx.balance(address).await?)
    }
}
