use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::Account;
use crate::Currency;
use crate::LedgerError;
use crate::LedgerResult;
use crate::Money;
use crate::NewTransaction;
use crate::Transaction;
use crate::TransactionSource;
use crate::UserId;

/// Builds the single equity transaction that primes an asset account with
/// the balance preceding the first sync window.
///
/// After posting the window's transactions on top of the opening balance,
/// the book's balance equals the bank's reported balance.
#[derive(Debug, Default, Clone)]
pub struct OpeningBalanceService;

impl OpeningBalanceService {
    pub fn new() -> Self {
        Self
    }

    /// Opening balance = current bank balance minus the net effect of the
    /// sync window.
    #[must_use]
    pub fn calculate_opening_balance(
        &self,
        current_balance: Decimal,
        window_amounts: &[Decimal],
    ) -> Decimal {
        let net: Decimal = window_amounts
            .iter()
            .fold(Decimal::ZERO, |sum, amount| sum + amount);
        current_balance - net
    }

    #[must_use]
    pub fn earliest_booking_date(&self, dates: &[NaiveDate]) -> Option<NaiveDate> {
        dates.iter().min().copied()
    }

    /// Build the posted opening-balance transaction, or `None` when the
    /// computed balance is zero.
    ///
    /// A positive balance debits the asset and credits equity; a negative
    /// balance (overdraft) reverses the legs.
    pub fn create_opening_balance_transaction(
        &self,
        asset_account: &Account,
        equity_account: &Account,
        amount: Decimal,
        currency: &Currency,
        balance_date: NaiveDate,
        iban: &str,
        user_id: UserId,
    ) -> LedgerResult<Option<Transaction>> {
        if equity_account.account_type != crate::AccountType::Equity {
            return Err(LedgerError::BusinessRule(format!(
                "opening balance account {} must be an equity account",
                equity_account.account_number
            )));
        }
        if amount.is_zero() {
            return Ok(None);
        }

        let mut params = NewTransaction::manual(user_id, "Opening balance", balance_date);
        params.source = TransactionSource::OpeningBalance;
        params.source_iban = Some(iban.to_string());
        let mut tx = Transaction::new(params)?;

        let normalized_iban = tx.source_iban().map(str::to_string);
        tx.update_metadata(|metadata| {
            metadata.opening_balance = true;
            metadata.opening_balance_iban = normalized_iban;
        })?;

        let magnitude = Money::new(amount.abs(), currency.clone());
        if amount > Decimal::ZERO {
            tx.add_debit(asset_account.clone(), magnitude.clone())?;
            tx.add_credit(equity_account.clone(), magnitude)?;
        } else {
            tx.add_debit(equity_account.clone(), magnitude.clone())?;
            tx.add_credit(asset_account.clone(), magnitude)?;
        }

        tx.post(currency)?;
        Ok(Some(tx))
    }
}
