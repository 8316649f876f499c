use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use kassa_ledger::Account;
use kassa_ledger::AccountRepository;
use kassa_ledger::Money;
use kassa_ledger::NewTransaction;
use kassa_ledger::Transaction;
use kassa_ledger::TransactionRepository;
use kassa_ledger::UserContext;

use crate::ImportConfig;
use crate::ImportResult;

/// Backs a reconciled transfer out of a counterparty's opening balance.
///
/// When a transfer is booked with a date before the counterparty account's
/// opening balance, the bank balance that opening balance was computed from
/// already contained the transfer. Booking the transfer leg on top would
/// double-count it, so a compensating equity entry is posted once per
/// transfer hash.
pub struct OpeningBalanceAdjustmentService {
    account_repo: Arc<dyn AccountRepository>,
    transaction_repo: Arc<dyn TransactionRepository>,
    user: UserContext,
    config: ImportConfig,
}

impl OpeningBalanceAdjustmentService {
    pub fn new(
        account_repo: Arc<dyn AccountRepository>,
        transaction_repo: Arc<dyn TransactionRepository>,
        user: UserContext,
        config: ImportConfig,
    ) -> Self {
        Self {
            account_repo,
            transaction_repo,
            user,
            config,
        }
    }

    /// Post the adjustment when needed; returns the adjustment transaction
    /// or `None` when no adjustment applies.
    pub async fn create_adjustment_if_needed(
        &self,
        counterparty_account: &Account,
        counterparty_iban: &str,
        transfer_amount: Decimal,
        transfer_date: NaiveDate,
        is_incoming_to_counterparty: bool,
        transfer_hash: Option<&str>,
    ) -> ImportResult<Option<Transaction>> {
        let Some(transfer_hash) = transfer_hash else {
            return Ok(None);
        };

        // Only transfers dated before the counterparty's opening balance
        // are already part of that balance.
        let opening_balances = self
            .transaction_repo
            .find_by_opening_balance_iban(counterparty_iban)
            .await?;
        let Some(opening_balance) = opening_balances.first() else {
            return Ok(None);
        };
        if transfer_date >= opening_balance.date() {
            return Ok(None);
        }

        if self
            .transaction_repo
            .find_opening_balance_adjustment(transfer_hash)
            .await?
            .is_some()
        {
            tracing::debug!(%transfer_hash, "opening balance adjustment already posted");
            return Ok(None);
        }

        let Some(equity_account) = self
            .account_repo
            .find_by_account_number(&self.config.opening_balance_account_number)
            .await?
        else {
            tracing::warn!(
                account_number = %self.config.opening_balance_account_number,
                "cannot adjust opening balance: equity account missing"
            );
            return Ok(None);
        };

        let mut params = NewTransaction::manual(
            self.user.user_id,
            "Opening balance adjustment",
            transfer_date,
        );
        params.counterparty = Some(counterparty_account.name.clone());
        let mut adjustment = Transaction::new(params)?;
        let hash = transfer_hash.to_string();
        adjustment.update_metadata(|metadata| {
            metadata.opening_balance_adjustment = true;
            metadata.transfer_identity_hash = Some(hash);
        })?;

        let magnitude = Money::new(
            transfer_amount.abs(),
            self.config.default_currency.clone(),
        );
        if is_incoming_to_counterparty {
            // The transfer leg debits the counterparty asset; cancel that
            // against the opening-balance equity.
            adjustment.add_debit(equity_account, magnitude.clone())?;
            adjustment.add_credit(counterparty_account.clone(), magnitude)?;
        } else {
            adjustment.add_debit(counterparty_account.clone(), magnitude.clone())?;
            adjustment.add_credit(equity_account, magnitude)?;
        }

        adjustment.post(&self.config.default_currency)?;
        let saved = self.transaction_repo.save(adjustment).await?;
        tracing::info!(
            counterparty = %counterparty_account.name,
            amount = %transfer_amount,
            "posted opening balance adjustment"
        );
        Ok(Some(saved))
    }
}
