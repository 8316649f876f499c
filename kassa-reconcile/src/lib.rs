#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::sync::Arc;

use kassa_bank::AccountMappingRepository;
use kassa_bank::BankError;
use kassa_bank::BankTransaction;
use kassa_ledger::Account;
use kassa_ledger::AccountRepository;
use kassa_ledger::AccountType;
use kassa_ledger::Currency;
use kassa_ledger::LedgerError;
use kassa_ledger::Transaction;
use kassa_ledger::TransactionRepository;
use kassa_ledger::normalize_iban;
use kassa_ledger::transfer_fingerprint;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Bank(#[from] BankError),
    #[error("reconciliation rejected: {0}")]
    Rejected(String),
}

/// What the reconciliation service knows about a freshly fetched bank
/// transaction before import.
#[derive(Debug, Clone, Default)]
pub struct TransferContext {
    /// The counterparty IBAN maps to one of the user's own asset accounts.
    pub is_internal_transfer: bool,
    pub counterparty_iban: Option<String>,
    pub counterparty_account: Option<Account>,
    /// Worth searching the ledger for an already-imported first leg. This
    /// only says the counterparty is mapped and active; whether a matching
    /// prior transaction actually exists is decided by
    /// `find_matching_transfer`, which needs the source IBAN.
    pub reconcile_candidate: bool,
}

impl TransferContext {
    fn external(counterparty_iban: Option<String>) -> Self {
        Self {
            counterparty_iban,
            ..Default::default()
        }
    }
}

/// Detects when a newly imported bank transaction is the second leg of a
/// transfer between the user's own accounts, and converts the existing
/// first leg into a balanced internal transfer.
pub struct TransferReconciliationService {
    transaction_repo: Arc<dyn TransactionRepository>,
    mapping_repo: Arc<dyn AccountMappingRepository>,
    account_repo: Arc<dyn AccountRepository>,
    default_currency: Currency,
}

impl TransferReconciliationService {
    pub fn new(
        transaction_repo: Arc<dyn TransactionRepository>,
        mapping_repo: Arc<dyn AccountMappingRepository>,
        account_repo: Arc<dyn AccountRepository>,
        default_currency: Currency,
    ) -> Self {
        Self {
            transaction_repo,
            mapping_repo,
            account_repo,
            default_currency,
        }
    }

    /// Classify a bank transaction by its counterparty IBAN.
    ///
    /// A mapped, active counterparty makes it an internal transfer and a
    /// reconciliation candidate; the definitive lookup for the first leg
    /// happens in `find_matching_transfer`.
    pub async fn detect_transfer(
        &self,
        transaction: &BankTransaction,
    ) -> ReconcileResult<TransferContext> {
        let Some(counterparty_iban) = transaction.normalized_applicant_iban() else {
            return Ok(TransferContext::external(None));
        };

        let Some(mapping) = self.mapping_repo.find_by_iban(&counterparty_iban).await? else {
            return Ok(TransferContext::external(Some(counterparty_iban)));
        };
        if !mapping.is_active {
            return Ok(TransferContext::external(Some(counterparty_iban)));
        }

        let counterparty_account = self.account_repo.find_by_id(mapping.account_id).await?;
        if let Some(account) = &counterparty_account
            && account.account_type != AccountType::Asset
        {
            tracing::debug!(
                iban = %counterparty_iban,
                account = %account.name,
                "mapped counterparty account is not an asset account"
            );
        }

        Ok(TransferContext {
            is_internal_transfer: true,
            counterparty_iban: Some(counterparty_iban),
            counterparty_account,
            reconcile_candidate: true,
        })
    }

    /// Search the ledger for the posted first leg of this transfer: a bank
    /// import booked from the counterparty account with the same transfer
    /// fingerprint and the opposite direction.
    pub async fn find_matching_transfer(
        &self,
        transaction: &BankTransaction,
        source_iban: &str,
        counterparty_iban: &str,
    ) -> ReconcileResult<Option<Transaction>> {
        let fingerprint = transaction.transfer_identity_hash(source_iban, counterparty_iban);
        let candidates = self
            .transaction_repo
            .find_posted_by_transfer_fingerprint(&fingerprint)
            .await?;

        let other_leg_iban = normalize_iban(Some(counterparty_iban));
        let matching = candidates.into_iter().find(|candidate| {
            // The other leg was recorded from the counterparty's
            // perspective.
            if candidate.source_iban().map(str::to_string) != other_leg_iban {
                return false;
            }
            // Opposite direction: a negative bank amount (money out of the
            // syncing account) pairs with a debit on the other account's
            // asset leg (money in), and vice versa.
            candidate
                .entries()
                .iter()
                .find(|entry| entry.account().account_type == AccountType::Asset)
                .is_some_and(|asset_leg| asset_leg.is_debit() == transaction.is_debit())
        });

        Ok(matching)
    }

    /// Convert an existing externally-categorised transaction into an
    /// internal transfer whose second asset leg is `new_asset_account`.
    ///
    /// The caller owns atomicity of this save together with its import
    /// audit record.
    pub async fn convert_to_internal_transfer(
        &self,
        mut transaction: Transaction,
        new_asset_account: &Account,
        counterparty_iban: &str,
        source_iban: &str,
    ) -> ReconcileResult<Transaction> {
        let transfer_hash = transfer_fingerprint(
            source_iban,
            counterparty_iban,
            transaction.date(),
            transaction.total_amount().amount,
        );
        let converted = transaction.convert_to_internal_transfer(
            new_asset_account,
            &transfer_hash,
            &self.default_currency,
        )?;
        if !converted {
            return Err(ReconcileError::Rejected(format!(
                "transaction {} has no income or expense entry to convert",
                transaction.id()
            )));
        }

        let saved = self.transaction_repo.save(transaction).await?;
        tracing::info!(
            transaction_id = %saved.id(),
            destination = %new_asset_account.name,
            "reconciled transaction as internal transfer"
        );
        Ok(saved)
    }

    /// Bulk reconciliation for a newly added account: every historical bank
    /// import pointing at `iban` is converted into an internal transfer.
    /// Returns the number of conversions.
    pub async fn reconcile_for_new_account(
        &self,
        iban: &str,
        asset_account: &Account,
    ) -> ReconcileResult<usize> {
        let candidates = self
            .transaction_repo
            .find_bank_imports_by_counterparty_iban(iban)
            .await?;

        let mut reconciled = 0;
        for transaction in candidates {
            if transaction.is_internal_transfer() {
                continue;
            }
            let Some(source_iban) = transaction.source_iban().map(str::to_string) else {
                continue;
            };
            let transfer_hash = transfer_fingerprint(
                &source_iban,
                iban,
                transaction.date(),
                transaction.total_amount().amount,
            );
            let mut candidate = transaction;
            let converted = candidate.convert_to_internal_transfer(
                asset_account,
                &transfer_hash,
                &self.default_currency,
            )?;
            if !converted {
                continue;
            }
            self.transaction_repo.save(candidate).await?;
            reconciled += 1;
        }

        if reconciled > 0 {
            tracing::info!(%iban, count = reconciled, "bulk-reconciled historical transfers");
        }
        Ok(reconciled)
    }
}
