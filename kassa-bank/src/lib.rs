#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use uuid::Uuid;

use kassa_ledger::AccountId;
use kassa_ledger::Currency;
use kassa_ledger::UserId;
use kassa_ledger::normalize_iban;
use kassa_ledger::transfer_fingerprint;

mod memory;

pub use crate::memory::InMemoryAccountMappingRepository;
pub use crate::memory::InMemoryBankAccountRepository;
pub use crate::memory::InMemoryBankTransactionStore;
pub use crate::memory::InMemoryCredentialStore;

pub type BankResult<T> = Result<T, BankError>;

#[derive(Debug, thiserror::Error)]
pub enum BankError {
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("resource conflict: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("adapter failure: {0}")]
    Adapter(String),
    #[error("TAN challenge failed: {0}")]
    Tan(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

/// A raw transaction as reported by the bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankTransaction {
    pub booking_date: NaiveDate,
    pub value_date: NaiveDate,
    /// Signed amount: negative for outgoing, positive for incoming.
    pub amount: Decimal,
    pub currency: Currency,
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applicant_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applicant_iban: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applicant_bic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_to_end_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandate_reference: Option<String>,
}

impl BankTransaction {
    #[must_use]
    pub fn is_debit(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    #[must_use]
    pub fn normalized_applicant_iban(&self) -> Option<String> {
        normalize_iban(self.applicant_iban.as_deref())
    }

    /// Content hash over the immutable fields of the transaction.
    ///
    /// Two transactions sharing the hash are not duplicates but two real
    /// occurrences of the same counterparty, date and amount; identity is
    /// (hash, sequence).
    #[must_use]
    pub fn identity_hash(&self) -> String {
        let fields = [
            self.booking_date.to_string(),
            self.amount.normalize().to_string(),
            self.currency.code().to_string(),
            self.purpose.clone(),
            self.applicant_name.clone().unwrap_or_default(),
            self.normalized_applicant_iban().unwrap_or_default(),
            self.end_to_end_reference.clone().unwrap_or_default(),
        ];
        let mut hasher = Sha256::new();
        for field in &fields {
            hasher.update(field.as_bytes());
            hasher.update(b"|");
        }
        format!("{:x}", hasher.finalize())
    }

    /// Symmetric transfer hash; both legs of a transfer derive the same
    /// value regardless of which account reported the transaction.
    #[must_use]
    pub fn transfer_identity_hash(&self, source_iban: &str, counterparty_iban: &str) -> String {
        transfer_fingerprint(source_iban, counterparty_iban, self.booking_date, self.amount)
    }
}

/// A bank transaction as persisted by the content-addressed store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBankTransaction {
    pub id: Uuid,
    pub account_iban: String,
    pub transaction: BankTransaction,
    pub identity_hash: String,
    pub hash_sequence: u32,
    /// Whether this record was created by the save that returned it.
    pub is_new: bool,
    /// Flipped once the import coordinator finalises the accounting
    /// transaction for this record.
    pub is_imported: bool,
}

/// Durable, content-addressed storage of raw bank transactions.
#[async_trait]
pub trait BankTransactionStore: Send + Sync {
    /// Persist a batch, deduplicating on (identity hash, sequence).
    ///
    /// Repeats within the batch receive successive sequence numbers
    /// starting at 1; records already present are returned with
    /// `is_new = false` and their original ids, so retrying the same batch
    /// is idempotent. The output order matches the input order.
    async fn save_batch_with_deduplication(
        &self,
        transactions: Vec<BankTransaction>,
        account_iban: &str,
    ) -> BankResult<Vec<StoredBankTransaction>>;

    async fn query(
        &self,
        account_iban: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        limit: Option<usize>,
    ) -> BankResult<Vec<StoredBankTransaction>>;

    async fn find_by_id(&self, id: Uuid) -> BankResult<Option<StoredBankTransaction>>;

    async fn latest_booking_date(&self, account_iban: &str) -> BankResult<Option<NaiveDate>>;

    async fn mark_imported(&self, id: Uuid) -> BankResult<()>;

    /// Cascade used when an account is removed.
    async fn delete_for_account(&self, account_iban: &str) -> BankResult<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankAccount {
    pub iban: String,
    pub account_number: String,
    pub bank_code: String,
    pub account_holder: String,
    pub account_type: String,
    pub currency: Currency,
    pub balance: Option<Decimal>,
}

/// Directory of bank accounts discovered during sync.
#[async_trait]
pub trait BankAccountRepository: Send + Sync {
    async fn save(&self, account: BankAccount) -> BankResult<BankAccount>;

    async fn list(&self) -> BankResult<Vec<BankAccount>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankCredentials {
    pub bank_code: String,
    pub login: String,
    /// Encrypted secret, opaque to the core.
    pub secret: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TanChallenge {
    pub text: String,
    pub medium: Option<String>,
}

pub type TanFuture = Pin<Box<dyn Future<Output = BankResult<String>> + Send>>;
pub type TanCallback = Arc<dyn Fn(TanChallenge) -> TanFuture + Send + Sync>;

/// Connection to a FinTS-style bank backend. All methods may suspend; a
/// connected session must be released on every exit path.
#[async_trait]
pub trait BankConnectionPort: Send + Sync {
    async fn connect(&self, credentials: &BankCredentials) -> BankResult<()>;

    async fn disconnect(&self) -> BankResult<()>;

    async fn fetch_accounts(&self) -> BankResult<Vec<BankAccount>>;

    async fn fetch_transactions(
        &self,
        account_iban: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> BankResult<Vec<BankTransaction>>;

    async fn set_tan_method(&self, method: &str) -> BankResult<()>;

    async fn set_tan_medium(&self, medium: &str) -> BankResult<()>;

    async fn set_tan_callback(&self, callback: TanCallback) -> BankResult<()>;
}

/// User-scoped storage of bank access credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_bank_code(&self, bank_code: &str) -> BankResult<Option<BankCredentials>>;

    /// (tan_method, tan_medium) as configured for the bank.
    async fn get_tan_settings(
        &self,
        bank_code: &str,
    ) -> BankResult<(Option<String>, Option<String>)>;

    async fn update_last_used(&self, bank_code: &str) -> BankResult<()>;
}

/// Link between an external bank account and an accounting asset account.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountMapping {
    pub id: Uuid,
    pub user_id: UserId,
    pub iban: String,
    pub account_id: AccountId,
    pub display_name: String,
    pub is_active: bool,
}

impl AccountMapping {
    pub fn new(
        user_id: UserId,
        iban: impl Into<String>,
        account_id: AccountId,
        display_name: impl Into<String>,
    ) -> BankResult<Self> {
        let iban = normalize_iban(Some(&iban.into()))
            .ok_or_else(|| BankError::Validation("mapping IBAN cannot be empty".into()))?;
        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            iban,
            account_id,
            display_name: display_name.into(),
            is_active: true,
        })
    }
}

#[async_trait]
pub trait AccountMappingRepository: Send + Sync {
    async fn find_by_iban(&self, iban: &str) -> BankResult<Option<AccountMapping>>;

    /// At most one active mapping per (user, IBAN).
    async fn save(&self, mapping: AccountMapping) -> BankResult<AccountMapping>;

    async fn list(&self) -> BankResult<Vec<AccountMapping>>;
}

/// Extract the domestic bank code from a German-scheme IBAN.
pub fn bank_code_from_iban(iban: &str) -> Option<String> {
    let normalized = normalize_iban(Some(iban))?;
    if !normalized.starts_with("DE") || normalized.len() < 12 {
        return None;
    }
    Some(normalized[4..12].to_string())
}
