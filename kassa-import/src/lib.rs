#![deny(clippy::print_stdout, clippy::print_stderr)]

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use uuid::Uuid;

use kassa_bank::BankError;
use kassa_bank::BankTransaction;
use kassa_ledger::Account;
use kassa_ledger::AccountId;
use kassa_ledger::Currency;
use kassa_ledger::LedgerError;
use kassa_ledger::Transaction;
use kassa_ledger::TransactionId;
use kassa_ledger::UserId;
use kassa_reconcile::ReconcileError;

mod adjustment;
mod factory;
mod memory;
mod rules;
mod service;

pub use crate::adjustment::OpeningBalanceAdjustmentService;
pub use crate::factory::BankImportTransactionFactory;
pub use crate::factory::FactoryRequest;
pub use crate::memory::InMemoryCounterAccountRuleRepository;
pub use crate::memory::InMemoryTransactionImportRepository;
pub use crate::rules::CounterAccountResolutionService;
pub use crate::rules::CounterAccountRule;
pub use crate::rules::CounterAccountRuleRepository;
pub use crate::rules::PatternType;
pub use crate::rules::ResolutionOutcome;
pub use crate::rules::ResolutionSource;
pub use crate::rules::RuleSource;
pub use crate::service::MappingAssetAccountProvider;
pub use crate::service::TransactionImportService;
pub use crate::service::TransactionImportServiceDeps;

pub type ImportResult<T> = Result<T, ImportError>;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Bank(#[from] BankError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid status transition: {0}")]
    InvalidTransition(String),
    #[error("classifier failure: {0}")]
    Classifier(String),
}

/// Terminal outcome of one import attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportStatus {
    Pending,
    Success,
    Duplicate,
    Skipped,
    Failed,
}

impl ImportStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::Success => "success",
            ImportStatus::Duplicate => "duplicate",
            ImportStatus::Skipped => "skipped",
            ImportStatus::Failed => "failed",
        }
    }

    /// Migration shim for rows written by earlier releases. This is the
    /// only place legacy labels are accepted; everything at runtime works
    /// on the enum.
    #[must_use]
    pub fn from_storage_label(label: &str) -> Option<Self> {
        match label.to_ascii_lowercase().as_str() {
            "pending" => Some(ImportStatus::Pending),
            "success" | "imported" => Some(ImportStatus::Success),
            "duplicate" | "skipped_duplicate" => Some(ImportStatus::Duplicate),
            "skipped" => Some(ImportStatus::Skipped),
            "failed" => Some(ImportStatus::Failed),
            _ => None,
        }
    }
}

/// Audit record for one attempted import of a stored bank transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionImport {
    pub id: Uuid,
    pub user_id: UserId,
    pub bank_transaction_id: Uuid,
    pub status: ImportStatus,
    pub accounting_transaction_id: Option<TransactionId>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub imported_at: Option<DateTime<Utc>>,
}

impl TransactionImport {
    pub fn new(user_id: UserId, bank_transaction_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            bank_transaction_id,
            status: ImportStatus::Pending,
            accounting_transaction_id: None,
            error_message: None,
            created_at: Utc::now(),
            imported_at: None,
        }
    }

    fn transition(&mut self, to: ImportStatus) -> ImportResult<()> {
        if self.status != ImportStatus::Pending {
            return Err(ImportError::InvalidTransition(format!(
                "import record {} is already {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = to;
        Ok(())
    }

    pub fn mark_as_imported(&mut self, transaction_id: TransactionId) -> ImportResult<()> {
        self.transition(ImportStatus::Success)?;
        self.accounting_transaction_id = Some(transaction_id);
        self.imported_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_as_skipped(&mut self, reason: impl Into<String>) -> ImportResult<()> {
        self.transition(ImportStatus::Skipped)?;
        self.error_message = Some(reason.into());
        Ok(())
    }

    pub fn mark_as_failed(&mut self, message: impl Into<String>) -> ImportResult<()> {
        self.transition(ImportStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }
}

/// User-scoped storage of import audit records.
#[async_trait]
pub trait TransactionImportRepository: Send + Sync {
    async fn save(&self, record: TransactionImport) -> ImportResult<TransactionImport>;

    async fn find_by_bank_transaction_id(
        &self,
        bank_transaction_id: Uuid,
    ) -> ImportResult<Option<TransactionImport>>;

    async fn count_by_status(&self) -> ImportResult<std::collections::HashMap<ImportStatus, usize>>;
}

/// Counter-account chosen by the classification pipeline for one bank
/// transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedCounterAccount {
    pub account_id: Option<AccountId>,
    pub account_number: Option<String>,
    pub confidence: f32,
    pub tier: String,
}

/// Pre-classified batch entry handed to `import_with_preclassified`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PreclassifiedTransaction {
    pub outcome: Option<ClassifiedCounterAccount>,
    pub merchant: Option<String>,
    pub recurring_pattern: Option<String>,
}

/// Port the coordinator calls into for on-the-fly classification. Returns
/// `None` when the pipeline leaves the transaction unresolved.
#[async_trait]
pub trait ClassifierPort: Send + Sync {
    async fn classify(
        &self,
        transaction: &BankTransaction,
    ) -> ImportResult<Option<ClassifiedCounterAccount>>;
}

/// Port the coordinator uses to resolve the asset account for a source
/// IBAN, creating a default account and mapping on first contact.
#[async_trait]
pub trait AssetAccountProvider: Send + Sync {
    async fn get_or_create_asset_account(&self, iban: &str) -> ImportResult<Account>;
}

/// Result of one import attempt, surfaced to the sync layer.
#[derive(Debug, Clone)]
pub struct TransactionImportResult {
    pub bank_transaction: BankTransaction,
    pub status: ImportStatus,
    pub accounting_transaction: Option<Transaction>,
    pub error_message: Option<String>,
    pub was_reconciled: bool,
}

impl TransactionImportResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ImportStatus::Success
    }

    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        self.status == ImportStatus::Duplicate
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == ImportStatus::Failed
    }
}

/// Configuration for the import side of the system.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub default_currency: Currency,
    /// Sign-based fallback when nothing else resolves a counter-account.
    pub default_expense_account_number: String,
    pub default_income_account_number: String,
    /// Equity account that carries opening balances and their adjustments.
    pub opening_balance_account_number: String,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            default_currency: Currency::eur(),
            default_expense_account_number: "4900".into(),
            default_income_account_number: "8200".into(),
            opening_balance_account_number: "2000".into(),
        }
    }
}
