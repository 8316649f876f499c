#![deny(clippy::print_stdout, clippy::print_stderr)]

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use rust_decimal::Decimal;

use kassa_bank::BankCredentials;
use kassa_bank::BankError;
use kassa_bank::TanCallback;
use kassa_import::ImportConfig;
use kassa_import::ImportError;
use kassa_ledger::LedgerError;
use kassa_ledger::TransactionId;
use kassa_reconcile::ReconcileError;

mod assembly;
mod classifier_adapter;
mod command;

pub use crate::assembly::SyncStack;
pub use crate::classifier_adapter::PipelineClassifier;
pub use crate::command::TransactionSyncCommand;
pub use crate::command::TransactionSyncCommandDeps;

pub(crate) type SyncOpResult<T> = Result<T, SyncError>;

/// Internal error type of the sync phases. Never crosses the command
/// boundary: `execute` folds it into an error `SyncResult`.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Bank(#[from] BankError),
    #[error(transparent)]
    Import(#[from] ImportError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("{0}")]
    Credentials(String),
    #[error("{0}")]
    Mapping(String),
}

/// Parameters of one sync run.
#[derive(Clone)]
pub struct SyncRequest {
    pub iban: String,
    pub credentials: Option<BankCredentials>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub tan_callback: Option<TanCallback>,
    pub auto_post: bool,
}

impl SyncRequest {
    pub fn new(iban: impl Into<String>) -> Self {
        Self {
            iban: iban.into(),
            credentials: None,
            start_date: None,
            end_date: None,
            tan_callback: None,
            auto_post: false,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: BankCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_window(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    #[must_use]
    pub fn with_auto_post(mut self, auto_post: bool) -> Self {
        self.auto_post = auto_post;
        self
    }
}

/// The single record a sync run reports back to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub success: bool,
    pub synced_at: DateTime<Utc>,
    pub iban: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub transactions_fetched: usize,
    pub transactions_imported: usize,
    pub transactions_skipped: usize,
    pub transactions_failed: usize,
    pub transactions_reconciled: usize,
    pub error_message: Option<String>,
    pub warning_message: Option<String>,
    pub opening_balance_created: bool,
    pub opening_balance_amount: Option<Decimal>,
}

/// Progress events streamed over a channel during a sync. The producer
/// sends any number of progress variants and exactly one `Finished` at
/// the end.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Fetched {
        iban: String,
        transactions_fetched: usize,
        new_transactions: usize,
    },
    Classifying {
        iban: String,
        current: usize,
        total: usize,
    },
    Classified {
        iban: String,
        current: usize,
        total: usize,
        description: String,
        counter_account_name: String,
        transaction_id: Option<TransactionId>,
    },
    Finished(SyncResult),
}

/// Configuration of the sync layer on top of the import configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub import: ImportConfig,
    /// Sync window length when no prior imports exist.
    pub default_lookback_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            import: ImportConfig::default(),
            default_lookback_days: 90,
        }
    }
}
