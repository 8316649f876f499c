use std::sync::Arc;

use chrono::NaiveDate;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use kassa_bank::AccountMappingRepository;
use kassa_bank::BankAccountRepository;
use kassa_bank::BankConnectionPort;
use kassa_bank::BankCredentials;
use kassa_bank::BankTransaction;
use kassa_bank::BankTransactionStore;
use kassa_bank::CredentialStore;
use kassa_bank::StoredBankTransaction;
use kassa_bank::bank_code_from_iban;
use kassa_import::ImportStatus;
use kassa_import::TransactionImportResult;
use kassa_import::TransactionImportService;
use kassa_ledger::AccountRepository;
use kassa_ledger::OpeningBalanceService;
use kassa_ledger::TransactionRepository;
use kassa_ledger::UserContext;

use crate::SyncConfig;
use crate::SyncError;
use crate::SyncEvent;
use crate::SyncOpResult;
use crate::SyncRequest;
use crate::SyncResult;

pub struct TransactionSyncCommandDeps {
    pub adapter: Arc<dyn BankConnectionPort>,
    pub import_service: Arc<TransactionImportService>,
    pub mapping_repo: Arc<dyn AccountMappingRepository>,
    pub credential_store: Option<Arc<dyn CredentialStore>>,
    pub account_repo: Arc<dyn AccountRepository>,
    pub transaction_repo: Arc<dyn TransactionRepository>,
    pub bank_account_repo: Option<Arc<dyn BankAccountRepository>>,
    pub bank_store: Arc<dyn BankTransactionStore>,
    pub user: UserContext,
    pub config: SyncConfig,
}

/// Coordinates one sync: credential resolution, the scoped adapter
/// session, the deduplicating batch write, the best-effort opening
/// balance and the per-transaction import loop.
///
/// `execute` never raises at the boundary; whole-sync failures come back
/// as a `SyncResult` with `success = false` and an error message.
pub struct TransactionSyncCommand {
    adapter: Arc<dyn BankConnectionPort>,
    import_service: Arc<TransactionImportService>,
    mapping_repo: Arc<dyn AccountMappingRepository>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    account_repo: Arc<dyn AccountRepository>,
    transaction_repo: Arc<dyn TransactionRepository>,
    bank_account_repo: Option<Arc<dyn BankAccountRepository>>,
    bank_store: Arc<dyn BankTransactionStore>,
    opening_balance: OpeningBalanceService,
    user: UserContext,
    config: SyncConfig,
}

struct SyncPhaseOutput {
    bank_transactions: Vec<BankTransaction>,
    import_results: Vec<TransactionImportResult>,
    opening_balance_created: bool,
    opening_balance_amount: Option<Decimal>,
}

impl TransactionSyncCommand {
    pub fn new(deps: TransactionSyncCommandDeps) -> Self {
        Self {
            adapter: deps.adapter,
            import_service: deps.import_service,
            mapping_repo: deps.mapping_repo,
            credential_store: deps.credential_store,
            account_repo: deps.account_repo,
            transaction_repo: deps.transaction_repo,
            bank_account_repo: deps.bank_account_repo,
            bank_store: deps.bank_store,
            opening_balance: OpeningBalanceService::new(),
            user: deps.user,
            config: deps.config,
        }
    }

    pub async fn execute(&self, request: SyncRequest) -> SyncResult {
        self.run(request, None).await
    }

    /// Streaming variant: progress events flow through the channel while
    /// the sync runs, followed by exactly one `Finished`.
    pub async fn execute_streaming(&self, request: SyncRequest, events: mpsc::Sender<SyncEvent>) {
        let result = self.run(request, Some(&events)).await;
        if events.send(SyncEvent::Finished(result)).await.is_err() {
            tracing::debug!("sync event consumer went away before the final event");
        }
    }

    async fn run(&self, request: SyncRequest, events: Option<&mpsc::Sender<SyncEvent>>) -> SyncResult {
        let synced_at = Utc::now();
        let iban = request.iban.clone();
        let requested_start = request.start_date;
        let requested_end = request.end_date;

        match self.run_inner(request, events).await {
            Ok((start_date, end_date, output)) => {
                self.build_result(synced_at, &iban, start_date, end_date, output)
            }
            Err(error) => {
                tracing::error!(%iban, %error, "sync failed");
                let today = Utc::now().date_naive();
                error_result(
                    synced_at,
                    &iban,
                    requested_start.unwrap_or(today),
                    requested_end.unwrap_or(today),
                    error.to_string(),
                )
            }
        }
    }

    async fn run_inner(
        &self,
        request: SyncRequest,
        events: Option<&mpsc::Sender<SyncEvent>>,
    ) -> SyncOpResult<(NaiveDate, NaiveDate, SyncPhaseOutput)> {
        let iban = request.iban.clone();

        let (credentials, credentials_loaded) = self
            .resolve_credentials(request.credentials.clone(), &iban)
            .await?;

        let mapping = self.mapping_repo.find_by_iban(&iban).await?;
        if !mapping.is_some_and(|mapping| mapping.is_active) {
            return Err(SyncError::Mapping(format!(
                "No active account mapping found for {iban}"
            )));
        }

        let (start_date, end_date) =
            self.determine_sync_window(&iban, request.start_date, request.end_date).await?;
        tracing::info!(%iban, %start_date, %end_date, "starting sync");

        if credentials_loaded && let Some(store) = &self.credential_store {
            let (tan_method, tan_medium) =
                store.get_tan_settings(&credentials.bank_code).await?;
            if let Some(method) = tan_method {
                self.adapter.set_tan_method(&method).await?;
            }
            if let Some(medium) = tan_medium {
                self.adapter.set_tan_medium(&medium).await?;
            }
        }
        if let Some(callback) = request.tan_callback.clone() {
            self.adapter.set_tan_callback(callback).await?;
        }

        self.adapter.connect(&credentials).await?;

        // The adapter session is scoped: whatever the fetch-and-import
        // phase does, disconnect runs before the outcome propagates, and
        // the guard covers cancellation mid-phase.
        let session = SessionGuard::new(self.adapter.clone());
        let outcome = self
            .fetch_and_import(&iban, start_date, end_date, request.auto_post, events)
            .await;
        session.release().await;
        let output = outcome?;

        if credentials_loaded && let Some(store) = &self.credential_store {
            store.update_last_used(&credentials.bank_code).await?;
        }

        Ok((start_date, end_date, output))
    }

    async fn resolve_credentials(
        &self,
        provided: Option<BankCredentials>,
        iban: &str,
    ) -> SyncOpResult<(BankCredentials, bool)> {
        if let Some(credentials) = provided {
            return Ok((credentials, false));
        }

        let Some(store) = &self.credential_store else {
            return Err(SyncError::Credentials(
                "Could not resolve credentials: no credential store configured and none provided"
                    .into(),
            ));
        };
        let Some(bank_code) = bank_code_from_iban(iban) else {
            return Err(SyncError::Credentials(format!(
                "Cannot extract bank code from IBAN {iban}"
            )));
        };
        let Some(credentials) = store.find_by_bank_code(&bank_code).await? else {
            return Err(SyncError::Credentials(format!(
                "No stored credentials found for bank code {bank_code}"
            )));
        };
        Ok((credentials, true))
    }

    /// Default sync window: the day after the newest stored booking date,
    /// clamped to today; a fixed lookback on the first sync.
    async fn determine_sync_window(
        &self,
        iban: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> SyncOpResult<(NaiveDate, NaiveDate)> {
        let today = Utc::now().date_naive();
        let end_date = end.unwrap_or(today);
        let start_date = match start {
            Some(start) => start,
            None => match self.bank_store.latest_booking_date(iban).await? {
                Some(latest) => {
                    let next = latest + chrono::Duration::days(1);
                    next.min(today)
                }
                None => today - chrono::Duration::days(i64::from(self.config.default_lookback_days)),
            },
        };
        Ok((start_date.min(end_date), end_date))
    }

    async fn fetch_and_import(
        &self,
        iban: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        auto_post: bool,
        events: Option<&mpsc::Sender<SyncEvent>>,
    ) -> SyncOpResult<SyncPhaseOutput> {
        self.refresh_bank_accounts().await;

        let bank_transactions = self
            .adapter
            .fetch_transactions(iban, start_date, end_date)
            .await?;
        tracing::info!(count = bank_transactions.len(), "fetched bank transactions");

        let (opening_balance_created, opening_balance_amount) =
            self.try_create_opening_balance(iban, &bank_transactions).await;

        // Phase 1: content-addressed store write; identical transactions
        // get their sequence numbers here.
        let stored = self
            .bank_store
            .save_batch_with_deduplication(bank_transactions.clone(), iban)
            .await?;

        // New records plus leftovers from previously failed syncs.
        let to_import: Vec<StoredBankTransaction> = stored
            .into_iter()
            .filter(|record| record.is_new || !record.is_imported)
            .collect();

        send_event(
            events,
            SyncEvent::Fetched {
                iban: iban.to_string(),
                transactions_fetched: bank_transactions.len(),
                new_transactions: to_import.len(),
            },
        )
        .await;

        if to_import.is_empty() {
            tracing::info!(
                fetched = bank_transactions.len(),
                "all transactions already imported, nothing to do"
            );
            return Ok(SyncPhaseOutput {
                bank_transactions,
                import_results: Vec::new(),
                opening_balance_created,
                opening_balance_amount,
            });
        }

        let new_count = to_import.iter().filter(|record| record.is_new).count();
        tracing::info!(
            total = to_import.len(),
            new = new_count,
            retry = to_import.len() - new_count,
            "importing transactions"
        );

        send_event(
            events,
            SyncEvent::Classifying {
                iban: iban.to_string(),
                current: 0,
                total: to_import.len(),
            },
        )
        .await;

        // Phase 2: per-transaction import in the bank's reporting order.
        let total = to_import.len();
        let mut import_results = Vec::with_capacity(total);
        for (index, record) in to_import.iter().enumerate() {
            let result = self
                .import_service
                .import_stored_transaction(record, iban, auto_post)
                .await;

            if events.is_some() && result.status == ImportStatus::Success {
                let counter_account_name = result
                    .accounting_transaction
                    .as_ref()
                    .and_then(|tx| tx.entries().first())
                    .map(|entry| entry.account().name.clone())
                    .unwrap_or_default();
                send_event(
                    events,
                    SyncEvent::Classified {
                        iban: iban.to_string(),
                        current: index + 1,
                        total,
                        description: record.transaction.purpose.clone(),
                        counter_account_name,
                        transaction_id: result
                            .accounting_transaction
                            .as_ref()
                            .map(|tx| tx.id()),
                    },
                )
                .await;
            }
            import_results.push(result);
        }

        Ok(SyncPhaseOutput {
            bank_transactions,
            import_results,
            opening_balance_created,
            opening_balance_amount,
        })
    }

    /// Refresh the bank-account directory. Best effort only.
    async fn refresh_bank_accounts(&self) {
        let Some(repo) = &self.bank_account_repo else {
            return;
        };
        match self.adapter.fetch_accounts().await {
            Ok(accounts) => {
                let count = accounts.len();
                for account in accounts {
                    if let Err(error) = repo.save(account).await {
                        tracing::warn!(%error, "failed to store bank account");
                    }
                }
                tracing::debug!(count, "updated bank account directory");
            }
            Err(error) => tracing::warn!(%error, "failed to fetch bank accounts"),
        }
    }

    /// Opening balance on first sync. Best effort: any failure is logged
    /// and the sync continues without one.
    async fn try_create_opening_balance(
        &self,
        iban: &str,
        bank_transactions: &[BankTransaction],
    ) -> (bool, Option<Decimal>) {
        match self.create_opening_balance(iban, bank_transactions).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(%iban, %error, "failed to create opening balance");
                (false, None)
            }
        }
    }

    async fn create_opening_balance(
        &self,
        iban: &str,
        bank_transactions: &[BankTransaction],
    ) -> SyncOpResult<(bool, Option<Decimal>)> {
        if bank_transactions.is_empty() {
            tracing::debug!("skip opening balance: no transactions in window");
            return Ok((false, None));
        }
        if !self
            .transaction_repo
            .find_by_opening_balance_iban(iban)
            .await?
            .is_empty()
        {
            tracing::debug!(%iban, "opening balance already exists");
            return Ok((false, None));
        }

        let accounts = self.adapter.fetch_accounts().await?;
        let current_balance = accounts
            .iter()
            .find(|account| account.iban == iban)
            .and_then(|account| account.balance);
        let Some(current_balance) = current_balance else {
            tracing::warn!(%iban, "skip opening balance: bank did not report a balance");
            return Ok((false, None));
        };

        let Some(mapping) = self.mapping_repo.find_by_iban(iban).await? else {
            tracing::warn!(%iban, "skip opening balance: no account mapping");
            return Ok((false, None));
        };
        let Some(asset_account) = self.account_repo.find_by_id(mapping.account_id).await? else {
            tracing::warn!(%iban, "skip opening balance: mapped asset account missing");
            return Ok((false, None));
        };
        let Some(equity_account) = self
            .account_repo
            .find_by_account_number(&self.config.import.opening_balance_account_number)
            .await?
        else {
            tracing::warn!(
                account_number = %self.config.import.opening_balance_account_number,
                "skip opening balance: equity account not in chart"
            );
            return Ok((false, None));
        };

        let amounts: Vec<Decimal> = bank_transactions
            .iter()
            .map(|transaction| transaction.amount)
            .collect();
        let opening_balance = self
            .opening_balance
            .calculate_opening_balance(current_balance, &amounts);
        let dates: Vec<NaiveDate> = bank_transactions
            .iter()
            .map(|transaction| transaction.booking_date)
            .collect();
        let Some(balance_date) = self.opening_balance.earliest_booking_date(&dates) else {
            return Ok((false, None));
        };

        let transaction = self.opening_balance.create_opening_balance_transaction(
            &asset_account,
            &equity_account,
            opening_balance,
            &self.config.import.default_currency,
            balance_date,
            iban,
            self.user.user_id,
        )?;
        let Some(transaction) = transaction else {
            tracing::info!(%iban, "opening balance is zero, skipping");
            return Ok((false, None));
        };

        self.transaction_repo.save(transaction).await?;
        tracing::info!(
            %iban,
            amount = %opening_balance,
            date = %balance_date,
            "created opening balance"
        );
        Ok((true, Some(opening_balance)))
    }

    fn build_result(
        &self,
        synced_at: chrono::DateTime<Utc>,
        iban: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        output: SyncPhaseOutput,
    ) -> SyncResult {
        let mut imported = 0;
        let mut skipped = 0;
        let mut failed = 0;
        let mut reconciled = 0;
        let mut error_details: Vec<String> = Vec::new();

        for result in &output.import_results {
            match result.status {
                ImportStatus::Success => {
                    imported += 1;
                    if result.was_reconciled {
                        reconciled += 1;
                    }
                }
                ImportStatus::Duplicate | ImportStatus::Skipped => skipped += 1,
                ImportStatus::Failed => {
                    failed += 1;
                    if let Some(message) = &result.error_message {
                        error_details.push(message.clone());
                    }
                }
                ImportStatus::Pending => {}
            }
        }

        let has_failures = failed > 0;
        let has_positive_outcome =
            imported > 0 || skipped > 0 || output.bank_transactions.is_empty();
        let success = !has_failures || has_positive_outcome;

        let mut warning_message = if has_failures && success {
            Some(format_failures(failed, &error_details))
        } else {
            None
        };
        if reconciled > 0 {
            let plural = if reconciled == 1 { "" } else { "s" };
            let note = format!(
                "Reconciled {reconciled} internal transfer{plural} with existing transactions"
            );
            warning_message = Some(match warning_message {
                Some(existing) => format!("{existing}. {note}"),
                None => note,
            });
        }
        let error_message = if has_failures && !success {
            Some(format_failures(failed, &error_details))
        } else {
            None
        };

        SyncResult {
            success,
            synced_at,
            iban: iban.to_string(),
            start_date,
            end_date,
            transactions_fetched: output.bank_transactions.len(),
            transactions_imported: imported,
            transactions_skipped: skipped,
            transactions_failed: failed,
            transactions_reconciled: reconciled,
            error_message,
            warning_message,
            opening_balance_created: output.opening_balance_created,
            opening_balance_amount: output.opening_balance_amount,
        }
    }
}

/// Scoped bank session. `release` disconnects in-line; if the owning
/// future is dropped between connect and release (cancellation), the
/// guard disconnects from a spawned task instead.
struct SessionGuard {
    adapter: Option<Arc<dyn BankConnectionPort>>,
}

impl SessionGuard {
    fn new(adapter: Arc<dyn BankConnectionPort>) -> Self {
        Self {
            adapter: Some(adapter),
        }
    }

    async fn release(mut self) {
        if let Some(adapter) = self.adapter.take() {
            if let Err(error) = adapter.disconnect().await {
                tracing::warn!(%error, "bank adapter disconnect failed");
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(adapter) = self.adapter.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = adapter.disconnect().await {
                    tracing::warn!(%error, "bank adapter disconnect failed after cancellation");
                }
            });
        }
    }
}

async fn send_event(events: Option<&mpsc::Sender<SyncEvent>>, event: SyncEvent) {
    if let Some(sender) = events
        && sender.send(event).await.is_err()
    {
        tracing::debug!("sync event consumer went away");
    }
}

fn format_failures(failed: usize, error_details: &[String]) -> String {
    let plural = if failed == 1 { "" } else { "s" };
    let mut message = format!("{failed} transaction{plural} failed to import");
    if !error_details.is_empty() {
        let sample: Vec<&str> = error_details
            .iter()
            .take(3)
            .map(String::as_str)
            .collect();
        message.push_str(": ");
        message.push_str(&sample.join("; "));
        if error_details.len() > 3 {
            message.push_str(&format!(" (and {} more)", error_details.len() - 3));
        }
    }
    message
}

fn error_result(
    synced_at: chrono::DateTime<Utc>,
    iban: &str,
    start_date: NaiveDate,
    end_date: NaiveDate,
    error_message: String,
) -> SyncResult {
    SyncResult {
        success: false,
        synced_at,
        iban: iban.to_string(),
        start_date,
        end_date,
        transactions_fetched: 0,
        transactions_imported: 0,
        transactions_skipped: 0,
        transactions_failed: 0,
        transactions_reconciled: 0,
        error_message: Some(error_message),
        warning_message: None,
        opening_balance_created: false,
        opening_balance_amount: None,
    }
}
