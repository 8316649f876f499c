use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use kassa_bank::AccountMapping;
use kassa_bank::AccountMappingRepository;
use kassa_bank::BankTransaction;
use kassa_bank::BankTransactionStore;
use kassa_bank::StoredBankTransaction;
use kassa_ledger::Account;
use kassa_ledger::AccountRepository;
use kassa_ledger::AccountType;
use kassa_ledger::AiResolution;
use kassa_ledger::Currency;
use kassa_ledger::Transaction;
use kassa_ledger::TransactionRepository;
use kassa_ledger::UserContext;
use kassa_reconcile::TransferContext;
use kassa_reconcile::TransferReconciliationService;

use crate::AssetAccountProvider;
use crate::BankImportTransactionFactory;
use crate::ClassifierPort;
use crate::FactoryRequest;
use crate::ImportConfig;
use crate::ImportError;
use crate::ImportResult;
use crate::ImportStatus;
use crate::OpeningBalanceAdjustmentService;
use crate::PreclassifiedTransaction;
use crate::TransactionImport;
use crate::TransactionImportRepository;
use crate::TransactionImportResult;
use crate::rules::CounterAccountResolutionService;

/// Default `AssetAccountProvider`: resolves the mapped asset account for an
/// IBAN and bootstraps an account plus mapping on first contact. The IBAN
/// doubles as the account number of bootstrapped accounts, which keeps the
/// chart unique without a numbering scheme.
pub struct MappingAssetAccountProvider {
    mapping_repo: Arc<dyn AccountMappingRepository>,
    account_repo: Arc<dyn AccountRepository>,
    user: UserContext,
    default_currency: Currency,
}

impl MappingAssetAccountProvider {
    pub fn new(
        mapping_repo: Arc<dyn AccountMappingRepository>,
        account_repo: Arc<dyn AccountRepository>,
        user: UserContext,
        default_currency: Currency,
    ) -> Self {
        Self {
            mapping_repo,
            account_repo,
            user,
            default_currency,
        }
    }
}

#[async_trait]
impl AssetAccountProvider for MappingAssetAccountProvider {
    async fn get_or_create_asset_account(&self, iban: &str) -> ImportResult<Account> {
        if let Some(mapping) = self.mapping_repo.find_by_iban(iban).await? {
            return self
                .account_repo
                .find_by_id(mapping.account_id)
                .await?
                .ok_or_else(|| {
                    ImportError::NotFound(format!(
                        "mapped accounting account {} for {}",
                        mapping.account_id, iban
                    ))
                });
        }

        let name = format!("Bank account {iban}");
        let account = Account::new(
            self.user.user_id,
            name.clone(),
            AccountType::Asset,
            iban,
            self.default_currency.clone(),
        )?
        .with_iban(iban);
        let account = self.account_repo.save(account).await?;
        self.mapping_repo
            .save(AccountMapping::new(self.user.user_id, iban, account.id, name)?)
            .await?;
        tracing::info!(%iban, account_id = %account.id, "bootstrapped asset account for IBAN");
        Ok(account)
    }
}

/// Per-transaction import workflow.
///
/// For each stored bank transaction: duplicate check, skip checks, asset
/// account resolution, transfer detection and reconciliation, counter-
/// account resolution (rules, classifier, sign-based fallback), transaction
/// construction, optional auto-post and the final persist. Failures are
/// isolated per transaction and recorded in the audit trail; the batch
/// keeps going.
pub struct TransactionImportService {
    asset_accounts: Arc<dyn AssetAccountProvider>,
    resolution: CounterAccountResolutionService,
    transfers: Arc<TransferReconciliationService>,
    ob_adjustment: OpeningBalanceAdjustmentService,
    factory: BankImportTransactionFactory,
    account_repo: Arc<dyn AccountRepository>,
    transaction_repo: Arc<dyn TransactionRepository>,
    import_repo: Arc<dyn TransactionImportRepository>,
    bank_store: Arc<dyn BankTransactionStore>,
    classifier: Option<Arc<dyn ClassifierPort>>,
    user: UserContext,
    config: ImportConfig,
}

pub struct TransactionImportServiceDeps {
    pub asset_accounts: Arc<dyn AssetAccountProvider>,
    pub resolution: CounterAccountResolutionService,
    pub transfers: Arc<TransferReconciliationService>,
    pub ob_adjustment: OpeningBalanceAdjustmentService,
    pub account_repo: Arc<dyn AccountRepository>,
    pub transaction_repo: Arc<dyn TransactionRepository>,
    pub import_repo: Arc<dyn TransactionImportRepository>,
    pub bank_store: Arc<dyn BankTransactionStore>,
    pub classifier: Option<Arc<dyn ClassifierPort>>,
    pub user: UserContext,
    pub config: ImportConfig,
}

impl TransactionImportService {
    pub fn new(deps: TransactionImportServiceDeps) -> Self {
        let factory = BankImportTransactionFactory::new(
            deps.user.clone(),
            deps.config.default_currency.clone(),
        );
        Self {
            asset_accounts: deps.asset_accounts,
            resolution: deps.resolution,
            transfers: deps.transfers,
            ob_adjustment: deps.ob_adjustment,
            factory,
            account_repo: deps.account_repo,
            transaction_repo: deps.transaction_repo,
            import_repo: deps.import_repo,
            bank_store: deps.bank_store,
            classifier: deps.classifier,
            user: deps.user,
            config: deps.config,
        }
    }

    pub async fn import_from_stored_transactions(
        &self,
        stored_transactions: &[StoredBankTransaction],
        source_iban: &str,
        auto_post: bool,
    ) -> Vec<TransactionImportResult> {
        let mut results = Vec::with_capacity(stored_transactions.len());
        for stored in stored_transactions {
            results.push(
                self.import_stored_transaction(stored, source_iban, auto_post)
                    .await,
            );
        }
        results
    }

    /// Batch variant fed by the batch classifier: per stored-transaction
    /// outcomes replace the rule/classifier tiers.
    pub async fn import_with_preclassified(
        &self,
        stored_transactions: &[StoredBankTransaction],
        source_iban: &str,
        preclassified: &HashMap<Uuid, PreclassifiedTransaction>,
        auto_post: bool,
    ) -> Vec<TransactionImportResult> {
        let mut results = Vec::with_capacity(stored_transactions.len());
        for stored in stored_transactions {
            let result = match self
                .attempt_import(stored, source_iban, preclassified.get(&stored.id), auto_post)
                .await
            {
                Ok(result) => result,
                Err(error) => self.record_failure(stored, &error).await,
            };
            results.push(result);
        }
        results
    }

    /// Import one stored bank transaction. Public so the sync layer can
    /// interleave progress events between transactions.
    pub async fn import_stored_transaction(
        &self,
        stored: &StoredBankTransaction,
        source_iban: &str,
        auto_post: bool,
    ) -> TransactionImportResult {
        match self.attempt_import(stored, source_iban, None, auto_post).await {
            Ok(result) => result,
            Err(error) => self.record_failure(stored, &error).await,
        }
    }

    pub async fn reconcile_transfers_for_account(
        &self,
        iban: &str,
        asset_account: &Account,
    ) -> ImportResult<usize> {
        Ok(self
            .transfers
            .reconcile_for_new_account(iban, asset_account)
            .await?)
    }

    async fn attempt_import(
        &self,
        stored: &StoredBankTransaction,
        source_iban: &str,
        preclassified: Option<&PreclassifiedTransaction>,
        auto_post: bool,
    ) -> ImportResult<TransactionImportResult> {
        let bank_transaction = stored.transaction.clone();

        if let Some(existing) = self
            .import_repo
            .find_by_bank_transaction_id(stored.id)
            .await?
            && existing.status == ImportStatus::Success
        {
            return Ok(TransactionImportResult {
                bank_transaction,
                status: ImportStatus::Duplicate,
                accounting_transaction: None,
                error_message: Some("Transaction already imported".into()),
                was_reconciled: false,
            });
        }

        let mut record = TransactionImport::new(self.user.user_id, stored.id);

        let skip_reason = if bank_transaction.amount.is_zero() {
            Some("zero amount".to_string())
        } else if bank_transaction.currency != self.config.default_currency {
            Some(format!(
                "unsupported currency: {}",
                bank_transaction.currency
            ))
        } else {
            None
        };
        if let Some(reason) = skip_reason {
            record.mark_as_skipped(&reason)?;
            self.import_repo.save(record).await?;
            tracing::debug!(bank_transaction_id = %stored.id, %reason, "skipped bank transaction");
            return Ok(TransactionImportResult {
                bank_transaction,
                status: ImportStatus::Skipped,
                accounting_transaction: None,
                error_message: Some(reason),
                was_reconciled: false,
            });
        }

        let asset_account = self
            .asset_accounts
            .get_or_create_asset_account(source_iban)
            .await?;
        let transfer_context = self.transfers.detect_transfer(&bank_transaction).await?;

        if transfer_context.reconcile_candidate
            && let Some(result) = self
                .try_reconcile(
                    stored,
                    &bank_transaction,
                    source_iban,
                    &transfer_context,
                    &asset_account,
                    &mut record,
                )
                .await?
        {
            return Ok(result);
        }

        let (counter_account, ai_resolution) = self
            .resolve_counter_account(&bank_transaction, &transfer_context, preclassified)
            .await?;

        let mut accounting_tx = self.factory.create(FactoryRequest {
            bank_transaction: &bank_transaction,
            asset_account: &asset_account,
            counter_account: &counter_account,
            source_iban,
            is_internal_transfer: transfer_context.is_internal_transfer,
            ai_resolution,
            merchant: preclassified.and_then(|pre| pre.merchant.clone()),
            recurring_pattern: preclassified.and_then(|pre| pre.recurring_pattern.clone()),
        })?;

        if auto_post {
            accounting_tx.post(&self.config.default_currency)?;
        }

        let saved = self
            .persist_import(
                accounting_tx,
                stored.id,
                &bank_transaction,
                source_iban,
                &transfer_context,
                record,
            )
            .await?;

        Ok(TransactionImportResult {
            bank_transaction,
            status: ImportStatus::Success,
            accounting_transaction: Some(saved),
            error_message: None,
            was_reconciled: false,
        })
    }

    /// Reconciliation short-circuit: when the opposite leg is already in
    /// the book, either finish as a duplicate (both legs imported) or
    /// convert the existing transaction in place.
    async fn try_reconcile(
        &self,
        stored: &StoredBankTransaction,
        bank_transaction: &BankTransaction,
        source_iban: &str,
        transfer_context: &TransferContext,
        asset_account: &Account,
        record: &mut TransactionImport,
    ) -> ImportResult<Option<TransactionImportResult>> {
        let Some(counterparty_iban) = transfer_context.counterparty_iban.as_deref() else {
            return Ok(None);
        };

        let Some(existing) = self
            .transfers
            .find_matching_transfer(bank_transaction, source_iban, counterparty_iban)
            .await?
        else {
            return Ok(None);
        };

        if existing.is_internal_transfer() {
            record.mark_as_imported(existing.id())?;
            self.import_repo.save(record.clone()).await?;
            self.bank_store.mark_imported(stored.id).await?;
            tracing::info!(
                transaction_id = %existing.id(),
                "transfer already imported from the other account"
            );
            return Ok(Some(TransactionImportResult {
                bank_transaction: bank_transaction.clone(),
                status: ImportStatus::Duplicate,
                accounting_transaction: Some(existing),
                error_message: Some("Transfer already imported from other account".into()),
                was_reconciled: false,
            }));
        }

        // From the existing transaction's perspective, the syncing account
        // is the counterparty.
        let converted = self
            .transfers
            .convert_to_internal_transfer(existing, asset_account, source_iban, counterparty_iban)
            .await?;
        record.mark_as_imported(converted.id())?;
        self.import_repo.save(record.clone()).await?;
        self.bank_store.mark_imported(stored.id).await?;

        Ok(Some(TransactionImportResult {
            bank_transaction: bank_transaction.clone(),
            status: ImportStatus::Success,
            accounting_transaction: Some(converted),
            error_message: Some("Reconciled existing transaction as internal transfer".into()),
            was_reconciled: true,
        }))
    }

    async fn resolve_counter_account(
        &self,
        bank_transaction: &BankTransaction,
        transfer_context: &TransferContext,
        preclassified: Option<&PreclassifiedTransaction>,
    ) -> ImportResult<(Account, Option<AiResolution>)> {
        // Internal transfers book against the counterparty asset account.
        if transfer_context.is_internal_transfer
            && let Some(account) = transfer_context.counterparty_account.clone()
        {
            return Ok((account, None));
        }

        if let Some(pre) = preclassified {
            if let Some(outcome) = &pre.outcome
                && let Some(account_id) = outcome.account_id
            {
                if let Some(account) = self.account_repo.find_by_id(account_id).await? {
                    let resolution = AiResolution {
                        account_id: Some(account.id),
                        account_number: Some(account.account_number.clone()),
                        confidence: outcome.confidence,
                        tier: outcome.tier.clone(),
                    };
                    return Ok((account, Some(resolution)));
                }
                tracing::warn!(
                    %account_id,
                    "preclassified result points at a missing account"
                );
            }
            let fallback = self
                .resolution
                .fallback_account(bank_transaction.is_debit())
                .await?;
            return Ok((fallback, None));
        }

        if let Some(outcome) = self.resolution.resolve_by_rules(bank_transaction).await? {
            return Ok((outcome.account, None));
        }

        if let Some(classifier) = &self.classifier {
            match classifier.classify(bank_transaction).await {
                Ok(Some(classified)) => {
                    if let Some(account_id) = classified.account_id
                        && let Some(account) = self.account_repo.find_by_id(account_id).await?
                    {
                        let resolution = AiResolution {
                            account_id: Some(account.id),
                            account_number: Some(account.account_number.clone()),
                            confidence: classified.confidence,
                            tier: classified.tier,
                        };
                        return Ok((account, Some(resolution)));
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    // Classifier failures degrade to the sign-based
                    // fallback; they never abort the import.
                    tracing::warn!(%error, "classifier failed, falling back");
                }
            }
        }

        let fallback = self
            .resolution
            .fallback_account(bank_transaction.is_debit())
            .await?;
        Ok((fallback, None))
    }

    /// The atomic persist unit: accounting save, audit record, optional
    /// opening-balance adjustment, mark-imported. Storage implementations
    /// guarantee atomicity of each save; failures before the first save
    /// leave no partial state.
    async fn persist_import(
        &self,
        accounting_tx: Transaction,
        stored_id: Uuid,
        bank_transaction: &BankTransaction,
        source_iban: &str,
        transfer_context: &TransferContext,
        mut record: TransactionImport,
    ) -> ImportResult<Transaction> {
        let saved = self.transaction_repo.save(accounting_tx).await?;
        record.mark_as_imported(saved.id())?;
        self.import_repo.save(record).await?;

        if transfer_context.is_internal_transfer
            && let (Some(counterparty_account), Some(counterparty_iban)) = (
                &transfer_context.counterparty_account,
                transfer_context.counterparty_iban.as_deref(),
            )
        {
            let transfer_hash =
                bank_transaction.transfer_identity_hash(source_iban, counterparty_iban);
            self.ob_adjustment
                .create_adjustment_if_needed(
                    counterparty_account,
                    counterparty_iban,
                    bank_transaction.amount.abs(),
                    bank_transaction.booking_date,
                    // Money out of the source account arrives at the
                    // counterparty.
                    bank_transaction.is_debit(),
                    Some(&transfer_hash),
                )
                .await?;
        }

        self.bank_store.mark_imported(stored_id).await?;
        Ok(saved)
    }

    async fn record_failure(
        &self,
        stored: &StoredBankTransaction,
        error: &ImportError,
    ) -> TransactionImportResult {
        let message = format!("Import failed: {error}");
        tracing::warn!(bank_transaction_id = %stored.id, %message, "import failed");

        let mut record = TransactionImport::new(self.user.user_id, stored.id);
        if record.mark_as_failed(&message).is_ok()
            && let Err(save_error) = self.import_repo.save(record).await
        {
            tracing::error!(%save_error, "could not persist failed import record");
        }

        TransactionImportResult {
            bank_transaction: stored.transaction.clone(),
            status: ImportStatus::Failed,
            accounting_transaction: None,
            error_message: Some(message),
            was_reconciled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ClassifiedCounterAccount;
    use crate::InMemoryCounterAccountRuleRepository;
    use crate::InMemoryTransactionImportRepository;
    use crate::rules::CounterAccountRule;
    use crate::rules::CounterAccountRuleRepository;
    use crate::rules::PatternType;
    use chrono::NaiveDate;
    use kassa_bank::InMemoryAccountMappingRepository;
    use kassa_bank::InMemoryBankTransactionStore;
    use kassa_ledger::InMemoryAccountRepository;
    use kassa_ledger::InMemoryTransactionRepository;
    use kassa_ledger::Money;
    use kassa_ledger::NewTransaction;
    use kassa_ledger::TransactionSource;
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio::sync::Mutex;

    const IBAN_A: &str = "DE11520513735120710131";
    const IBAN_B: &str = "DE89370400440532013000";

    struct Fixture {
        service: TransactionImportService,
        accounts: Arc<InMemoryAccountRepository>,
        transactions: Arc<InMemoryTransactionRepository>,
        imports: Arc<InMemoryTransactionImportRepository>,
        mappings: Arc<InMemoryAccountMappingRepository>,
        rules: Arc<InMemoryCounterAccountRuleRepository>,
        bank_store: Arc<InMemoryBankTransactionStore>,
        user: UserContext,
        checking: Account,
        fallback_expense: Account,
        fallback_income: Account,
    }

    struct ScriptedClassifier {
        responses: Mutex<Vec<ImportResult<Option<ClassifiedCounterAccount>>>>,
    }

    #[async_trait]
    impl ClassifierPort for ScriptedClassifier {
        async fn classify(
            &self,
            _transaction: &BankTransaction,
        ) -> ImportResult<Option<ClassifiedCounterAccount>> {
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                Ok(None)
            } else {
                responses.remove(0)
            }
        }
    }

    async fn fixture_with_classifier(classifier: Option<Arc<dyn ClassifierPort>>) -> Fixture {
        let user = UserContext::new(Uuid::new_v4(), "user@example.com");
        let accounts = Arc::new(InMemoryAccountRepository::new(user.clone()));
        let transactions = Arc::new(InMemoryTransactionRepository::new(user.clone()));
        let imports = Arc::new(InMemoryTransactionImportRepository::new(user.clone()));
        let mappings = Arc::new(InMemoryAccountMappingRepository::new(user.clone()));
        let rules = Arc::new(InMemoryCounterAccountRuleRepository::new(user.clone()));
        let bank_store = Arc::new(InMemoryBankTransactionStore::new());
        let config = ImportConfig::default();

        let checking = accounts
            .save(
                Account::new(
                    user.user_id,
                    "Checking",
                    AccountType::Asset,
                    "1200",
                    Currency::eur(),
                )
                .expect("account")
                .with_iban(IBAN_A),
            )
            .await
            .expect("save");
        mappings
            .save(
                AccountMapping::new(user.user_id, IBAN_A, checking.id, "Checking")
                    .expect("mapping"),
            )
            .await
            .expect("save mapping");

        let fallback_expense = accounts
            .save(
                Account::new(
                    user.user_id,
                    "Other expenses",
                    AccountType::Expense,
                    "4900",
                    Currency::eur(),
                )
                .expect("account"),
            )
            .await
            .expect("save");
        let fallback_income = accounts
            .save(
                Account::new(
                    user.user_id,
                    "Other income",
                    AccountType::Income,
                    "8200",
                    Currency::eur(),
                )
                .expect("account"),
            )
            .await
            .expect("save");

        let transfers = Arc::new(TransferReconciliationService::new(
            transactions.clone(),
            mappings.clone(),
            accounts.clone(),
            config.default_currency.clone(),
        ));
        let resolution = CounterAccountResolutionService::new(
            rules.clone(),
            accounts.clone(),
            config.clone(),
        );
        let ob_adjustment = OpeningBalanceAdjustmentService::new(
            accounts.clone(),
            transactions.clone(),
            user.clone(),
            config.clone(),
        );
        let asset_accounts = Arc::new(MappingAssetAccountProvider::new(
            mappings.clone(),
            accounts.clone(),
            user.clone(),
            config.default_currency.clone(),
        ));

        let service = TransactionImportService::new(TransactionImportServiceDeps {
            asset_accounts,
            resolution,
            transfers,
            ob_adjustment,
            account_repo: accounts.clone(),
            transaction_repo: transactions.clone(),
            import_repo: imports.clone(),
            bank_store: bank_store.clone(),
            classifier,
            user: user.clone(),
            config,
        });

        Fixture {
            service,
            accounts,
            transactions,
            imports,
            mappings,
            rules,
            bank_store,
            user,
            checking,
            fallback_expense,
            fallback_income,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with_classifier(None).await
    }

    fn bank_transaction(amount: Decimal, purpose: &str) -> BankTransaction {
        BankTransaction {
            booking_date: NaiveDate::from_ymd_opt(2025, 6, 2).expect("date"),
            value_date: NaiveDate::from_ymd_opt(2025, 6, 2).expect("date"),
            amount,
            currency: Currency::eur(),
            purpose: purpose.into(),
            applicant_name: Some("REWE Markt".into()),
            applicant_iban: None,
            applicant_bic: None,
            bank_reference: None,
            customer_reference: None,
            end_to_end_reference: None,
            mandate_reference: None,
        }
    }

    async fn store(fx: &Fixture, tx: BankTransaction) -> StoredBankTransaction {
        fx.bank_store
            .save_batch_with_deduplication(vec![tx], IBAN_A)
            .await
            .expect("store")
            .remove(0)
    }

    #[tokio::test]
    async fn zero_amount_is_skipped() {
        let fx = fixture().await;
        let stored = store(&fx, bank_transaction(Decimal::ZERO, "Nothing")).await;
        let result = fx
            .service
            .import_stored_transaction(&stored, IBAN_A, true)
            .await;
        assert_eq!(result.status, ImportStatus::Skipped);
        assert_eq!(result.error_message.as_deref(), Some("zero amount"));
        let record = fx
            .imports
            .find_by_bank_transaction_id(stored.id)
            .await
            .expect("find")
            .expect("record");
        assert_eq!(record.status, ImportStatus::Skipped);
    }

    #[tokio::test]
    async fn foreign_currency_is_skipped() {
        let fx = fixture().await;
        let mut tx = bank_transaction(dec!(-10), "USD payment");
        tx.currency = Currency::new("USD");
        let stored = store(&fx, tx).await;
        let result = fx
            .service
            .import_stored_transaction(&stored, IBAN_A, true)
            .await;
        assert_eq!(result.status, ImportStatus::Skipped);
        assert_eq!(
            result.error_message.as_deref(),
            Some("unsupported currency: USD")
        );
    }

    #[tokio::test]
    async fn fallback_import_posts_and_marks_everything() {
        let fx = fixture().await;
        let stored = store(&fx, bank_transaction(dec!(-12.50), "Einkauf")).await;
        let result = fx
            .service
            .import_stored_transaction(&stored, IBAN_A, true)
            .await;

        assert_eq!(result.status, ImportStatus::Success);
        let accounting = result.accounting_transaction.expect("transaction");
        assert!(accounting.is_posted());
        assert!(accounting.involves_account(fx.checking.id));
        assert!(accounting.involves_account(fx.fallback_expense.id));

        let record = fx
            .imports
            .find_by_bank_transaction_id(stored.id)
            .await
            .expect("find")
            .expect("record");
        assert_eq!(record.status, ImportStatus::Success);
        assert_eq!(record.accounting_transaction_id, Some(accounting.id()));

        let stored_after = fx
            .bank_store
            .find_by_id(stored.id)
            .await
            .expect("find")
            .expect("stored");
        assert!(stored_after.is_imported);
    }

    #[tokio::test]
    async fn incoming_amount_uses_income_fallback() {
        let fx = fixture().await;
        let stored = store(&fx, bank_transaction(dec!(100), "Gift")).await;
        let result = fx
            .service
            .import_stored_transaction(&stored, IBAN_A, true)
            .await;
        let accounting = result.accounting_transaction.expect("transaction");
        assert!(accounting.involves_account(fx.fallback_income.id));
    }

    #[tokio::test]
    async fn second_import_is_a_duplicate() {
        let fx = fixture().await;
        let stored = store(&fx, bank_transaction(dec!(-12.50), "Einkauf")).await;
        fx.service
            .import_stored_transaction(&stored, IBAN_A, true)
            .await;
        let result = fx
            .service
            .import_stored_transaction(&stored, IBAN_A, true)
            .await;
        assert_eq!(result.status, ImportStatus::Duplicate);
        assert_eq!(fx.transactions.list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn matching_rule_wins_and_counts() {
        let fx = fixture().await;
        let groceries = fx
            .accounts
            .save(
                Account::new(
                    fx.user.user_id,
                    "Groceries",
                    AccountType::Expense,
                    "4000",
                    Currency::eur(),
                )
                .expect("account"),
            )
            .await
            .expect("save");
        let rule = CounterAccountRule::new(
            fx.user.user_id,
            PatternType::CounterpartyName,
            "rewe",
            groceries.id,
        )
        .expect("rule");
        let rule_id = rule.id;
        fx.rules.save(rule).await.expect("save rule");

        let stored = store(&fx, bank_transaction(dec!(-12.50), "Einkauf")).await;
        let result = fx
            .service
            .import_stored_transaction(&stored, IBAN_A, true)
            .await;
        let accounting = result.accounting_transaction.expect("transaction");
        assert!(accounting.involves_account(groceries.id));

        let rules = fx.rules.list_active_by_priority().await.expect("rules");
        let matched = rules.iter().find(|rule| rule.id == rule_id).expect("rule");
        assert_eq!(matched.match_count, 1);
    }

    #[tokio::test]
    async fn preclassified_resolution_is_recorded_in_metadata() {
        let fx = fixture().await;
        let groceries = fx
            .accounts
            .save(
                Account::new(
                    fx.user.user_id,
                    "Groceries",
                    AccountType::Expense,
                    "4000",
                    Currency::eur(),
                )
                .expect("account"),
            )
            .await
            .expect("save");

        let mut preclassified = HashMap::new();
        let stored = store(&fx, bank_transaction(dec!(-12.50), "Einkauf")).await;
        preclassified.insert(
            stored.id,
            PreclassifiedTransaction {
                outcome: Some(ClassifiedCounterAccount {
                    account_id: Some(groceries.id),
                    account_number: Some("4000".into()),
                    confidence: 0.91,
                    tier: "example".into(),
                }),
                merchant: Some("REWE".into()),
                recurring_pattern: None,
            },
        );

        let results = fx
            .service
            .import_with_preclassified(&[stored], IBAN_A, &preclassified, true)
            .await;
        assert_eq!(results.len(), 1);
        let accounting = results[0]
            .accounting_transaction
            .as_ref()
            .expect("transaction");
        assert!(accounting.involves_account(groceries.id));
        let ai = accounting
            .metadata()
            .ai_resolution
            .as_ref()
            .expect("ai metadata");
        assert_eq!(ai.tier, "example");
        assert_eq!(accounting.metadata().merchant.as_deref(), Some("REWE"));
    }

    #[tokio::test]
    async fn classifier_resolution_is_used_when_rules_miss() {
        let classifier = Arc::new(ScriptedClassifier {
            responses: Mutex::new(Vec::new()),
        });
        let fx = fixture_with_classifier(Some(classifier.clone())).await;
        let groceries = fx
            .accounts
            .save(
                Account::new(
                    fx.user.user_id,
                    "Groceries",
                    AccountType::Expense,
                    "4000",
                    Currency::eur(),
                )
                .expect("account"),
            )
            .await
            .expect("save");
        classifier.responses.lock().await.push(Ok(Some(
            ClassifiedCounterAccount {
                account_id: Some(groceries.id),
                account_number: Some("4000".into()),
                confidence: 0.88,
                tier: "anchor".into(),
            },
        )));

        let stored = store(&fx, bank_transaction(dec!(-12.50), "Einkauf")).await;
        let result = fx
            .service
            .import_stored_transaction(&stored, IBAN_A, true)
            .await;
        let accounting = result.accounting_transaction.expect("transaction");
        assert!(accounting.involves_account(groceries.id));
        let ai = accounting
            .metadata()
            .ai_resolution
            .as_ref()
            .expect("ai metadata");
        assert_eq!(ai.tier, "anchor");
    }

    #[tokio::test]
    async fn classifier_error_degrades_to_fallback() {
        let classifier = Arc::new(ScriptedClassifier {
            responses: Mutex::new(vec![Err(ImportError::Classifier("encoder died".into()))]),
        });
        let fx = fixture_with_classifier(Some(classifier)).await;
        let stored = store(&fx, bank_transaction(dec!(-12.50), "Einkauf")).await;
        let result = fx
            .service
            .import_stored_transaction(&stored, IBAN_A, true)
            .await;
        assert_eq!(result.status, ImportStatus::Success);
        let accounting = result.accounting_transaction.expect("transaction");
        assert!(accounting.involves_account(fx.fallback_expense.id));
    }

    #[tokio::test]
    async fn failure_is_isolated_and_audited() {
        let fx = fixture().await;
        // Remove the income fallback so an incoming transaction cannot
        // resolve: deactivating makes find_by_account_number miss it.
        fx.accounts
            .deactivate(fx.fallback_income.id)
            .await
            .expect("deactivate");

        let good_one = store(&fx, bank_transaction(dec!(-10), "First")).await;
        let bad = store(&fx, bank_transaction(dec!(50), "Broken")).await;
        let good_two = store(&fx, bank_transaction(dec!(-20), "Third")).await;

        let results = fx
            .service
            .import_from_stored_transactions(
                &[good_one.clone(), bad.clone(), good_two.clone()],
                IBAN_A,
                true,
            )
            .await;

        assert_eq!(results[0].status, ImportStatus::Success);
        assert_eq!(results[1].status, ImportStatus::Failed);
        assert!(
            results[1]
                .error_message
                .as_deref()
                .expect("message")
                .contains("fallback account")
        );
        assert_eq!(results[2].status, ImportStatus::Success);

        let record = fx
            .imports
            .find_by_bank_transaction_id(bad.id)
            .await
            .expect("find")
            .expect("record");
        assert_eq!(record.status, ImportStatus::Failed);
        // The failed transaction left no accounting rows behind.
        assert_eq!(fx.transactions.list().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn reconciles_against_the_existing_leg() {
        let fx = fixture().await;

        // Map the counterparty account B.
        let savings = fx
            .accounts
            .save(
                Account::new(
                    fx.user.user_id,
                    "Savings",
                    AccountType::Asset,
                    "1300",
                    Currency::eur(),
                )
                .expect("account")
                .with_iban(IBAN_B),
            )
            .await
            .expect("save");
        fx.mappings
            .save(
                AccountMapping::new(fx.user.user_id, IBAN_B, savings.id, "Savings")
                    .expect("mapping"),
            )
            .await
            .expect("save mapping");

        // B already imported its outgoing leg yesterday: -100 to A.
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).expect("date");
        let mut params = NewTransaction::manual(fx.user.user_id, "Outgoing transfer", date);
        params.source = TransactionSource::BankImport;
        params.source_iban = Some(IBAN_B.into());
        params.counterparty_iban = Some(IBAN_A.into());
        let mut first_leg = Transaction::new(params).expect("tx");
        first_leg
            .add_debit(
                fx.fallback_expense.clone(),
                Money::new(dec!(100), Currency::eur()),
            )
            .expect("debit");
        first_leg
            .add_credit(savings.clone(), Money::new(dec!(100), Currency::eur()))
            .expect("credit");
        first_leg.post(&Currency::eur()).expect("post");
        let first_leg_id = first_leg.id();
        fx.transactions.save(first_leg).await.expect("save");

        // A's sync now sees +100 from B.
        let mut incoming = bank_transaction(dec!(100), "Transfer");
        incoming.applicant_iban = Some(IBAN_B.into());
        let stored = store(&fx, incoming).await;
        let result = fx
            .service
            .import_stored_transaction(&stored, IBAN_A, true)
            .await;

        assert_eq!(result.status, ImportStatus::Success);
        assert!(result.was_reconciled);
        let accounting = result.accounting_transaction.expect("transaction");
        assert_eq!(accounting.id(), first_leg_id);
        assert!(accounting.is_internal_transfer());
        // No second accounting transaction was created.
        assert_eq!(fx.transactions.list().await.expect("list").len(), 1);

        // Importing the same stored transaction again is a duplicate.
        let again = fx
            .service
            .import_stored_transaction(&stored, IBAN_A, true)
            .await;
        assert_eq!(again.status, ImportStatus::Duplicate);
    }

    #[tokio::test]
    async fn both_legs_already_internal_finishes_as_duplicate() {
        let fx = fixture().await;
        let savings = fx
            .accounts
            .save(
                Account::new(
                    fx.user.user_id,
                    "Savings",
                    AccountType::Asset,
                    "1300",
                    Currency::eur(),
                )
                .expect("account")
                .with_iban(IBAN_B),
            )
            .await
            .expect("save");
        fx.mappings
            .save(
                AccountMapping::new(fx.user.user_id, IBAN_B, savings.id, "Savings")
                    .expect("mapping"),
            )
            .await
            .expect("save mapping");

        // An already-converted internal transfer sits in the book.
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).expect("date");
        let mut params = NewTransaction::manual(fx.user.user_id, "Outgoing transfer", date);
        params.source = TransactionSource::BankImport;
        params.source_iban = Some(IBAN_B.into());
        params.counterparty_iban = Some(IBAN_A.into());
        let mut existing = Transaction::new(params).expect("tx");
        existing
            .add_debit(
                fx.fallback_expense.clone(),
                Money::new(dec!(100), Currency::eur()),
            )
            .expect("debit");
        existing
            .add_credit(savings.clone(), Money::new(dec!(100), Currency::eur()))
            .expect("credit");
        existing.post(&Currency::eur()).expect("post");
        existing
            .convert_to_internal_transfer(&fx.checking, "prior-hash", &Currency::eur())
            .expect("convert");
        fx.transactions.save(existing).await.expect("save");

        let mut incoming = bank_transaction(dec!(100), "Transfer");
        incoming.applicant_iban = Some(IBAN_B.into());
        let stored = store(&fx, incoming).await;
        let result = fx
            .service
            .import_stored_transaction(&stored, IBAN_A, true)
            .await;

        assert_eq!(result.status, ImportStatus::Duplicate);
        assert!(!result.was_reconciled);
        assert_eq!(fx.transactions.list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn bootstraps_asset_account_for_unmapped_iban() {
        let fx = fixture().await;
        let unmapped = "DE75512108001245126199";
        let stored = fx
            .bank_store
            .save_batch_with_deduplication(
                vec![bank_transaction(dec!(-5), "Coffee")],
                unmapped,
            )
            .await
            .expect("store")
            .remove(0);
        let result = fx
            .service
            .import_stored_transaction(&stored, unmapped, true)
            .await;
        assert_eq!(result.status, ImportStatus::Success);
        assert!(
            fx.mappings
                .find_by_iban(unmapped)
                .await
                .expect("find")
                .is_some()
        );
        assert!(
            fx.accounts
                .find_by_iban(unmapped)
                .await
                .expect("find")
                .is_some()
        );
    }
}
