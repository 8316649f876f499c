use std::sync::Arc;

use kassa_bank::BankConnectionPort;
use kassa_bank::InMemoryAccountMappingRepository;
use kassa_bank::InMemoryBankAccountRepository;
use kassa_bank::InMemoryBankTransactionStore;
use kassa_bank::InMemoryCredentialStore;
use kassa_classify::ClassificationPipeline;
use kassa_classify::ClassificationPipelineDeps;
use kassa_classify::ClassifierConfig;
use kassa_classify::EnrichmentService;
use kassa_classify::HashedBagEncoder;
use kassa_classify::InMemoryAnchorStore;
use kassa_classify::InMemoryExampleStore;
use kassa_classify::InMemoryNoiseModelRepository;
use kassa_classify::KeywordEnricher;
use kassa_classify::SearchClient;
use kassa_classify::TextEncoder;
use kassa_import::CounterAccountResolutionService;
use kassa_import::InMemoryCounterAccountRuleRepository;
use kassa_import::InMemoryTransactionImportRepository;
use kassa_import::MappingAssetAccountProvider;
use kassa_import::OpeningBalanceAdjustmentService;
use kassa_import::TransactionImportService;
use kassa_import::TransactionImportServiceDeps;
use kassa_ledger::InMemoryAccountRepository;
use kassa_ledger::InMemoryTransactionRepository;
use kassa_ledger::UserContext;
use kassa_reconcile::TransferReconciliationService;

use crate::PipelineClassifier;
use crate::SyncConfig;
use crate::TransactionSyncCommand;
use crate::TransactionSyncCommandDeps;

/// Composition root: one user's fully wired sync stack on in-memory
/// storage. Every service takes its concrete ports through an explicit
/// constructor; this is the only place that knows the whole graph.
pub struct SyncStack {
    pub command: Arc<TransactionSyncCommand>,
    pub pipeline: Arc<ClassificationPipeline>,
    pub accounts: Arc<InMemoryAccountRepository>,
    pub transactions: Arc<InMemoryTransactionRepository>,
    pub mappings: Arc<InMemoryAccountMappingRepository>,
    pub imports: Arc<InMemoryTransactionImportRepository>,
    pub rules: Arc<InMemoryCounterAccountRuleRepository>,
    pub bank_store: Arc<InMemoryBankTransactionStore>,
    pub bank_accounts: Arc<InMemoryBankAccountRepository>,
    pub credentials: Arc<InMemoryCredentialStore>,
    pub noise_models: Arc<InMemoryNoiseModelRepository>,
    pub user: UserContext,
}

impl SyncStack {
    pub fn in_memory(
        user: UserContext,
        adapter: Arc<dyn BankConnectionPort>,
        config: SyncConfig,
        classifier_config: ClassifierConfig,
        search: Option<Arc<dyn SearchClient>>,
    ) -> Self {
        let accounts = Arc::new(InMemoryAccountRepository::new(user.clone()));
        let transactions = Arc::new(InMemoryTransactionRepository::new(user.clone()));
        let mappings = Arc::new(InMemoryAccountMappingRepository::new(user.clone()));
        let imports = Arc::new(InMemoryTransactionImportRepository::new(user.clone()));
        let rules = Arc::new(InMemoryCounterAccountRuleRepository::new(user.clone()));
        let bank_store = Arc::new(InMemoryBankTransactionStore::new());
        let bank_accounts = Arc::new(InMemoryBankAccountRepository::new());
        let credentials = Arc::new(InMemoryCredentialStore::new());

        let encoder: Arc<dyn TextEncoder> = Arc::new(HashedBagEncoder::default());
        let noise_models = Arc::new(InMemoryNoiseModelRepository::new());
        let enrichment = EnrichmentService::new(
            Some(KeywordEnricher::default()),
            search,
            &classifier_config,
        );
        let pipeline = Arc::new(ClassificationPipeline::new(ClassificationPipelineDeps {
            encoder: encoder.clone(),
            noise_repo: noise_models.clone(),
            example_repo: Arc::new(InMemoryExampleStore::new(
                encoder.dimension(),
                classifier_config.max_examples_per_account,
            )),
            anchor_repo: Arc::new(InMemoryAnchorStore::new(encoder.dimension())),
            enrichment: Some(enrichment),
            config: classifier_config,
        }));

        let transfers = Arc::new(TransferReconciliationService::new(
            transactions.clone(),
            mappings.clone(),
            accounts.clone(),
            config.import.default_currency.clone(),
        ));
        let import_service = Arc::new(TransactionImportService::new(TransactionImportServiceDeps {
            asset_accounts: Arc::new(MappingAssetAccountProvider::new(
                mappings.clone(),
                accounts.clone(),
                user.clone(),
                config.import.default_currency.clone(),
            )),
            resolution: CounterAccountResolutionService::new(
                rules.clone(),
                accounts.clone(),
                config.import.clone(),
            ),
            transfers,
            ob_adjustment: OpeningBalanceAdjustmentService::new(
                accounts.clone(),
                transactions.clone(),
                user.clone(),
                config.import.clone(),
            ),
            account_repo: accounts.clone(),
            transaction_repo: transactions.clone(),
            import_repo: imports.clone(),
            bank_store: bank_store.clone(),
            classifier: Some(Arc::new(PipelineClassifier::new(pipeline.clone()))),
            user: user.clone(),
            config: config.import.clone(),
        }));

        let command = Arc::new(TransactionSyncCommand::new(TransactionSyncCommandDeps {
            adapter,
            import_service,
            mapping_repo: mappings.clone(),
            credential_store: Some(credentials.clone()),
            account_repo: accounts.clone(),
            transaction_repo: transactions.clone(),
            bank_account_repo: Some(bank_accounts.clone()),
            bank_store: bank_store.clone(),
            user: user.clone(),
            config,
        }));

        Self {
            command,
            pipeline,
            accounts,
            transactions,
            mappings,
            imports,
            rules,
            bank_store,
            bank_accounts,
            credentials,
            noise_models,
            user,
        }
    }
}
