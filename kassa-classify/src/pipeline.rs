use std::sync::Arc;

use uuid::Uuid;

use kassa_ledger::Account;
use kassa_ledger::AccountType;

use crate::AnchorClassifier;
use crate::ClassificationOutcome;
use crate::ClassifierConfig;
use crate::ClassifyResult;
use crate::EnrichmentService;
use crate::ExampleClassifier;
use crate::NoiseModel;
use crate::NoiseModelRepository;
use crate::TextEncoder;
use crate::TransactionInput;
use crate::context::TransactionContext;
use crate::preprocess::PatternMatcher;
use crate::preprocess::TextCleaner;
use crate::preprocess::clean_counterparty;
use crate::store::AnchorEmbeddingRepository;
use crate::store::ExampleEmbeddingRepository;

pub struct ClassificationPipelineDeps {
    pub encoder: Arc<dyn TextEncoder>,
    pub noise_repo: Arc<dyn NoiseModelRepository>,
    pub example_repo: Arc<dyn ExampleEmbeddingRepository>,
    pub anchor_repo: Arc<dyn AnchorEmbeddingRepository>,
    pub enrichment: Option<EnrichmentService>,
    pub config: ClassifierConfig,
}

/// The tiered classification pipeline.
///
/// Tier order: preprocessing (text cleaning, pattern labels, noise-model
/// update), example matching against the user's history, enrichment for
/// whatever is still open, anchor matching against account descriptions.
/// Later tiers only see unresolved transactions; the pipeline exits early
/// once everything is resolved.
pub struct ClassificationPipeline {
    encoder: Arc<dyn TextEncoder>,
    noise_repo: Arc<dyn NoiseModelRepository>,
    example_repo: Arc<dyn ExampleEmbeddingRepository>,
    anchor_repo: Arc<dyn AnchorEmbeddingRepository>,
    enrichment: Option<EnrichmentService>,
    config: ClassifierConfig,
}

impl ClassificationPipeline {
    pub fn new(deps: ClassificationPipelineDeps) -> Self {
        Self {
            encoder: deps.encoder,
            noise_repo: deps.noise_repo,
            example_repo: deps.example_repo,
            anchor_repo: deps.anchor_repo,
            enrichment: deps.enrichment,
            config: deps.config,
        }
    }

    /// Classify a batch. Internal failures yield unresolved outcomes so
    /// the importer's own fallback applies; this method never fails and
    /// never masks importer-level errors.
    pub async fn classify(&self, transactions: &[TransactionInput]) -> Vec<ClassificationOutcome> {
        match self.run(transactions).await {
            Ok(outcomes) => outcomes,
            Err(error) => {
                tracing::warn!(%error, "classification pipeline failed, returning unresolved");
                transactions
                    .iter()
                    .map(|transaction| ClassificationOutcome::unresolved(transaction.transaction_id))
                    .collect()
            }
        }
    }

    async fn run(
        &self,
        transactions: &[TransactionInput],
    ) -> ClassifyResult<Vec<ClassificationOutcome>> {
        tracing::info!(count = transactions.len(), "starting classification");

        // Per-request user data.
        let mut noise_model = NoiseModel::from_snapshot(self.noise_repo.load().await?);

        // Observe the incoming batch and persist the updated model before
        // anything can fail further down.
        let observed: Vec<String> = transactions.iter().map(observation_text).collect();
        noise_model.observe_batch(&observed);
        self.noise_repo.save(noise_model.snapshot()).await?;

        let mut contexts: Vec<TransactionContext> =
            transactions.iter().map(TransactionContext::from_input).collect();

        // Tier 1: preprocessing.
        TextCleaner::new(&mut noise_model, &self.config).process_batch(&mut contexts);
        PatternMatcher::new().process_batch(&mut contexts);

        // Tier 2: examples.
        let examples = self.example_repo.embeddings_matrix().await?;
        ExampleClassifier::new(self.encoder.clone(), self.config.clone())
            .classify_batch(&mut contexts, &examples)
            .await?;
        let resolved = contexts.iter().filter(|ctx| ctx.resolved).count();
        tracing::info!(resolved, total = contexts.len(), "example tier done");
        if resolved == contexts.len() {
            return Ok(build_outcomes(&contexts));
        }

        // Tier 3: enrichment for the remainder.
        if let Some(enrichment) = &self.enrichment {
            let enriched = enrichment.enrich_batch(&mut contexts).await;
            tracing::info!(enriched, "enrichment tier done");
        }

        // Tier 4: anchors.
        let anchors = self.anchor_repo.embeddings_matrix().await?;
        AnchorClassifier::new(self.encoder.clone(), &self.config)
            .classify_batch(&mut contexts, &anchors)
            .await?;
        let resolved = contexts.iter().filter(|ctx| ctx.resolved).count();
        tracing::info!(resolved, total = contexts.len(), "classification complete");

        Ok(build_outcomes(&contexts))
    }

    /// Store a classification example after a posted import, so the next
    /// sync profits from it.
    pub async fn add_example(
        &self,
        account: &Account,
        counterparty: Option<&str>,
        purpose: &str,
        transaction_id: Option<Uuid>,
    ) -> ClassifyResult<usize> {
        let mut noise_model = NoiseModel::from_snapshot(self.noise_repo.load().await?);
        let mut parts: Vec<String> = Vec::new();
        if let Some(cleaned) = clean_counterparty(counterparty) {
            parts.push(cleaned);
        }
        let cleaned_purpose =
            noise_model.clean(purpose, self.config.noise_frequency_threshold);
        if !cleaned_purpose.is_empty() {
            parts.push(cleaned_purpose);
        }
        let text = parts.join(" ");
        let matrix = self.encoder.encode(std::slice::from_ref(&text)).await?;
        self.example_repo
            .append_example(
                account.id,
                &account.account_number,
                matrix.row(0).to_vec(),
                &text,
                transaction_id,
            )
            .await
    }

    /// Recompute anchor embeddings for the eligible counter-accounts
    /// (active income and expense accounts).
    pub async fn embed_accounts(&self, accounts: &[Account]) -> ClassifyResult<usize> {
        let eligible: Vec<&Account> = accounts
            .iter()
            .filter(|account| {
                account.is_active
                    && matches!(
                        account.account_type,
                        AccountType::Income | AccountType::Expense
                    )
            })
            .collect();
        if eligible.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = eligible
            .iter()
            .map(|account| account.anchor_text())
            .collect();
        let matrix = self.encoder.encode(&texts).await?;
        for (i, account) in eligible.iter().enumerate() {
            self.anchor_repo
                .set_anchor(
                    account.id,
                    &account.account_number,
                    &texts[i],
                    matrix.row(i).to_vec(),
                )
                .await?;
        }
        Ok(eligible.len())
    }

    #[must_use]
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }
}

fn observation_text(transaction: &TransactionInput) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(counterparty) = transaction.counterparty_name.as_deref() {
        parts.push(counterparty);
    }
    parts.push(&transaction.purpose);
    parts.join(" ")
}

fn build_outcomes(contexts: &[TransactionContext]) -> Vec<ClassificationOutcome> {
    contexts
        .iter()
        .map(|ctx| match ctx.classification() {
            Some(winner) => ClassificationOutcome {
                transaction_id: ctx.transaction_id,
                account_id: Some(winner.account_id),
                account_number: Some(winner.account_number.clone()),
                confidence: winner.confidence,
                resolved_by: ctx.resolved_by,
            },
            None => ClassificationOutcome::unresolved(ctx.transaction_id),
        })
        .collect()
}
