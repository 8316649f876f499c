#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use kassa_ledger::AccountId;

mod anchor;
mod context;
mod encoder;
mod enrich;
mod example;
mod merchant;
mod noise;
mod pipeline;
mod preprocess;
mod recurring;
mod store;

pub use crate::anchor::AnchorClassifier;
pub use crate::context::ClassificationMatch;
pub use crate::context::ResolvedBy;
pub use crate::context::TransactionContext;
pub use crate::encoder::HashedBagEncoder;
pub use crate::encoder::TextEncoder;
pub use crate::enrich::EnrichmentService;
pub use crate::enrich::KeywordEnricher;
pub use crate::enrich::SearchClient;
pub use crate::enrich::SearchResult;
pub use crate::enrich::SearxClient;
pub use crate::enrich::extract_enrichment_text;
pub use crate::example::ExampleClassifier;
pub use crate::merchant::KNOWN_MERCHANTS;
pub use crate::merchant::extract_merchant;
pub use crate::merchant::is_known_merchant;
pub use crate::noise::InMemoryNoiseModelRepository;
pub use crate::noise::NoiseModel;
pub use crate::noise::NoiseModelRepository;
pub use crate::noise::NoiseModelSnapshot;
pub use crate::pipeline::ClassificationPipeline;
pub use crate::pipeline::ClassificationPipelineDeps;
pub use crate::preprocess::PatternMatcher;
pub use crate::preprocess::TextCleaner;
pub use crate::preprocess::clean_counterparty;
pub use crate::recurring::RecurringDetector;
pub use crate::recurring::RecurringPattern;
pub use crate::recurring::RecurringResult;
pub use crate::store::AnchorEmbeddingRepository;
pub use crate::store::EmbeddingMatrix;
pub use crate::store::ExampleEmbeddingRepository;
pub use crate::store::InMemoryAnchorStore;
pub use crate::store::InMemoryExampleStore;

pub type ClassifyResult<T> = Result<T, ClassifyError>;

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("encoder failure: {0}")]
    Encoder(String),
    #[error("embedding storage failure: {0}")]
    Storage(String),
    #[error("search enrichment failure: {0}")]
    Search(String),
    #[error("invalid input: {0}")]
    Invalid(String),
}

/// A bank transaction as the classifier sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionInput {
    pub transaction_id: Uuid,
    pub counterparty_name: Option<String>,
    pub purpose: String,
    pub amount: Decimal,
    pub booking_date: NaiveDate,
}

/// Per-transaction output of the pipeline. `resolved_by == None` means
/// unresolved; the import coordinator applies its own fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationOutcome {
    pub transaction_id: Uuid,
    pub account_id: Option<AccountId>,
    pub account_number: Option<String>,
    pub confidence: f32,
    pub resolved_by: Option<ResolvedBy>,
}

impl ClassificationOutcome {
    #[must_use]
    pub fn unresolved(transaction_id: Uuid) -> Self {
        Self {
            transaction_id,
            account_id: None,
            account_number: None,
            confidence: 0.0,
            resolved_by: None,
        }
    }
}

/// Tunables of the classification pipeline. Per-user configurable and
/// persisted as settings, hence the serde round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Example tier accepts outright at or above this similarity.
    pub example_high_confidence: f32,
    /// Example tier accepts above this similarity with a clear margin.
    pub example_accept_threshold: f32,
    pub example_margin_threshold: f32,
    pub anchor_accept_threshold: f32,
    /// Tokens appearing in more than this share of observed documents are
    /// treated as boilerplate.
    pub noise_frequency_threshold: f32,
    pub max_examples_per_account: usize,
    pub enrichment_max_length: usize,
    pub search_timeout: Duration,
    /// Cooperative pause between search-backend queries.
    pub search_cooldown: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            example_high_confidence: 0.85,
            example_accept_threshold: 0.70,
            example_margin_threshold: 0.10,
            anchor_accept_threshold: 0.55,
            noise_frequency_threshold: 0.30,
            max_examples_per_account: 100,
            enrichment_max_length: 300,
            search_timeout: Duration::from_secs(10),
            search_cooldown: Duration::from_secs(1),
        }
    }
}
