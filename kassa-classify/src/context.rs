use chrono::NaiveDate;
use rust_decimal::Decimal;
use uuid::Uuid;

use kassa_ledger::AccountId;

use crate::TransactionInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBy {
    Example,
    Anchor,
}

impl ResolvedBy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResolvedBy::Example => "example",
            ResolvedBy::Anchor => "anchor",
        }
    }
}

/// A classification candidate produced by one of the tiers.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationMatch {
    pub account_id: AccountId,
    pub account_number: String,
    pub confidence: f32,
}

/// One transaction flowing through the pipeline. Tiers mutate this in
/// place; later tiers skip contexts that are already resolved.
#[derive(Debug, Clone)]
pub struct TransactionContext {
    pub transaction_id: Uuid,
    pub raw_counterparty: Option<String>,
    pub raw_purpose: String,
    pub amount: Decimal,
    pub booking_date: NaiveDate,

    // Preprocessing.
    pub cleaned_counterparty: Option<String>,
    pub cleaned_purpose: Option<String>,
    pub matched_keywords: Vec<String>,

    // Example tier.
    pub example_match: Option<ClassificationMatch>,

    // Enrichment tier.
    pub search_enrichment: Option<String>,

    // Anchor tier.
    pub anchor_match: Option<ClassificationMatch>,

    pub resolved: bool,
    pub resolved_by: Option<ResolvedBy>,
}

impl TransactionContext {
    #[must_use]
    pub fn from_input(input: &TransactionInput) -> Self {
        Self {
            transaction_id: input.transaction_id,
            raw_counterparty: input.counterparty_name.clone(),
            raw_purpose: input.purpose.clone(),
            amount: input.amount,
            booking_date: input.booking_date,
            cleaned_counterparty: None,
            cleaned_purpose: None,
            matched_keywords: Vec::new(),
            example_match: None,
            search_enrichment: None,
            anchor_match: None,
            resolved: false,
            resolved_by: None,
        }
    }

    /// The winning match according to `resolved_by`.
    #[must_use]
    pub fn classification(&self) -> Option<&ClassificationMatch> {
        match self.resolved_by {
            Some(ResolvedBy::Example) => self.example_match.as_ref(),
            Some(ResolvedBy::Anchor) => self.anchor_match.as_ref(),
            None => None,
        }
    }

    /// Query text for the example tier: cleaned counterparty + purpose.
    #[must_use]
    pub fn example_query_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(counterparty) = self.cleaned_counterparty.as_deref() {
            parts.push(counterparty);
        }
        if let Some(purpose) = self.cleaned_purpose.as_deref() {
            parts.push(purpose);
        }
        parts.join(" ")
    }

    /// Query text for the anchor tier; includes the enrichment when the
    /// enrichment tier found one.
    #[must_use]
    pub fn anchor_query_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(counterparty) = self.cleaned_counterparty.as_deref() {
            parts.push(counterparty);
        }
        if let Some(purpose) = self.cleaned_purpose.as_deref() {
            parts.push(purpose);
        }
        if let Some(enrichment) = self.search_enrichment.as_deref() {
            parts.push(enrichment);
        }
        parts.join(" ")
    }
}
