use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::ClassifierConfig;
use crate::NoiseModel;
use crate::context::TransactionContext;

/// Payment providers stripped from counterparty names.
pub const PAYMENT_PROVIDERS: [&str; 5] = ["PAYPAL", "SUMUP", "ZETTLE", "STRIPE", "KLARNA"];

static TOKEN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-ZäöüÄÖÜß]+").unwrap_or_else(|_| unreachable!()));

static SEPARATOR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[./*]+").unwrap_or_else(|_| unreachable!()));

/// Lowercase word tokens; digits and punctuation are separators.
pub fn tokenize(text: &str) -> Vec<String> {
    TOKEN_PATTERN
        .find_iter(text)
        .map(|token| token.as_str().to_lowercase())
        .collect()
}

/// Strip payment-provider prefixes, turn punctuation separators into
/// spaces, collapse whitespace.
pub fn clean_counterparty(counterparty: Option<&str>) -> Option<String> {
    let raw = counterparty?.trim();
    if raw.is_empty() {
        return None;
    }

    let upper = raw.to_uppercase();
    let mut text = raw.to_string();
    for provider in PAYMENT_PROVIDERS {
        if upper.starts_with(provider) {
            let remainder = &raw[provider.len()..];
            text = remainder.trim_start_matches(['.', '/', '*']).to_string();
            break;
        }
    }

    let text = SEPARATOR_PATTERN.replace_all(&text, " ");
    let collapsed = text.split_whitespace().collect::<Vec<&str>>().join(" ");
    if collapsed.is_empty() { None } else { Some(collapsed) }
}

/// Preprocessor filling the cleaned fields of each context: counterparty
/// via provider stripping, purpose via the noise model.
pub struct TextCleaner<'a> {
    noise_model: &'a mut NoiseModel,
    threshold: f32,
}

impl<'a> TextCleaner<'a> {
    pub fn new(noise_model: &'a mut NoiseModel, config: &ClassifierConfig) -> Self {
        Self {
            noise_model,
            threshold: config.noise_frequency_threshold,
        }
    }

    pub fn process_batch(&mut self, contexts: &mut [TransactionContext]) {
        for ctx in contexts.iter_mut() {
            ctx.cleaned_counterparty = clean_counterparty(ctx.raw_counterparty.as_deref());
            let cleaned = self.noise_model.clean(&ctx.raw_purpose, self.threshold);
            ctx.cleaned_purpose = if cleaned.is_empty() { None } else { Some(cleaned) };
        }
    }
}

/// Keyword table mapping lexical hits to category labels. Labels are
/// metadata for downstream consumers; they never classify by themselves.
static KEYWORDS: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        // Housing
        ("miete", "rent"),
        ("nebenkosten", "rent"),
        ("strom", "utilities"),
        ("heizung", "utilities"),
        ("rundfunk", "utilities"),
        // Income
        ("gehalt", "income"),
        ("lohn", "income"),
        ("bezuege", "income"),
        // Refunds
        ("erstattung", "refund"),
        ("rueckzahlung", "refund"),
        ("gutschrift", "refund"),
        // Food
        ("restaurant", "restaurant"),
        ("gastronomie", "restaurant"),
        ("lieferung", "delivery"),
        // Transport
        ("tankstelle", "fuel"),
        ("tanken", "fuel"),
        ("benzin", "fuel"),
        ("diesel", "fuel"),
        // Subscriptions
        ("abonnement", "subscription"),
        ("abo", "subscription"),
        ("mitgliedschaft", "membership"),
        // Insurance
        ("versicherung", "insurance"),
        ("beitrag", "contribution"),
    ])
});

/// Attaches category labels for known keywords found in the cleaned
/// counterparty and purpose.
#[derive(Default)]
pub struct PatternMatcher;

impl PatternMatcher {
    pub fn new() -> Self {
        Self
    }

    fn find_labels(text: &str) -> Vec<&'static str> {
        let lower = text.to_lowercase();
        KEYWORDS
            .iter()
            .filter(|(keyword, _)| lower.contains(*keyword))
            .map(|(_, label)| *label)
            .collect()
    }

    pub fn process_batch(&self, contexts: &mut [TransactionContext]) {
        for ctx in contexts.iter_mut() {
            let mut labels: Vec<&'static str> = Vec::new();
            if let Some(counterparty) = &ctx.cleaned_counterparty {
                labels.extend(Self::find_labels(counterparty));
            }
            if let Some(purpose) = &ctx.cleaned_purpose {
                labels.extend(Self::find_labels(purpose));
            }
            labels.sort_unstable();
            labels.dedup();
            ctx.matched_keywords = labels.into_iter().map(str::to_string).collect();
        }
    }
}
