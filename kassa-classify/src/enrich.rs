use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::ClassifierConfig;
use crate::context::TransactionContext;
use crate::preprocess::tokenize;

/// A single hit from the search enrichment backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub title: String,
    pub content: String,
    pub url: String,
    pub score: f32,
}

/// Search enrichment collaborator; may return an empty list, and callers
/// treat every failure as "no enrichment".
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str) -> Vec<SearchResult>;
}

#[derive(Debug, Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxWebResult>,
    #[serde(default)]
    infoboxes: Vec<SearxInfobox>,
}

#[derive(Debug, Deserialize)]
struct SearxWebResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    score: f32,
}

#[derive(Debug, Deserialize)]
struct SearxInfobox {
    #[serde(default)]
    infobox: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    id: String,
}

/// SearXNG-style JSON search client.
pub struct SearxClient {
    base_url: String,
    client: reqwest::Client,
    language: String,
    max_results: usize,
}

impl SearxClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        language: impl Into<String>,
        max_results: usize,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            language: language.into(),
            max_results,
        }
    }

    fn parse_response(&self, response: SearxResponse) -> Vec<SearchResult> {
        let mut results: Vec<SearchResult> = response
            .results
            .into_iter()
            .take(self.max_results)
            .map(|item| SearchResult {
                title: item.title,
                content: item.content,
                url: item.url,
                score: item.score,
            })
            .collect();
        let remaining = self.max_results.saturating_sub(results.len());
        results.extend(response.infoboxes.into_iter().take(remaining).map(|item| {
            SearchResult {
                title: item.infobox,
                content: item.content,
                url: item.id,
                score: 1.0,
            }
        }));
        results
    }
}

#[async_trait]
impl SearchClient for SearxClient {
    async fn search(&self, query: &str) -> Vec<SearchResult> {
        if query.trim().is_empty() {
            return Vec::new();
        }
        let request = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[
                ("q", query),
                ("format", "json"),
                ("language", self.language.as_str()),
            ]);
        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!(%error, "search request failed");
                return Vec::new();
            }
        };
        let response = match response.error_for_status() {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!(%error, "search backend returned an error status");
                return Vec::new();
            }
        };
        match response.json::<SearxResponse>().await {
            Ok(parsed) => self.parse_response(parsed),
            Err(error) => {
                tracing::debug!(%error, "search response was not valid JSON");
                Vec::new()
            }
        }
    }
}

/// Extract a short enrichment text from search results: the first
/// result's title plus leading sentences of the contents, capped.
pub fn extract_enrichment_text(results: &[SearchResult], max_length: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut total = 0;

    for (i, result) in results.iter().enumerate() {
        if total >= max_length {
            break;
        }
        if i == 0 && !result.title.is_empty() {
            total += result.title.len();
            parts.push(result.title.clone());
        }
        if let Some(first_sentence) = result.content.split('.').next() {
            let first_sentence = first_sentence.trim();
            if first_sentence.len() > 20 {
                total += first_sentence.len();
                parts.push(first_sentence.to_string());
            }
        }
    }

    let mut text = parts.join(" ");
    if text.len() > max_length {
        let mut cut = max_length;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

/// Local merchant/purpose-token table consulted before the search backend
/// is bothered at all.
pub struct KeywordEnricher {
    table: HashMap<String, String>,
}

impl KeywordEnricher {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self {
            table: table
                .into_iter()
                .map(|(key, value)| (key.to_lowercase(), value))
                .collect(),
        }
    }

    /// First token hit wins.
    #[must_use]
    pub fn enrich(&self, query: &str) -> Option<String> {
        tokenize(query)
            .into_iter()
            .find_map(|token| self.table.get(&token).cloned())
    }
}

impl Default for KeywordEnricher {
    fn default() -> Self {
        Self::new(HashMap::from([
            ("rewe".into(), "Supermarkt Lebensmittel Einkauf".into()),
            ("edeka".into(), "Supermarkt Lebensmittel Einkauf".into()),
            ("lidl".into(), "Supermarkt Lebensmittel Discounter".into()),
            ("aral".into(), "Tankstelle Kraftstoff Benzin Diesel".into()),
            ("shell".into(), "Tankstelle Kraftstoff Benzin Diesel".into()),
            ("spotify".into(), "Musik Streaming Abonnement".into()),
            ("netflix".into(), "Video Streaming Abonnement".into()),
            ("telekom".into(), "Telekommunikation Mobilfunk Internet".into()),
            ("lieferando".into(), "Essenslieferung Restaurant Bestellung".into()),
        ]))
    }
}

/// Enriches unresolved transactions with descriptive text: keyword table
/// first, then the search backend, with a timeout per query and a
/// cooperative cooldown between queries.
pub struct EnrichmentService {
    keyword: Option<KeywordEnricher>,
    search: Option<Arc<dyn SearchClient>>,
    max_length: usize,
    timeout: Duration,
    cooldown: Duration,
}

impl EnrichmentService {
    pub fn new(
        keyword: Option<KeywordEnricher>,
        search: Option<Arc<dyn SearchClient>>,
        config: &ClassifierConfig,
    ) -> Self {
        Self {
            keyword,
            search,
            max_length: config.enrichment_max_length,
            timeout: config.search_timeout,
            cooldown: config.search_cooldown,
        }
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.keyword.is_some() || self.search.is_some()
    }

    async fn enrich_one(&self, ctx: &mut TransactionContext) -> bool {
        let counterparty = ctx.cleaned_counterparty.clone().unwrap_or_default();
        let purpose = ctx.cleaned_purpose.clone().unwrap_or_default();
        if counterparty.is_empty() && purpose.is_empty() {
            return false;
        }

        if let Some(keyword) = &self.keyword {
            let query = [counterparty.as_str(), purpose.as_str()]
                .iter()
                .filter(|part| !part.is_empty())
                .copied()
                .collect::<Vec<&str>>()
                .join(" ");
            if let Some(text) = keyword.enrich(&query) {
                tracing::debug!(source = "keyword", query = %query, "enriched transaction");
                ctx.search_enrichment = Some(text);
                return true;
            }
        }

        // The search query is the counterparty alone: purpose text often
        // carries personal names that only add noise to the lookup.
        if let Some(search) = &self.search
            && !counterparty.is_empty()
        {
            let results =
                match tokio::time::timeout(self.timeout, search.search(&counterparty)).await {
                    Ok(results) => results,
                    Err(_) => {
                        tracing::debug!(query = %counterparty, "search enrichment timed out");
                        Vec::new()
                    }
                };
            tokio::time::sleep(self.cooldown).await;

            if !results.is_empty() {
                let text = extract_enrichment_text(&results, self.max_length);
                if !text.is_empty() {
                    tracing::debug!(source = "search", query = %counterparty, "enriched transaction");
                    ctx.search_enrichment = Some(text);
                    return true;
                }
            }
        }

        false
    }

    /// Enrich every unresolved context; returns how many got text.
    pub async fn enrich_batch(&self, contexts: &mut [TransactionContext]) -> usize {
        if !self.is_configured() {
            return 0;
        }
        let mut enriched = 0;
        for ctx in contexts.iter_mut().filter(|ctx| !ctx.resolved) {
            if self.enrich_one(ctx).await {
                enriched += 1;
            }
        }
        enriched
    }
}
