use std::collections::HashMap;
use std::collections::HashSet;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::ClassifyResult;
use crate::preprocess::tokenize;

/// Document-frequency based noise filter for purpose text.
///
/// Learns which tokens are boilerplate for a user's bank by counting the
/// documents each token appears in; tokens above the frequency threshold
/// ("Kartenzahlung", "VISA", ...) are dropped before embedding.
#[derive(Debug, Clone, Default)]
pub struct NoiseModel {
    document_count: u64,
    token_document_frequency: HashMap<String, u64>,
    noise_cache: Option<HashSet<String>>,
}

impl NoiseModel {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn document_count(&self) -> u64 {
        self.document_count
    }

    #[must_use]
    pub fn token_document_frequency(&self) -> &HashMap<String, u64> {
        &self.token_document_frequency
    }

    /// Observe a batch of documents; each token counts once per document.
    /// Invalidates the cached noise set.
    pub fn observe_batch(&mut self, texts: &[String]) {
        for text in texts {
            let unique: HashSet<String> = tokenize(text).into_iter().collect();
            for token in unique {
                *self.token_document_frequency.entry(token).or_insert(0) += 1;
            }
        }
        self.document_count += texts.len() as u64;
        self.noise_cache = None;
    }

    /// Tokens whose document frequency exceeds `threshold` of all observed
    /// documents. Cached until the next observation.
    pub fn noise_tokens(&mut self, threshold: f32) -> &HashSet<String> {
        if self.noise_cache.is_none() {
            let cutoff = (self.document_count as f32 * threshold) as u64;
            let noise = if self.document_count == 0 {
                HashSet::new()
            } else {
                self.token_document_frequency
                    .iter()
                    .filter(|(_, frequency)| **frequency > cutoff)
                    .map(|(token, _)| token.clone())
                    .collect()
            };
            self.noise_cache = Some(noise);
        }
        self.noise_cache.as_ref().unwrap_or(&EMPTY_SET)
    }

    /// Drop noise tokens from a text, keeping informative content. Stable:
    /// cleaning a cleaned text changes nothing.
    pub fn clean(&mut self, text: &str, threshold: f32) -> String {
        let tokens = tokenize(text);
        let noise = self.noise_tokens(threshold);
        tokens
            .into_iter()
            .filter(|token| !noise.contains(token))
            .collect::<Vec<String>>()
            .join(" ")
    }

    #[must_use]
    pub fn snapshot(&self) -> NoiseModelSnapshot {
        NoiseModelSnapshot {
            document_count: self.document_count,
            token_document_frequency: self.token_document_frequency.clone(),
        }
    }

    #[must_use]
    pub fn from_snapshot(snapshot: NoiseModelSnapshot) -> Self {
        Self {
            document_count: snapshot.document_count,
            token_document_frequency: snapshot.token_document_frequency,
            noise_cache: None,
        }
    }
}

static EMPTY_SET: std::sync::LazyLock<HashSet<String>> = std::sync::LazyLock::new(HashSet::new);

/// Persisted form of the noise model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoiseModelSnapshot {
    pub document_count: u64,
    pub token_document_frequency: HashMap<String, u64>,
}

/// Per-user persistence for the noise model; updates are written before a
/// classification request returns.
#[async_trait]
pub trait NoiseModelRepository: Send + Sync {
    async fn load(&self) -> ClassifyResult<NoiseModelSnapshot>;

    async fn save(&self, snapshot: NoiseModelSnapshot) -> ClassifyResult<()>;
}

#[derive(Default)]
pub struct InMemoryNoiseModelRepository {
    state: Mutex<NoiseModelSnapshot>,
}

impl InMemoryNoiseModelRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NoiseModelRepository for InMemoryNoiseModelRepository {
    async fn load(&self) -> ClassifyResult<NoiseModelSnapshot> {
        let state = self.state.lock().await;
        Ok(state.clone())
    }

    async fn save(&self, snapshot: NoiseModelSnapshot) -> ClassifyResult<()> {
        let mut state = self.state.lock().await;
        *state = snapshot;
        Ok(())
    }
}
