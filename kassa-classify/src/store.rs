use async_trait::async_trait;
use ndarray::Array2;
use tokio::sync::Mutex;
use uuid::Uuid;

use kassa_ledger::AccountId;

use crate::ClassifyError;
use crate::ClassifyResult;

/// A contiguous f32 embedding matrix with parallel per-row columns. Rows
/// are L2-normalised by the encoder that produced them.
#[derive(Debug, Clone)]
pub struct EmbeddingMatrix {
    pub embeddings: Array2<f32>,
    pub account_ids: Vec<AccountId>,
    pub account_numbers: Vec<String>,
    pub labels: Vec<String>,
}

impl EmbeddingMatrix {
    #[must_use]
    pub fn empty(dimension: usize) -> Self {
        Self {
            embeddings: Array2::zeros((0, dimension)),
            account_ids: Vec::new(),
            account_numbers: Vec::new(),
            labels: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.account_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.account_ids.is_empty()
    }
}

/// Example embeddings: one row per previously posted counter-account
/// attribution. Reads return a single contiguous matrix; writes are
/// durable before the request returns.
#[async_trait]
pub trait ExampleEmbeddingRepository: Send + Sync {
    async fn embeddings_matrix(&self) -> ClassifyResult<EmbeddingMatrix>;

    /// Append an example for an account; per-account FIFO capped, repeat
    /// transaction ids are suppressed. Returns the account's example count.
    async fn append_example(
        &self,
        account_id: AccountId,
        account_number: &str,
        vector: Vec<f32>,
        source_text: &str,
        transaction_id: Option<Uuid>,
    ) -> ClassifyResult<usize>;
}

/// Anchor embeddings: exactly one row per eligible counter-account,
/// recomputed whenever the account text changes.
#[async_trait]
pub trait AnchorEmbeddingRepository: Send + Sync {
    async fn embeddings_matrix(&self) -> ClassifyResult<EmbeddingMatrix>;

    async fn set_anchor(
        &self,
        account_id: AccountId,
        account_number: &str,
        label: &str,
        vector: Vec<f32>,
    ) -> ClassifyResult<()>;
}

#[derive(Debug, Clone)]
struct ExampleRow {
    account_id: AccountId,
    account_number: String,
    source_text: String,
    vector: Vec<f32>,
    transaction_id: Option<Uuid>,
}

fn build_matrix(
    dimension: usize,
    rows: impl Iterator<Item = (AccountId, String, String, Vec<f32>)>,
) -> ClassifyResult<EmbeddingMatrix> {
    let mut account_ids = Vec::new();
    let mut account_numbers = Vec::new();
    let mut labels = Vec::new();
    let mut flat: Vec<f32> = Vec::new();
    for (account_id, account_number, label, vector) in rows {
        if vector.len() != dimension {
            return Err(ClassifyError::Storage(format!(
                "embedding for account {account_number} has dimension {}, expected {dimension}",
                vector.len()
            )));
        }
        account_ids.push(account_id);
        account_numbers.push(account_number);
        labels.push(label);
        flat.extend(vector);
    }
    let embeddings = Array2::from_shape_vec((account_ids.len(), dimension), flat)
        .map_err(|error| ClassifyError::Storage(error.to_string()))?;
    Ok(EmbeddingMatrix {
        embeddings,
        account_ids,
        account_numbers,
        labels,
    })
}

/// In-memory example store for one user.
pub struct InMemoryExampleStore {
    dimension: usize,
    max_per_account: usize,
    rows: Mutex<Vec<ExampleRow>>,
}

impl InMemoryExampleStore {
    pub fn new(dimension: usize, max_per_account: usize) -> Self {
        Self {
            dimension,
            max_per_account,
            rows: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ExampleEmbeddingRepository for InMemoryExampleStore {
    async fn embeddings_matrix(&self) -> ClassifyResult<EmbeddingMatrix> {
        let rows = self.rows.lock().await;
        build_matrix(
            self.dimension,
            rows.iter().map(|row| {
                (
                    row.account_id,
                    row.account_number.clone(),
                    row.source_text.clone(),
                    row.vector.clone(),
                )
            }),
        )
    }

    async fn append_example(
        &self,
        account_id: AccountId,
        account_number: &str,
        vector: Vec<f32>,
        source_text: &str,
        transaction_id: Option<Uuid>,
    ) -> ClassifyResult<usize> {
        if vector.len() != self.dimension {
            return Err(ClassifyError::Storage(format!(
                "expected dimension {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        let mut rows = self.rows.lock().await;

        if let Some(transaction_id) = transaction_id
            && rows.iter().any(|row| {
                row.account_id == account_id && row.transaction_id == Some(transaction_id)
            })
        {
            let count = rows.iter().filter(|row| row.account_id == account_id).count();
            return Ok(count);
        }

        rows.push(ExampleRow {
            account_id,
            account_number: account_number.to_string(),
            source_text: source_text.to_string(),
            vector,
            transaction_id,
        });

        // FIFO cap per account: drop the oldest examples beyond the limit.
        let count = rows.iter().filter(|row| row.account_id == account_id).count();
        if count > self.max_per_account {
            let overflow = count - self.max_per_account;
            let mut dropped = 0;
            rows.retain(|row| {
                if row.account_id == account_id && dropped < overflow {
                    dropped += 1;
                    false
                } else {
                    true
                }
            });
        }

        Ok(rows.iter().filter(|row| row.account_id == account_id).count())
    }
}

/// In-memory anchor store for one user.
pub struct InMemoryAnchorStore {
    dimension: usize,
    rows: Mutex<Vec<(AccountId, String, String, Vec<f32>)>>,
}

impl InMemoryAnchorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            rows: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AnchorEmbeddingRepository for InMemoryAnchorStore {
    async fn embeddings_matrix(&self) -> ClassifyResult<EmbeddingMatrix> {
        let rows = self.rows.lock().await;
        build_matrix(self.dimension, rows.iter().cloned())
    }

    async fn set_anchor(
        &self,
        account_id: AccountId,
        account_number: &str,
        label: &str,
        vector: Vec<f32>,
    ) -> ClassifyResult<()> {
        if vector.len() != self.dimension {
            return Err(ClassifyError::Storage(format!(
                "expected dimension {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        let mut rows = self.rows.lock().await;
        rows.retain(|(existing, _, _, _)| *existing != account_id);
        rows.push((
            account_id,
            account_number.to_string(),
            label.to_string(),
            vector,
        ));
        Ok(())
    }
}
