use async_trait::async_trait;
use ndarray::Array2;
use sha2::Digest;
use sha2::Sha256;

use crate::ClassifyResult;
use crate::preprocess::tokenize;

/// Text-to-vector collaborator. Rows are L2-normalised so cosine
/// similarity reduces to a dot product; the dimension is a run-time
/// property of the loaded model.
#[async_trait]
pub trait TextEncoder: Send + Sync {
    async fn encode(&self, texts: &[String]) -> ClassifyResult<Array2<f32>>;

    fn dimension(&self) -> usize;

    /// Deterministic for a fixed model id.
    fn model_id(&self) -> &str;
}

/// Feature-hashing bag-of-tokens encoder.
///
/// Each token hashes to a bucket and a sign; the accumulated vector is
/// L2-normalised. Stable across runs and platforms, which makes it the
/// in-process stand-in for a sentence-transformer service: texts sharing
/// tokens land close together, disjoint texts are near-orthogonal.
pub struct HashedBagEncoder {
    dimension: usize,
    model_id: String,
}

impl HashedBagEncoder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_id: format!("hashed-bag-{dimension}"),
        }
    }

    fn bucket(&self, token: &str) -> (usize, f32) {
        let mut hasher = Sha256::new();
        hasher.update(self.model_id.as_bytes());
        hasher.update(b"|");
        hasher.update(token.as_bytes());
        let digest = hasher.finalize();
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let value = u64::from_be_bytes(raw);
        let index = (value % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    fn encode_one(&self, text: &str, row: &mut [f32]) {
        for token in tokenize(text) {
            let (index, sign) = self.bucket(&token);
            row[index] += sign;
        }
        let norm: f32 = row.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in row.iter_mut() {
                *value /= norm;
            }
        }
    }
}

impl Default for HashedBagEncoder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl TextEncoder for HashedBagEncoder {
    async fn encode(&self, texts: &[String]) -> ClassifyResult<Array2<f32>> {
        let mut matrix = Array2::<f32>::zeros((texts.len(), self.dimension));
        for (i, text) in texts.iter().enumerate() {
            let mut row = matrix.row_mut(i);
            if let Some(slice) = row.as_slice_mut() {
                self.encode_one(text, slice);
            }
        }
        Ok(matrix)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
