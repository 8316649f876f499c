use std::sync::Arc;

use crate::ClassifierConfig;
use crate::ClassifyResult;
use crate::TextEncoder;
use crate::context::ClassificationMatch;
use crate::context::ResolvedBy;
use crate::context::TransactionContext;
use crate::store::EmbeddingMatrix;

/// Cold-start tier: matches transactions against per-account anchor
/// embeddings computed from each account's name and description.
pub struct AnchorClassifier {
    encoder: Arc<dyn TextEncoder>,
    accept_threshold: f32,
}

impl AnchorClassifier {
    pub fn new(encoder: Arc<dyn TextEncoder>, config: &ClassifierConfig) -> Self {
        Self {
            encoder,
            accept_threshold: config.anchor_accept_threshold,
        }
    }

    pub async fn classify_batch(
        &self,
        contexts: &mut [TransactionContext],
        anchors: &EmbeddingMatrix,
    ) -> ClassifyResult<()> {
        if anchors.is_empty() {
            tracing::debug!("anchor tier skipped: no anchors available");
            return Ok(());
        }

        let unresolved: Vec<usize> = contexts
            .iter()
            .enumerate()
            .filter(|(_, ctx)| !ctx.resolved)
            .map(|(i, _)| i)
            .collect();
        if unresolved.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = unresolved
            .iter()
            .map(|&i| contexts[i].anchor_query_text())
            .collect();
        let embeddings = self.encoder.encode(&texts).await?;
        let similarities = embeddings.dot(&anchors.embeddings.t());

        let mut resolved = 0;
        for (row, &ctx_index) in unresolved.iter().enumerate() {
            let mut best = f32::NEG_INFINITY;
            let mut best_index = 0;
            for (column, &similarity) in similarities.row(row).iter().enumerate() {
                if similarity > best {
                    best = similarity;
                    best_index = column;
                }
            }
            if !best.is_finite() || best < self.accept_threshold {
                continue;
            }

            let ctx = &mut contexts[ctx_index];
            ctx.anchor_match = Some(ClassificationMatch {
                account_id: anchors.account_ids[best_index],
                account_number: anchors.account_numbers[best_index].clone(),
                confidence: best.clamp(0.0, 1.0),
            });
            ctx.resolved = true;
            ctx.resolved_by = Some(ResolvedBy::Anchor);
            resolved += 1;
        }

        tracing::debug!(
            resolved,
            total = unresolved.len(),
            threshold = self.accept_threshold,
            "anchor tier finished"
        );
        Ok(())
    }
}
