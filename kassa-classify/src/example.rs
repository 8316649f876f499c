use std::sync::Arc;

use crate::ClassifierConfig;
use crate::ClassifyResult;
use crate::TextEncoder;
use crate::context::ClassificationMatch;
use crate::context::ResolvedBy;
use crate::context::TransactionContext;
use crate::store::EmbeddingMatrix;

/// Warm-start tier: matches transactions against the user's own history
/// of posted counter-account attributions.
pub struct ExampleClassifier {
    encoder: Arc<dyn TextEncoder>,
    config: ClassifierConfig,
}

impl ExampleClassifier {
    pub fn new(encoder: Arc<dyn TextEncoder>, config: ClassifierConfig) -> Self {
        Self { encoder, config }
    }

    /// Classify the unresolved contexts in place. Accepts the best match
    /// when its similarity clears the high-confidence bar, or clears the
    /// accept bar with a sufficient margin over the runner-up.
    pub async fn classify_batch(
        &self,
        contexts: &mut [TransactionContext],
        examples: &EmbeddingMatrix,
    ) -> ClassifyResult<()> {
        if examples.is_empty() {
            tracing::debug!("example tier skipped: no stored examples");
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
            .map(|&i| contexts[i].example_query_text())
            .collect();
        let embeddings = self.encoder.encode(&texts).await?;
        let similarities = embeddings.dot(&examples.embeddings.t());

        let mut resolved = 0;
        for (row, &ctx_index) in unresolved.iter().enumerate() {
            let mut top1 = f32::NEG_INFINITY;
            let mut top1_index = 0;
            let mut top2 = f32::NEG_INFINITY;
            for (column, &similarity) in similarities.row(row).iter().enumerate() {
                if similarity > top1 {
                    top2 = top1;
                    top1 = similarity;
                    top1_index = column;
                } else if similarity > top2 {
                    top2 = similarity;
                }
            }
            if !top1.is_finite() {
                continue;
            }
            let margin = if top2.is_finite() { top1 - top2 } else { top1 };

            let high_confidence = top1 >= self.config.example_high_confidence;
            let clear_winner = top1 >= self.config.example_accept_threshold
                && margin >= self.config.example_margin_threshold;
            if !(high_confidence || clear_winner) {
                continue;
            }

            let ctx = &mut contexts[ctx_index];
            ctx.example_match = Some(ClassificationMatch {
                account_id: examples.account_ids[top1_index],
                account_number: examples.account_numbers[top1_index].clone(),
                // Rounding can push the dot product of two identical unit
                // vectors a hair past 1.0.
                confidence: top1.clamp(0.0, 1.0),
            });
            ctx.resolved = true;
            ctx.resolved_by = Some(ResolvedBy::Example);
            resolved += 1;
        }

        tracing::debug!(
            resolved,
            total = unresolved.len(),
            accept_threshold = self.config.example_accept_threshold,
            "example tier finished"
        );
        Ok(())
    }
}
