use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use kassa_bank::BankTransaction;
use kassa_classify::ClassificationPipeline;
use kassa_classify::TransactionInput;
use kassa_import::ClassifiedCounterAccount;
use kassa_import::ClassifierPort;
use kassa_import::ImportResult;

/// Adapts the classification pipeline to the import coordinator's port.
pub struct PipelineClassifier {
    pipeline: Arc<ClassificationPipeline>,
}

impl PipelineClassifier {
    pub fn new(pipeline: Arc<ClassificationPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl ClassifierPort for PipelineClassifier {
    async fn classify(
        &self,
        transaction: &BankTransaction,
    ) -> ImportResult<Option<ClassifiedCounterAccount>> {
        let input = TransactionInput {
            transaction_id: Uuid::new_v4(),
            counterparty_name: transaction.applicant_name.clone(),
            purpose: transaction.purpose.clone(),
            amount: transaction.amount,
            booking_date: transaction.booking_date,
        };
        let outcomes = self.pipeline.classify(std::slice::from_ref(&input)).await;
        Ok(outcomes.into_iter().next().and_then(|outcome| {
            outcome.resolved_by.map(|tier| ClassifiedCounterAccount {
                account_id: outcome.account_id,
                account_number: outcome.account_number,
                confidence: outcome.confidence,
                tier: tier.as_str().to_string(),
            })
        }))
    }
}
