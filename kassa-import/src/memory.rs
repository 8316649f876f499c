use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use kassa_ledger::UserContext;

use crate::ImportError;
use crate::ImportResult;
use crate::ImportStatus;
use crate::TransactionImport;
use crate::TransactionImportRepository;
use crate::rules::CounterAccountRule;
use crate::rules::CounterAccountRuleRepository;

/// In-memory import-audit storage scoped to one user. Exactly one record
/// per attempted import; the newest record per bank transaction wins.
pub struct InMemoryTransactionImportRepository {
    user: UserContext,
    state: Mutex<ImportState>,
}

#[derive(Default)]
struct ImportState {
    records: HashMap<Uuid, TransactionImport>,
    by_bank_transaction: HashMap<Uuid, Uuid>,
}

impl InMemoryTransactionImportRepository {
    pub fn new(user: UserContext) -> Self {
        Self {
            user,
            state: Mutex::new(ImportState::default()),
        }
    }
}

#[async_trait]
impl TransactionImportRepository for InMemoryTransactionImportRepository {
    async fn save(&self, record: TransactionImport) -> ImportResult<TransactionImport> {
        if record.user_id != self.user.user_id {
            return Err(ImportError::Validation(
                "import record belongs to another user".into(),
            ));
        }
        let mut state = self.state.lock().await;
        state
            .by_bank_transaction
            .insert(record.bank_transaction_id, record.id);
        state.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_by_bank_transaction_id(
        &self,
        bank_transaction_id: Uuid,
    ) -> ImportResult<Option<TransactionImport>> {
        let state = self.state.lock().await;
        Ok(state
            .by_bank_transaction
            .get(&bank_transaction_id)
            .and_then(|id| state.records.get(id))
            .cloned())
    }

    async fn count_by_status(&self) -> ImportResult<HashMap<ImportStatus, usize>> {
        let state = self.state.lock().await;
        let mut counts = HashMap::new();
        for record in state.records.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// In-memory counter-account rule storage scoped to one user.
pub struct InMemoryCounterAccountRuleRepository {
    user: UserContext,
    state: Mutex<HashMap<Uuid, CounterAccountRule>>,
}

impl InMemoryCounterAccountRuleRepository {
    pub fn new(user: UserContext) -> Self {
        Self {
            user,
            state: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CounterAccountRuleRepository for InMemoryCounterAccountRuleRepository {
    async fn save(&self, rule: CounterAccountRule) -> ImportResult<CounterAccountRule> {
        if rule.user_id != self.user.user_id {
            return Err(ImportError::Validation(
                "rule belongs to another user".into(),
            ));
        }
        let mut state = self.state.lock().await;
        state.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn list_active_by_priority(&self) -> ImportResult<Vec<CounterAccountRule>> {
        let state = self.state.lock().await;
        let mut rules: Vec<CounterAccountRule> = state
            .values()
            .filter(|rule| rule.is_active)
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rules)
    }

    async fn increment_match_count(&self, rule_id: Uuid) -> ImportResult<()> {
        let mut state = self.state.lock().await;
        let rule = state
            .get_mut(&rule_id)
            .ok_or_else(|| ImportError::NotFound(format!("rule {rule_id}")))?;
        rule.match_count += 1;
        Ok(())
    }
}
