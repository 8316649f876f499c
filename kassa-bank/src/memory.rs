use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use kassa_ledger::UserContext;
use kassa_ledger::normalize_iban;

use crate::AccountMapping;
use crate::AccountMappingRepository;
use crate::BankAccount;
use crate::BankAccountRepository;
use crate::BankCredentials;
use crate::BankError;
use crate::BankResult;
use crate::BankTransaction;
use crate::BankTransactionStore;
use crate::StoredBankTransaction;
use crate::CredentialStore;

/// In-memory content-addressed bank-transaction store.
///
/// Records are keyed by (account IBAN, identity hash, sequence); the
/// uniqueness of that triple is what makes retried batches idempotent.
#[derive(Default)]
pub struct InMemoryBankTransactionStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    by_key: HashMap<(String, String, u32), Uuid>,
    records: HashMap<Uuid, StoredBankTransaction>,
    insertion_order: Vec<Uuid>,
}

impl InMemoryBankTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BankTransactionStore for InMemoryBankTransactionStore {
    async fn save_batch_with_deduplication(
        &self,
        transactions: Vec<BankTransaction>,
        account_iban: &str,
    ) -> BankResult<Vec<StoredBankTransaction>> {
        let account_iban = normalize_iban(Some(account_iban))
            .ok_or_else(|| BankError::Validation("account IBAN cannot be empty".into()))?;

        let mut state = self.state.lock().await;
        let mut batch_sequences: HashMap<String, u32> = HashMap::new();
        let mut results = Vec::with_capacity(transactions.len());

        for transaction in transactions {
            let hash = transaction.identity_hash();
            let sequence = batch_sequences.entry(hash.clone()).or_insert(0);

            let stored = loop {
                *sequence += 1;
                let key = (account_iban.clone(), hash.clone(), *sequence);
                match state.by_key.get(&key) {
                    None => {
                        // `is_new` annotates the save call, not the row;
                        // the stored copy stays false so later reads do
                        // not replay it.
                        let record = StoredBankTransaction {
                            id: Uuid::new_v4(),
                            account_iban: account_iban.clone(),
                            transaction: transaction.clone(),
                            identity_hash: hash.clone(),
                            hash_sequence: *sequence,
                            is_new: false,
                            is_imported: false,
                        };
                        state.by_key.insert(key, record.id);
                        state.insertion_order.push(record.id);
                        state.records.insert(record.id, record.clone());
                        let mut created = record;
                        created.is_new = true;
                        break created;
                    }
                    Some(existing_id) => {
                        let existing = state.records.get(existing_id).ok_or_else(|| {
                            BankError::Storage(format!("dangling record id {existing_id}"))
                        })?;
                        if existing.transaction == transaction {
                            let mut known = existing.clone();
                            known.is_new = false;
                            break known;
                        }
                        // Same identity hash but a diverging payload (for
                        // example a corrected value date): take the next
                        // free sequence slot instead of overwriting.
                    }
                }
            };
            results.push(stored);
        }

        Ok(results)
    }

    async fn query(
        &self,
        account_iban: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        limit: Option<usize>,
    ) -> BankResult<Vec<StoredBankTransaction>> {
        let normalized = normalize_iban(Some(account_iban)).unwrap_or_default();
        let state = self.state.lock().await;
        let mut matches: Vec<StoredBankTransaction> = state
            .insertion_order
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|record| record.account_iban == normalized)
            .filter(|record| {
                start.is_none_or(|from| record.transaction.booking_date >= from)
                    && end.is_none_or(|to| record.transaction.booking_date <= to)
            })
            .cloned()
            .collect();
        if let Some(limit) = limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn find_by_id(&self, id: Uuid) -> BankResult<Option<StoredBankTransaction>> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn latest_booking_date(&self, account_iban: &str) -> BankResult<Option<NaiveDate>> {
        let normalized = normalize_iban(Some(account_iban)).unwrap_or_default();
        let state = self.state.lock().await;
        Ok(state
            .records
            .values()
            .filter(|record| record.account_iban == normalized)
            .map(|record| record.transaction.booking_date)
            .max())
    }

    async fn mark_imported(&self, id: Uuid) -> BankResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| BankError::NotFound(format!("stored bank transaction {id}")))?;
        record.is_imported = true;
        Ok(())
    }

    async fn delete_for_account(&self, account_iban: &str) -> BankResult<usize> {
        let normalized = normalize_iban(Some(account_iban)).unwrap_or_default();
        let mut state = self.state.lock().await;
        let doomed: Vec<Uuid> = state
            .records
            .values()
            .filter(|record| record.account_iban == normalized)
            .map(|record| record.id)
            .collect();
        for id in &doomed {
            state.records.remove(id);
        }
        state.by_key.retain(|(iban, _, _), _| iban != &normalized);
        state.insertion_order.retain(|id| !doomed.contains(id));
        Ok(doomed.len())
    }
}

/// In-memory account-mapping repository scoped to one user.
pub struct InMemoryAccountMappingRepository {
    user: UserContext,
    state: Mutex<Vec<AccountMapping>>,
}

impl InMemoryAccountMappingRepository {
    pub fn new(user: UserContext) -> Self {
        Self {
            user,
            state: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AccountMappingRepository for InMemoryAccountMappingRepository {
    async fn find_by_iban(&self, iban: &str) -> BankResult<Option<AccountMapping>> {
        let normalized = normalize_iban(Some(iban)).unwrap_or_default();
        let state = self.state.lock().await;
        Ok(state
            .iter()
            .find(|mapping| mapping.iban == normalized && mapping.is_active)
            .cloned())
    }

    async fn save(&self, mapping: AccountMapping) -> BankResult<AccountMapping> {
        if mapping.user_id != self.user.user_id {
            return Err(BankError::Conflict(
                "mapping belongs to another user".into(),
            ));
        }
        let mut state = self.state.lock().await;
        let duplicate = state.iter().any(|existing| {
            existing.id != mapping.id && existing.iban == mapping.iban && existing.is_active
        });
        if mapping.is_active && duplicate {
            return Err(BankError::Conflict(format!(
                "an active mapping for {} already exists",
                mapping.iban
            )));
        }
        state.retain(|existing| existing.id != mapping.id);
        state.push(mapping.clone());
        Ok(mapping)
    }

    async fn list(&self) -> BankResult<Vec<AccountMapping>> {
        let state = self.state.lock().await;
        Ok(state.clone())
    }
}

/// In-memory bank-account directory refreshed on each sync.
#[derive(Default)]
pub struct InMemoryBankAccountRepository {
    state: Mutex<HashMap<String, BankAccount>>,
}

impl InMemoryBankAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BankAccountRepository for InMemoryBankAccountRepository {
    async fn save(&self, account: BankAccount) -> BankResult<BankAccount> {
        let mut state = self.state.lock().await;
        state.insert(account.iban.clone(), account.clone());
        Ok(account)
    }

    async fn list(&self) -> BankResult<Vec<BankAccount>> {
        let state = self.state.lock().await;
        let mut accounts: Vec<BankAccount> = state.values().cloned().collect();
        accounts.sort_by(|a, b| a.iban.cmp(&b.iban));
        Ok(accounts)
    }
}

/// In-memory credential store; secrets stay opaque strings.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    state: Mutex<CredentialState>,
}

#[derive(Default)]
struct CredentialState {
    credentials: HashMap<String, BankCredentials>,
    tan_settings: HashMap<String, (Option<String>, Option<String>)>,
    last_used: HashMap<String, DateTime<Utc>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, credentials: BankCredentials) {
        let mut state = self.state.lock().await;
        state
            .credentials
            .insert(credentials.bank_code.clone(), credentials);
    }

    pub async fn set_tan_settings(
        &self,
        bank_code: &str,
        method: Option<String>,
        medium: Option<String>,
    ) {
        let mut state = self.state.lock().await;
        state
            .tan_settings
            .insert(bank_code.to_string(), (method, medium));
    }

    pub async fn last_used(&self, bank_code: &str) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state.last_used.get(bank_code).copied()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find_by_bank_code(&self, bank_code: &str) -> BankResult<Option<BankCredentials>> {
        let state = self.state.lock().await;
        Ok(state.credentials.get(bank_code).cloned())
    }

    async fn get_tan_settings(
        &self,
        bank_code: &str,
    ) -> BankResult<(Option<String>, Option<String>)> {
        let state = self.state.lock().await;
        Ok(state
            .tan_settings
            .get(bank_code)
            .cloned()
            .unwrap_or((None, None)))
    }

    async fn update_last_used(&self, bank_code: &str) -> BankResult<()> {
        let mut state = self.state.lock().await;
        state
            .last_used
            .insert(bank_code.to_string(), Utc::now());
        Ok(())
    }
}
