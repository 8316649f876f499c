use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::Account;
use crate::AccountId;
use crate::LedgerError;
use crate::LedgerResult;
use crate::MAX_HIERARCHY_DEPTH;
use crate::Transaction;
use crate::TransactionId;
use crate::TransactionSource;
use crate::UserContext;
use crate::normalize_iban;
use crate::repository::AccountRepository;
use crate::repository::TransactionRepository;
use crate::transfer_fingerprint;

/// In-memory `AccountRepository` scoped to one user.
pub struct InMemoryAccountRepository {
    user: UserContext,
    state: Mutex<AccountState>,
}

#[derive(Default)]
struct AccountState {
    accounts: HashMap<AccountId, Account>,
}

impl InMemoryAccountRepository {
    pub fn new(user: UserContext) -> Self {
        Self {
            user,
            state: Mutex::new(AccountState::default()),
        }
    }

    fn ensure_owned(&self, account: &Account) -> LedgerResult<()> {
        if account.user_id != self.user.user_id {
            return Err(LedgerError::Rejected(format!(
                "account {} belongs to another user",
                account.id
            )));
        }
        Ok(())
    }

    fn ensure_unique(state: &AccountState, candidate: &Account) -> LedgerResult<()> {
        for existing in state.accounts.values() {
            if existing.id == candidate.id || !existing.is_active || !candidate.is_active {
                continue;
            }
            if existing.name == candidate.name {
                return Err(LedgerError::Conflict(format!(
                    "account name {} already in use",
                    candidate.name
                )));
            }
            if existing.account_number == candidate.account_number {
                return Err(LedgerError::Conflict(format!(
                    "account number {} already in use",
                    candidate.account_number
                )));
            }
        }
        Ok(())
    }

    /// Number of ancestors above `id`, following parent links.
    fn ancestor_count(state: &AccountState, id: AccountId) -> usize {
        let mut count = 0;
        let mut cursor = state.accounts.get(&id).and_then(|account| account.parent_id);
        while let Some(parent_id) = cursor {
            count += 1;
            cursor = state
                .accounts
                .get(&parent_id)
                .and_then(|account| account.parent_id);
            if count > MAX_HIERARCHY_DEPTH {
                break;
            }
        }
        count
    }

    /// Height of the subtree rooted at `id` (a leaf has height 1).
    fn subtree_height(state: &AccountState, id: AccountId) -> usize {
        let child_heights = state
            .accounts
            .values()
            .filter(|account| account.parent_id == Some(id))
            .map(|child| Self::subtree_height(state, child.id))
            .max();
        1 + child_heights.unwrap_or(0)
    }

    fn is_ancestor(state: &AccountState, candidate: AccountId, of: AccountId) -> bool {
        let mut cursor = state.accounts.get(&of).and_then(|account| account.parent_id);
        let mut hops = 0;
        while let Some(parent_id) = cursor {
            if parent_id == candidate {
                return true;
            }
            cursor = state
                .accounts
                .get(&parent_id)
                .and_then(|account| account.parent_id);
            hops += 1;
            if hops > MAX_HIERARCHY_DEPTH {
                break;
            }
        }
        false
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    async fn save(&self, account: Account) -> LedgerResult<Account> {
        self.ensure_owned(&account)?;
        let mut state = self.state.lock().await;

        if let Some(existing) = state.accounts.get(&account.id)
            && existing.account_type != account.account_type
        {
            return Err(LedgerError::Rejected(format!(
                "account type of {} is immutable",
                account.id
            )));
        }
        Self::ensure_unique(&state, &account)?;

        if let Some(parent_id) = account.parent_id {
            let parent = state
                .accounts
                .get(&parent_id)
                .ok_or_else(|| LedgerError::NotFound(format!("parent account {parent_id}")))?;
            if parent.user_id != account.user_id {
                return Err(LedgerError::Rejected(
                    "parent account belongs to another user".into(),
                ));
            }
        }

        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn find_by_id(&self, id: AccountId) -> LedgerResult<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state.accounts.get(&id).cloned())
    }

    async fn find_by_account_number(&self, account_number: &str) -> LedgerResult<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .find(|account| account.is_active && account.account_number == account_number)
            .cloned())
    }

    async fn find_by_iban(&self, iban: &str) -> LedgerResult<Option<Account>> {
        let normalized = normalize_iban(Some(iban));
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .find(|account| account.is_active && account.iban == normalized)
            .cloned())
    }

    async fn list_active(&self) -> LedgerResult<Vec<Account>> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state
            .accounts
            .values()
            .filter(|account| account.is_active)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.account_number.cmp(&b.account_number));
        Ok(accounts)
    }

    async fn set_parent(&self, id: AccountId, parent: AccountId) -> LedgerResult<Account> {
        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(&parent) {
            return Err(LedgerError::NotFound(format!("parent account {parent}")));
        }
        if !state.accounts.contains_key(&id) {
            return Err(LedgerError::NotFound(format!("account {id}")));
        }
        if id == parent || Self::is_ancestor(&state, id, parent) {
            return Err(LedgerError::HierarchyCycle);
        }

        let parent_depth = Self::ancestor_count(&state, parent) + 1;
        let height = Self::subtree_height(&state, id);
        if parent_depth + height > MAX_HIERARCHY_DEPTH {
            return Err(LedgerError::HierarchyTooDeep);
        }

        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {id}")))?;
        account.parent_id = Some(parent);
        Ok(account.clone())
    }

    async fn remove_parent(&self, id: AccountId) -> LedgerResult<Account> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {id}")))?;
        account.parent_id = None;
        Ok(account.clone())
    }

    async fn deactivate(&self, id: AccountId) -> LedgerResult<Account> {
        let mut state = self.state.lock().await;
        let has_active_children = state
            .accounts
            .values()
            .any(|account| account.parent_id == Some(id) && account.is_active);
        if has_active_children {
            return Err(LedgerError::Rejected(
                "cannot deactivate an account with active children".into(),
            ));
        }
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("account {id}")))?;
        account.is_active = false;
        Ok(account.clone())
    }
}

/// In-memory `TransactionRepository` scoped to one user.
pub struct InMemoryTransactionRepository {
    user: UserContext,
    state: Mutex<TransactionState>,
}

#[derive(Default)]
struct TransactionState {
    transactions: HashMap<TransactionId, Transaction>,
    insertion_order: Vec<TransactionId>,
}

impl InMemoryTransactionRepository {
    pub fn new(user: UserContext) -> Self {
        Self {
            user,
            state: Mutex::new(TransactionState::default()),
        }
    }

    /// Defence in depth against a corrupted aggregate: every persisted
    /// entry must carry exactly one strictly positive side.
    fn check_entry_shape(transaction: &Transaction) -> LedgerResult<()> {
        for entry in transaction.entries() {
            let debit_positive = entry.debit().is_positive();
            let credit_positive = entry.credit().is_positive();
            if debit_positive == credit_positive {
                return Err(LedgerError::Internal(format!(
                    "entry {} must have exactly one positive side",
                    entry.id()
                )));
            }
        }
        Ok(())
    }

    fn fingerprint_of(transaction: &Transaction) -> Option<String> {
        if transaction.source() != TransactionSource::BankImport {
            return None;
        }
        let source_iban = transaction.source_iban()?;
        let counterparty_iban = transaction.counterparty_iban()?;
        Some(transfer_fingerprint(
            source_iban,
            counterparty_iban,
            transaction.date(),
            transaction.total_amount().amount,
        ))
    }
}

#[async_trait]
impl TransactionRepository for InMemoryTransactionRepository {
    async fn save(&self, transaction: Transaction) -> LedgerResult<Transaction> {
        if transaction.user_id() != self.user.user_id {
            return Err(LedgerError::Rejected(format!(
                "transaction {} belongs to another user",
                transaction.id()
            )));
        }
        Self::check_entry_shape(&transaction)?;

        let mut state = self.state.lock().await;
        let id = transaction.id();
        if !state.transactions.contains_key(&id) {
            state.insertion_order.push(id);
        }
        state.transactions.insert(id, transaction.clone());
        Ok(transaction)
    }

    async fn find_by_id(&self, id: TransactionId) -> LedgerResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state.transactions.get(&id).cloned())
    }

    async fn list(&self) -> LedgerResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .insertion_order
            .iter()
            .filter_map(|id| state.transactions.get(id).cloned())
            .collect())
    }

    async fn find_by_opening_balance_iban(&self, iban: &str) -> LedgerResult<Vec<Transaction>> {
        let normalized = normalize_iban(Some(iban));
        let state = self.state.lock().await;
        Ok(state
            .insertion_order
            .iter()
            .filter_map(|id| state.transactions.get(id))
            .filter(|tx| {
                tx.metadata().opening_balance
                    && tx.metadata().opening_balance_iban == normalized
            })
            .cloned()
            .collect())
    }

    async fn find_posted_by_transfer_fingerprint(
        &self,
        fingerprint: &str,
    ) -> LedgerResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .insertion_order
            .iter()
            .filter_map(|id| state.transactions.get(id))
            .filter(|tx| tx.is_posted())
            .filter(|tx| Self::fingerprint_of(tx).as_deref() == Some(fingerprint))
            .cloned()
            .collect())
    }

    async fn find_bank_imports_by_counterparty_iban(
        &self,
        iban: &str,
    ) -> LedgerResult<Vec<Transaction>> {
        let normalized = normalize_iban(Some(iban));
        let state = self.state.lock().await;
        Ok(state
            .insertion_order
            .iter()
            .filter_map(|id| state.transactions.get(id))
            .filter(|tx| {
                tx.source() == TransactionSource::BankImport
                    && tx.counterparty_iban().map(str::to_string) == normalized
            })
            .cloned()
            .collect())
    }

    async fn find_opening_balance_adjustment(
        &self,
        transfer_hash: &str,
    ) -> LedgerResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .insertion_order
            .iter()
            .filter_map(|id| state.transactions.get(id))
            .find(|tx| {
                tx.metadata().opening_balance_adjustment
                    && tx.metadata().transfer_identity_hash.as_deref() == Some(transfer_hash)
            })
            .cloned())
    }
}
