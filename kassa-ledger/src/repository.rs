use async_trait::async_trait;

use crate::Account;
use crate::AccountId;
use crate::LedgerResult;
use crate::Transaction;
use crate::TransactionId;

/// User-scoped chart-of-accounts storage.
///
/// Implementations are constructed for a single user and must not expose
/// another user's rows. Uniqueness of (name) and (account_number) among the
/// user's active accounts is a storage responsibility.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn save(&self, account: Account) -> LedgerResult<Account>;

    async fn find_by_id(&self, id: AccountId) -> LedgerResult<Option<Account>>;

    async fn find_by_account_number(&self, account_number: &str) -> LedgerResult<Option<Account>>;

    async fn find_by_iban(&self, iban: &str) -> LedgerResult<Option<Account>>;

    async fn list_active(&self) -> LedgerResult<Vec<Account>>;

    /// Attach `id` under `parent`. Enforces same-user parentage, the depth
    /// limit and cycle freedom.
    async fn set_parent(&self, id: AccountId, parent: AccountId) -> LedgerResult<Account>;

    async fn remove_parent(&self, id: AccountId) -> LedgerResult<Account>;

    /// Deactivate a leaf account. Accounts with active children are refused.
    async fn deactivate(&self, id: AccountId) -> LedgerResult<Account>;
}

/// User-scoped transaction storage.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn save(&self, transaction: Transaction) -> LedgerResult<Transaction>;

    async fn find_by_id(&self, id: TransactionId) -> LedgerResult<Option<Transaction>>;

    async fn list(&self) -> LedgerResult<Vec<Transaction>>;

    /// Transactions whose metadata marks them as the opening balance for
    /// `iban`. At most one such transaction may exist per (user, IBAN).
    async fn find_by_opening_balance_iban(&self, iban: &str) -> LedgerResult<Vec<Transaction>>;

    /// Posted bank imports whose (source IBAN, counterparty IBAN, booking
    /// date, absolute amount) derive the given transfer fingerprint. Both
    /// legs of a transfer compute the same value, so this lookup works
    /// before either side has been converted.
    async fn find_posted_by_transfer_fingerprint(
        &self,
        fingerprint: &str,
    ) -> LedgerResult<Vec<Transaction>>;

    /// Bank imports whose counterparty IBAN equals `iban`.
    async fn find_bank_imports_by_counterparty_iban(
        &self,
        iban: &str,
    ) -> LedgerResult<Vec<Transaction>>;

    /// Opening-balance adjustments already posted for a transfer hash;
    /// used to keep the adjustment idempotent.
    async fn find_opening_balance_adjustment(
        &self,
        transfer_hash: &str,
    ) -> LedgerResult<Option<Transaction>>;
}
