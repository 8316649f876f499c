#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::fmt::Display;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use uuid::Uuid;

mod memory;
mod metadata;
mod opening_balance;
mod repository;
mod transaction;

pub use crate::memory::InMemoryAccountRepository;
pub use crate::memory::InMemoryTransactionRepository;
pub use crate::metadata::AiResolution;
pub use crate::metadata::TransactionMetadata;
pub use crate::opening_balance::OpeningBalanceService;
pub use crate::repository::AccountRepository;
pub use crate::repository::TransactionRepository;
pub use crate::transaction::JournalEntry;
pub use crate::transaction::NewTransaction;
pub use crate::transaction::Transaction;
pub use crate::transaction::TransactionSource;

pub type AccountId = Uuid;
pub type TransactionId = Uuid;
pub type JournalEntryId = Uuid;
pub type UserId = Uuid;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Maximum depth of the account hierarchy, counting the root as depth 1.
pub const MAX_HIERARCHY_DEPTH: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("transaction description cannot be empty")]
    EmptyDescription,
    #[error("{side} amount must be greater than zero")]
    ZeroAmount { side: EntrySide },
    #[error("transaction {0} is already posted")]
    AlreadyPosted(TransactionId),
    #[error("transaction needs at least two entries, found {0}")]
    EmptyTransaction(usize),
    #[error("mixed currencies in one transaction: {first} and {second}")]
    MixedCurrency { first: Currency, second: Currency },
    #[error("currency {got} is not supported, only {supported}")]
    UnsupportedCurrency { got: Currency, supported: Currency },
    #[error("transaction does not balance: debits {debits}, credits {credits}")]
    Unbalanced { debits: Money, credits: Money },
    #[error("business rule violated: {0}")]
    BusinessRule(String),
    #[error("invalid transaction metadata: {0}")]
    InvalidMetadata(String),
    #[error("entry {0} is protected by a bank import")]
    ProtectedEntry(JournalEntryId),
    #[error("account hierarchy depth cannot exceed {MAX_HIERARCHY_DEPTH}")]
    HierarchyTooDeep,
    #[error("account hierarchy cannot contain cycles")]
    HierarchyCycle,
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("resource conflict: {0}")]
    Conflict(String),
    #[error("operation rejected: {0}")]
    Rejected(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// ISO-4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_ascii_uppercase())
    }

    pub fn eur() -> Self {
        Self("EUR".into())
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.0
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    /// Sum two amounts of the same currency.
    pub fn add(&self, other: &Money) -> LedgerResult<Money> {
        if self.currency != other.currency {
            return Err(LedgerError::MixedCurrency {
                first: self.currency.clone(),
                second: other.currency.clone(),
            });
        }
        Ok(Money::new(self.amount + other.amount, self.currency.clone()))
    }
}

impl Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntrySide {
    Debit,
    Credit,
}

impl Display for EntrySide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntrySide::Debit => write!(f, "debit"),
            EntrySide::Credit => write!(f, "credit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Income,
    Expense,
}

impl AccountType {
    /// The side that increases an account of this type.
    #[must_use]
    pub fn normal_balance(self) -> EntrySide {
        match self {
            AccountType::Asset | AccountType::Expense => EntrySide::Debit,
            AccountType::Liability | AccountType::Equity | AccountType::Income => EntrySide::Credit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub name: String,
    /// Free-text description; feeds the anchor embedding for cold-start
    /// classification.
    pub description: Option<String>,
    pub account_type: AccountType,
    pub account_number: String,
    pub iban: Option<String>,
    pub parent_id: Option<AccountId>,
    pub currency: Currency,
    pub is_active: bool,
}

impl Account {
    pub fn new(
        user_id: UserId,
        name: impl Into<String>,
        account_type: AccountType,
        account_number: impl Into<String>,
        currency: Currency,
    ) -> LedgerResult<Self> {
        let name = name.into().trim().to_string();
        if name.is_empty() {
            return Err(LedgerError::BusinessRule("account name cannot be empty".into()));
        }
        let account_number = account_number.into().trim().to_string();
        if account_number.is_empty() {
            return Err(LedgerError::BusinessRule(
                "account number cannot be empty".into(),
            ));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            name,
            description: None,
            account_type,
            account_number,
            iban: None,
            parent_id: None,
            currency,
            is_active: true,
        })
    }

    #[must_use]
    pub fn with_iban(mut self, iban: impl Into<String>) -> Self {
        self.iban = normalize_iban(Some(&iban.into()));
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Text the anchor embedding is computed from.
    #[must_use]
    pub fn anchor_text(&self) -> String {
        match &self.description {
            Some(description) => format!("{} | {description}", self.name),
            None => self.name.clone(),
        }
    }

    /// Whether this account can take a new journal entry.
    ///
    /// Deactivated accounts refuse new postings; the entry currency must
    /// match the account currency. Both sides are acceptable for every
    /// account type: an asset account is debited on inflow and credited on
    /// outflow alike.
    #[must_use]
    pub fn can_accept_entry(&self, amount: &Money) -> bool {
        self.is_active && amount.currency == self.currency && !amount.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: UserId,
    pub email: String,
}

impl UserContext {
    pub fn new(user_id: UserId, email: impl Into<String>) -> Self {
        Self {
            user_id,
            email: email.into(),
        }
    }
}

/// Upper-case an IBAN and strip all whitespace. Empty input maps to `None`.
pub fn normalize_iban(iban: Option<&str>) -> Option<String> {
    let raw = iban?;
    let cleaned: String = raw
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .map(|ch| ch.to_ascii_uppercase())
        .collect();
    if cleaned.is_empty() { None } else { Some(cleaned) }
}

/// Symmetric fingerprint of a transfer between two accounts.
///
/// Both legs of a transfer independently derive the same value: the IBAN
/// pair is sorted before hashing and the amount enters as its absolute
/// value.
pub fn transfer_fingerprint(
    iban_a: &str,
    iban_b: &str,
    booking_date: chrono::NaiveDate,
    amount: Decimal,
) -> String {
    let mut pair = [
        normalize_iban(Some(iban_a)).unwrap_or_default(),
        normalize_iban(Some(iban_b)).unwrap_or_default(),
    ];
    pair.sort();
    let mut hasher = Sha256::new();
    for part in &pair {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hasher.update(booking_date.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(amount.abs().normalize().to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}
