use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::Account;
use crate::AccountType;
use crate::Currency;
use crate::EntrySide;
use crate::JournalEntryId;
use crate::LedgerError;
use crate::LedgerResult;
use crate::Money;
use crate::TransactionId;
use crate::TransactionMetadata;
use crate::UserId;
use crate::normalize_iban;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSource {
    Manual,
    BankImport,
    OpeningBalance,
}

impl TransactionSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionSource::Manual => "manual",
            TransactionSource::BankImport => "bank_import",
            TransactionSource::OpeningBalance => "opening_balance",
        }
    }
}

/// A single journal line. Exactly one of debit/credit is positive, the
/// other is zero; this is established at construction and relied upon by
/// the balance validation.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    id: JournalEntryId,
    account: Account,
    debit: Money,
    credit: Money,
}

impl JournalEntry {
    fn debit_entry(account: Account, amount: Money) -> Self {
        let zero = Money::zero(amount.currency.clone());
        Self {
            id: Uuid::new_v4(),
            account,
            debit: amount,
            credit: zero,
        }
    }

    fn credit_entry(account: Account, amount: Money) -> Self {
        let zero = Money::zero(amount.currency.clone());
        Self {
            id: Uuid::new_v4(),
            account,
            debit: zero,
            credit: amount,
        }
    }

    #[must_use]
    pub fn id(&self) -> JournalEntryId {
        self.id
    }

    #[must_use]
    pub fn account(&self) -> &Account {
        &self.account
    }

    #[must_use]
    pub fn debit(&self) -> &Money {
        &self.debit
    }

    #[must_use]
    pub fn credit(&self) -> &Money {
        &self.credit
    }

    #[must_use]
    pub fn is_debit(&self) -> bool {
        self.debit.is_positive()
    }

    #[must_use]
    pub fn side(&self) -> EntrySide {
        if self.is_debit() {
            EntrySide::Debit
        } else {
            EntrySide::Credit
        }
    }

    /// The positive side of the entry.
    #[must_use]
    pub fn amount(&self) -> &Money {
        if self.is_debit() { &self.debit } else { &self.credit }
    }
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: UserId,
    pub description: String,
    pub date: NaiveDate,
    pub counterparty: Option<String>,
    pub counterparty_iban: Option<String>,
    pub source: TransactionSource,
    pub source_iban: Option<String>,
    pub is_internal_transfer: bool,
    pub metadata: TransactionMetadata,
}

impl NewTransaction {
    pub fn manual(user_id: UserId, description: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            user_id,
            description: description.into(),
            date,
            counterparty: None,
            counterparty_iban: None,
            source: TransactionSource::Manual,
            source_iban: None,
            is_internal_transfer: false,
            metadata: TransactionMetadata::default(),
        }
    }
}

/// Double-entry transaction aggregate.
///
/// Entries are accumulated on a draft and the whole set is validated when
/// the transaction posts. Posted transactions are immutable; `unpost` is the
/// explicit, audit-visible escape hatch for amendments.
///
/// Bank-imported transactions protect their asset entries: the asset leg
/// mirrors a bank statement line and mutating it would break reconciliation
/// with the statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    id: TransactionId,
    user_id: UserId,
    description: String,
    date: NaiveDate,
    counterparty: Option<String>,
    counterparty_iban: Option<String>,
    source: TransactionSource,
    source_iban: Option<String>,
    is_internal_transfer: bool,
    metadata: TransactionMetadata,
    entries: Vec<JournalEntry>,
    posted: bool,
    created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(params: NewTransaction) -> LedgerResult<Self> {
        let description = params.description.trim().to_string();
        if description.is_empty() {
            return Err(LedgerError::EmptyDescription);
        }
        let mut metadata = params.metadata;
        metadata.source = Some(params.source.as_str().to_string());
        Ok(Self {
            id: Uuid::new_v4(),
            user_id: params.user_id,
            description,
            date: params.date,
            counterparty: params.counterparty,
            counterparty_iban: normalize_iban(params.counterparty_iban.as_deref()),
            source: params.source,
            source_iban: normalize_iban(params.source_iban.as_deref()),
            is_internal_transfer: params.is_internal_transfer,
            metadata,
            entries: Vec::new(),
            posted: false,
            created_at: Utc::now(),
        })
    }

    pub fn draft(user_id: UserId, description: impl Into<String>, date: NaiveDate) -> LedgerResult<Self> {
        Self::new(NewTransaction::manual(user_id, description, date))
    }

    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn date(&self) -> NaiveDate {
        self.date
    }

    #[must_use]
    pub fn counterparty(&self) -> Option<&str> {
        self.counterparty.as_deref()
    }

    #[must_use]
    pub fn counterparty_iban(&self) -> Option<&str> {
        self.counterparty_iban.as_deref()
    }

    #[must_use]
    pub fn source(&self) -> TransactionSource {
        self.source
    }

    #[must_use]
    pub fn source_iban(&self) -> Option<&str> {
        self.source_iban.as_deref()
    }

    /// Internal transfers rely on the stored flag exclusively; the entry
    /// shape is never consulted, since an all-asset heuristic misreads
    /// legitimate same-type transactions such as opening balances.
    #[must_use]
    pub fn is_internal_transfer(&self) -> bool {
        self.is_internal_transfer
    }

    #[must_use]
    pub fn is_posted(&self) -> bool {
        self.posted
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn metadata(&self) -> &TransactionMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    #[must_use]
    pub fn is_bank_import(&self) -> bool {
        self.source == TransactionSource::BankImport
    }

    fn ensure_draft(&self) -> LedgerResult<()> {
        if self.posted {
            Err(LedgerError::AlreadyPosted(self.id))
        } else {
            Ok(())
        }
    }

    pub fn add_debit(&mut self, account: Account, amount: Money) -> LedgerResult<()> {
        self.add_entry(account, amount, EntrySide::Debit)
    }

    pub fn add_credit(&mut self, account: Account, amount: Money) -> LedgerResult<()> {
        self.add_entry(account, amount, EntrySide::Credit)
    }

    pub fn add_entry(
        &mut self,
        account: Account,
        amount: Money,
        side: EntrySide,
    ) -> LedgerResult<()> {
        self.ensure_draft()?;
        if amount.amount <= Decimal::ZERO {
            return Err(LedgerError::ZeroAmount { side });
        }
        let entry = match side {
            EntrySide::Debit => JournalEntry::debit_entry(account, amount),
            EntrySide::Credit => JournalEntry::credit_entry(account, amount),
        };
        self.entries.push(entry);
        Ok(())
    }

    /// Whether an entry is protected from mutation. Only the asset legs of
    /// bank-imported transactions are protected.
    #[must_use]
    pub fn is_entry_protected(&self, entry: &JournalEntry) -> bool {
        self.is_bank_import() && entry.account.account_type == AccountType::Asset
    }

    #[must_use]
    pub fn protected_entries(&self) -> Vec<&JournalEntry> {
        self.entries
            .iter()
            .filter(|entry| self.is_entry_protected(entry))
            .collect()
    }

    pub fn remove_entry(&mut self, entry_id: JournalEntryId) -> LedgerResult<()> {
        self.ensure_draft()?;
        if let Some(entry) = self.entries.iter().find(|entry| entry.id == entry_id)
            && self.is_entry_protected(entry)
        {
            return Err(LedgerError::ProtectedEntry(entry_id));
        }
        self.entries.retain(|entry| entry.id != entry_id);
        Ok(())
    }

    /// Clear entries. For bank imports the protected asset legs survive.
    pub fn clear_entries(&mut self) -> LedgerResult<()> {
        self.ensure_draft()?;
        if self.is_bank_import() {
            let kept: Vec<JournalEntry> = self
                .entries
                .iter()
                .filter(|entry| self.is_entry_protected(entry))
                .cloned()
                .collect();
            self.entries = kept;
        } else {
            self.entries.clear();
        }
        Ok(())
    }

    /// Replace the unprotected (category) entries, preserving the bank-asset
    /// leg so reconciliation with the statement stays intact.
    pub fn replace_unprotected_entries(
        &mut self,
        new_entries: Vec<(Account, Money, EntrySide)>,
    ) -> LedgerResult<()> {
        self.clear_entries()?;
        for (account, amount, side) in new_entries {
            self.add_entry(account, amount, side)?;
        }
        Ok(())
    }

    pub fn update_description(&mut self, description: impl Into<String>) -> LedgerResult<()> {
        self.ensure_draft()?;
        let description = description.into().trim().to_string();
        if description.is_empty() {
            return Err(LedgerError::EmptyDescription);
        }
        self.description = description;
        Ok(())
    }

    pub fn update_counterparty(&mut self, counterparty: Option<String>) -> LedgerResult<()> {
        self.ensure_draft()?;
        self.counterparty = counterparty;
        Ok(())
    }

    pub fn update_counterparty_iban(&mut self, iban: Option<String>) -> LedgerResult<()> {
        self.ensure_draft()?;
        self.counterparty_iban = normalize_iban(iban.as_deref());
        Ok(())
    }

    pub fn mark_as_internal_transfer(&mut self, is_transfer: bool) -> LedgerResult<()> {
        self.ensure_draft()?;
        self.is_internal_transfer = is_transfer;
        Ok(())
    }

    pub fn set_metadata(&mut self, metadata: TransactionMetadata) -> LedgerResult<()> {
        self.ensure_draft()?;
        self.metadata = metadata;
        self.metadata.source = Some(self.source.as_str().to_string());
        Ok(())
    }

    pub fn update_metadata(
        &mut self,
        update: impl FnOnce(&mut TransactionMetadata),
    ) -> LedgerResult<()> {
        self.ensure_draft()?;
        update(&mut self.metadata);
        self.metadata.source = Some(self.source.as_str().to_string());
        Ok(())
    }

    /// Shape validation: at least two entries, one currency, only the
    /// supported currency, and debits equal to credits.
    pub fn validate_double_entry(&self, supported_currency: &Currency) -> LedgerResult<()> {
        if self.entries.len() < 2 {
            return Err(LedgerError::EmptyTransaction(self.entries.len()));
        }

        let mut currency: Option<Currency> = None;
        for entry in &self.entries {
            let entry_currency = &entry.amount().currency;
            match &currency {
                Some(first) if first != entry_currency => {
                    return Err(LedgerError::MixedCurrency {
                        first: first.clone(),
                        second: entry_currency.clone(),
                    });
                }
                Some(_) => {}
                None => currency = Some(entry_currency.clone()),
            }
        }

        let currency = currency.unwrap_or_else(|| supported_currency.clone());
        if &currency != supported_currency {
            return Err(LedgerError::UnsupportedCurrency {
                got: currency,
                supported: supported_currency.clone(),
            });
        }

        let mut debits = Money::zero(currency.clone());
        let mut credits = Money::zero(currency);
        for entry in &self.entries {
            if entry.is_debit() {
                debits = debits.add(&entry.debit)?;
            } else {
                credits = credits.add(&entry.credit)?;
            }
        }

        if debits.amount != credits.amount {
            return Err(LedgerError::Unbalanced { debits, credits });
        }
        Ok(())
    }

    #[must_use]
    pub fn is_balanced(&self, supported_currency: &Currency) -> bool {
        self.validate_double_entry(supported_currency).is_ok()
    }

    pub fn validate_business_rules(&self) -> LedgerResult<()> {
        for entry in &self.entries {
            if !entry.account.can_accept_entry(entry.amount()) {
                return Err(LedgerError::BusinessRule(format!(
                    "account {} cannot accept an entry of {}",
                    entry.account.name,
                    entry.amount()
                )));
            }
        }
        Ok(())
    }

    pub fn validate_metadata(&self) -> LedgerResult<()> {
        if self.metadata.source.as_deref() != Some(self.source.as_str()) {
            return Err(LedgerError::InvalidMetadata(format!(
                "metadata source {:?} is out of sync with transaction source {}",
                self.metadata.source,
                self.source.as_str()
            )));
        }
        if let Some(ai) = &self.metadata.ai_resolution
            && !(0.0..=1.0).contains(&ai.confidence)
        {
            return Err(LedgerError::InvalidMetadata(format!(
                "ai resolution confidence {} out of range",
                ai.confidence
            )));
        }
        if self.metadata.opening_balance_iban.is_some() && !self.metadata.opening_balance {
            return Err(LedgerError::InvalidMetadata(
                "opening_balance_iban requires the opening_balance flag".into(),
            ));
        }
        Ok(())
    }

    pub fn post(&mut self, supported_currency: &Currency) -> LedgerResult<()> {
        self.ensure_draft()?;
        self.validate_double_entry(supported_currency)?;
        self.validate_business_rules()?;
        self.validate_metadata()?;
        self.posted = true;
        Ok(())
    }

    /// Reopen a posted transaction for amendment. Audit-visible.
    pub fn unpost(&mut self) {
        if self.posted {
            tracing::info!(transaction_id = %self.id, "transaction unposted for amendment");
        }
        self.posted = false;
    }

    /// Sum of the debit legs, i.e. the amount moved by the transaction.
    #[must_use]
    pub fn total_amount(&self) -> Money {
        let currency = self
            .entries
            .first()
            .map(|entry| entry.amount().currency.clone())
            .unwrap_or_else(Currency::eur);
        let total = self
            .entries
            .iter()
            .filter(|entry| entry.is_debit())
            .fold(Decimal::ZERO, |sum, entry| sum + entry.debit.amount);
        Money::new(total, currency)
    }

    #[must_use]
    pub fn involves_account(&self, account_id: crate::AccountId) -> bool {
        self.entries.iter().any(|entry| entry.account.id == account_id)
    }

    #[must_use]
    pub fn entries_for_account(&self, account_id: crate::AccountId) -> Vec<&JournalEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.account.id == account_id)
            .collect()
    }

    /// Convert this transaction from an external income/expense booking to
    /// an internal asset-to-asset transfer.
    ///
    /// The income/expense leg is replaced by `new_asset_account`; for bank
    /// imports the original asset leg survives the rebuild untouched. The
    /// transaction is re-posted if it was posted before the conversion.
    ///
    /// Returns `false` when there is no income/expense entry to convert.
    /// On error the aggregate stays unposted and must be discarded, not
    /// persisted.
    pub fn convert_to_internal_transfer(
        &mut self,
        new_asset_account: &Account,
        transfer_hash: &str,
        supported_currency: &Currency,
    ) -> LedgerResult<bool> {
        let was_posted = self.posted;
        if was_posted {
            self.unpost();
        }

        let converted = self.rebuild_as_transfer(new_asset_account, transfer_hash);

        // Re-post only a successful rebuild (the no-op case included). A
        // failed rebuild may have mutated the entries already; posting it
        // would either mask the rebuild error with a validation error or
        // post a half-built aggregate.
        if was_posted && converted.is_ok() {
            self.post(supported_currency)?;
        }
        converted
    }

    fn rebuild_as_transfer(
        &mut self,
        new_asset_account: &Account,
        transfer_hash: &str,
    ) -> LedgerResult<bool> {
        if new_asset_account.account_type != AccountType::Asset {
            return Err(LedgerError::BusinessRule(format!(
                "transfer destination {} must be an asset account",
                new_asset_account.name
            )));
        }

        let category_entry = self
            .entries
            .iter()
            .find(|entry| {
                matches!(
                    entry.account.account_type,
                    AccountType::Income | AccountType::Expense
                )
            })
            .cloned();
        let asset_entry = self
            .entries
            .iter()
            .find(|entry| entry.account.account_type == AccountType::Asset)
            .cloned();

        let Some(category_entry) = category_entry else {
            return Ok(false);
        };

        self.clear_entries()?;
        let asset_preserved = self
            .entries
            .iter()
            .any(|entry| entry.account.account_type == AccountType::Asset);

        let amount = category_entry.amount().clone();
        if category_entry.is_debit() {
            // Debit expense becomes a debit of the destination asset.
            self.add_debit(new_asset_account.clone(), amount.clone())?;
            if let Some(asset) = &asset_entry
                && !asset_preserved
            {
                self.add_credit(asset.account.clone(), amount)?;
            }
        } else {
            // Credit income becomes a credit of the source asset.
            if let Some(asset) = &asset_entry
                && !asset_preserved
            {
                self.add_debit(asset.account.clone(), amount.clone())?;
            }
            self.add_credit(new_asset_account.clone(), amount)?;
        }

        self.is_internal_transfer = true;
        let source_account_name = asset_entry.as_ref().map(|entry| entry.account.name.clone());
        let destination_name = new_asset_account.name.clone();
        let hash = transfer_hash.to_string();
        self.update_metadata(move |metadata| {
            metadata.source_account = source_account_name;
            metadata.destination_account = Some(destination_name);
            metadata.transfer_identity_hash = Some(hash);
        })?;

        let direction = self.transfer_direction(asset_entry.as_ref());
        self.description = format!("Transfer {direction} {}", new_asset_account.name);
        self.counterparty = Some(new_asset_account.name.clone());
        Ok(true)
    }

    fn transfer_direction(&self, original_asset_entry: Option<&JournalEntry>) -> &'static str {
        let Some(original) = original_asset_entry else {
            return "from";
        };
        // The original asset now carrying a credit means money went out.
        let money_out = self.entries.iter().any(|entry| {
            entry.account.id == original.account.id && entry.credit.is_positive()
        });
        if money_out { "to" } else { "from" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AccountType;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn eur() -> Currency {
        Currency::eur()
    }

    fn money(amount: Decimal) -> Money {
        Money::new(amount, eur())
    }

    fn account(name: &str, account_type: AccountType, number: &str) -> Account {
        Account::new(Uuid::new_v4(), name, account_type, number, eur()).expect("account")
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).expect("date")
    }

    fn draft() -> Transaction {
        Transaction::draft(Uuid::new_v4(), "Lunch", date()).expect("draft")
    }

    fn bank_import(user_id: Uuid) -> Transaction {
        let mut params = NewTransaction::manual(user_id, "Card payment", date());
        params.source = TransactionSource::BankImport;
        params.source_iban = Some("DE89 3704 0044 0532 0130 00".into());
        Transaction::new(params).expect("bank import draft")
    }

    #[test]
    fn empty_description_is_rejected() {
        let result = Transaction::draft(Uuid::new_v4(), "   ", date());
        assert!(matches!(result, Err(LedgerError::EmptyDescription)));
    }

    #[test]
    fn source_iban_is_normalized() {
        let tx = bank_import(Uuid::new_v4());
        assert_eq!(tx.source_iban(), Some("DE89370400440532013000"));
    }

    #[test]
    fn zero_amount_entries_are_rejected() {
        let mut tx = draft();
        let cash = account("Cash", AccountType::Asset, "1000");
        let err = tx.add_debit(cash, money(dec!(0))).unwrap_err();
        assert!(matches!(err, LedgerError::ZeroAmount { side: EntrySide::Debit }));
    }

    #[test]
    fn balanced_transaction_posts() {
        let mut tx = draft();
        let cash = account("Cash", AccountType::Asset, "1000");
        let groceries = account("Groceries", AccountType::Expense, "4000");
        tx.add_debit(groceries, money(dec!(42.50))).expect("debit");
        tx.add_credit(cash, money(dec!(42.50))).expect("credit");
        tx.post(&eur()).expect("post");
        assert!(tx.is_posted());
        assert_eq!(tx.total_amount(), money(dec!(42.50)));
    }

    #[test]
    fn unbalanced_transaction_fails_to_post() {
        let mut tx = draft();
        tx.add_debit(account("Groceries", AccountType::Expense, "4000"), money(dec!(40)))
            .expect("debit");
        tx.add_credit(account("Cash", AccountType::Asset, "1000"), money(dec!(39)))
            .expect("credit");
        assert!(matches!(
            tx.post(&eur()),
            Err(LedgerError::Unbalanced { .. })
        ));
    }

    #[test]
    fn single_entry_transaction_fails_to_post() {
        let mut tx = draft();
        tx.add_debit(account("Groceries", AccountType::Expense, "4000"), money(dec!(40)))
            .expect("debit");
        assert!(matches!(
            tx.post(&eur()),
            Err(LedgerError::EmptyTransaction(1))
        ));
    }

    #[test]
    fn mixed_currency_fails_to_post() {
        let mut tx = draft();
        tx.add_debit(account("Groceries", AccountType::Expense, "4000"), money(dec!(40)))
            .expect("debit");
        let mut usd_account = account("Cash", AccountType::Asset, "1000");
        usd_account.currency = Currency::new("USD");
        tx.add_credit(usd_account, Money::new(dec!(40), Currency::new("USD")))
            .expect("credit");
        assert!(matches!(
            tx.post(&eur()),
            Err(LedgerError::MixedCurrency { .. })
        ));
    }

    #[test]
    fn non_default_currency_fails_to_post() {
        let usd = Currency::new("USD");
        let mut tx = draft();
        let mut cash = account("Cash", AccountType::Asset, "1000");
        cash.currency = usd.clone();
        let mut groceries = account("Groceries", AccountType::Expense, "4000");
        groceries.currency = usd.clone();
        tx.add_debit(groceries, Money::new(dec!(40), usd.clone()))
            .expect("debit");
        tx.add_credit(cash, Money::new(dec!(40), usd)).expect("credit");
        assert!(matches!(
            tx.post(&eur()),
            Err(LedgerError::UnsupportedCurrency { .. })
        ));
    }

    #[test]
    fn posted_transaction_is_immutable() {
        let mut tx = draft();
        tx.add_debit(account("Groceries", AccountType::Expense, "4000"), money(dec!(40)))
            .expect("debit");
        tx.add_credit(account("Cash", AccountType::Asset, "1000"), money(dec!(40)))
            .expect("credit");
        tx.post(&eur()).expect("post");
        assert!(matches!(
            tx.add_debit(account("Other", AccountType::Expense, "4100"), money(dec!(1))),
            Err(LedgerError::AlreadyPosted(_))
        ));
        assert!(matches!(
            tx.update_description("changed"),
            Err(LedgerError::AlreadyPosted(_))
        ));
    }

    #[test]
    fn unpost_reopens_for_amendment() {
        let mut tx = draft();
        tx.add_debit(account("Groceries", AccountType::Expense, "4000"), money(dec!(40)))
            .expect("debit");
        tx.add_credit(account("Cash", AccountType::Asset, "1000"), money(dec!(40)))
            .expect("credit");
        tx.post(&eur()).expect("post");
        tx.unpost();
        tx.update_description("Groceries run").expect("update");
        tx.post(&eur()).expect("re-post");
        assert_eq!(tx.description(), "Groceries run");
    }

    #[test]
    fn bank_import_protects_asset_entries() {
        let user_id = Uuid::new_v4();
        let mut tx = bank_import(user_id);
        let checking = account("Checking", AccountType::Asset, "1200");
        let expense = account("Groceries", AccountType::Expense, "4000");
        tx.add_debit(expense.clone(), money(dec!(25))).expect("debit");
        tx.add_credit(checking.clone(), money(dec!(25))).expect("credit");

        let protected_id = tx
            .entries()
            .iter()
            .find(|entry| entry.account().id == checking.id)
            .map(JournalEntry::id)
            .expect("asset entry");
        assert!(matches!(
            tx.remove_entry(protected_id),
            Err(LedgerError::ProtectedEntry(_))
        ));

        tx.clear_entries().expect("clear");
        assert_eq!(tx.entries().len(), 1);
        assert_eq!(tx.entries()[0].account().id, checking.id);
    }

    #[test]
    fn replace_unprotected_entries_keeps_bank_leg() {
        let mut tx = bank_import(Uuid::new_v4());
        let checking = account("Checking", AccountType::Asset, "1200");
        let expense = account("Groceries", AccountType::Expense, "4000");
        let restaurant = account("Dining", AccountType::Expense, "4100");
        tx.add_debit(expense, money(dec!(25))).expect("debit");
        tx.add_credit(checking.clone(), money(dec!(25))).expect("credit");

        tx.replace_unprotected_entries(vec![(restaurant.clone(), money(dec!(25)), EntrySide::Debit)])
            .expect("replace");

        assert_eq!(tx.entries().len(), 2);
        assert!(tx.involves_account(checking.id));
        assert!(tx.involves_account(restaurant.id));
    }

    #[test]
    fn manual_transaction_clear_removes_everything() {
        let mut tx = draft();
        tx.add_debit(account("Groceries", AccountType::Expense, "4000"), money(dec!(40)))
            .expect("debit");
        tx.add_credit(account("Cash", AccountType::Asset, "1000"), money(dec!(40)))
            .expect("credit");
        tx.clear_entries().expect("clear");
        assert!(tx.entries().is_empty());
    }

    #[test]
    fn convert_incoming_payment_to_transfer() {
        let user_id = Uuid::new_v4();
        let mut tx = bank_import(user_id);
        let checking = account("Checking", AccountType::Asset, "1200");
        let other_income = account("Other income", AccountType::Income, "8200");
        let savings = account("Savings", AccountType::Asset, "1300");

        // Incoming 100: debit checking, credit income.
        tx.add_debit(checking.clone(), money(dec!(100))).expect("debit");
        tx.add_credit(other_income, money(dec!(100))).expect("credit");
        tx.post(&eur()).expect("post");

        let converted = tx
            .convert_to_internal_transfer(&savings, "hash-1", &eur())
            .expect("convert");
        assert!(converted);
        assert!(tx.is_posted());
        assert!(tx.is_internal_transfer());
        assert_eq!(tx.entries().len(), 2);
        assert!(tx.involves_account(checking.id));
        assert!(tx.involves_account(savings.id));
        assert_eq!(
            tx.metadata().transfer_identity_hash.as_deref(),
            Some("hash-1")
        );
        assert_eq!(tx.metadata().destination_account.as_deref(), Some("Savings"));
        assert_eq!(tx.description(), "Transfer from Savings");
        assert_eq!(tx.counterparty(), Some("Savings"));
    }

    #[test]
    fn convert_outgoing_payment_to_transfer() {
        let mut tx = bank_import(Uuid::new_v4());
        let checking = account("Checking", AccountType::Asset, "1200");
        let expense = account("Other expenses", AccountType::Expense, "4900");
        let savings = account("Savings", AccountType::Asset, "1300");

        // Outgoing 100: debit expense, credit checking.
        tx.add_debit(expense, money(dec!(100))).expect("debit");
        tx.add_credit(checking.clone(), money(dec!(100))).expect("credit");
        tx.post(&eur()).expect("post");

        let converted = tx
            .convert_to_internal_transfer(&savings, "hash-2", &eur())
            .expect("convert");
        assert!(converted);
        assert_eq!(tx.description(), "Transfer to Savings");
        let savings_entry = tx
            .entries()
            .iter()
            .find(|entry| entry.account().id == savings.id)
            .expect("savings leg");
        assert!(savings_entry.is_debit());
    }

    #[test]
    fn convert_without_category_entry_is_a_no_op() {
        let mut tx = bank_import(Uuid::new_v4());
        let checking = account("Checking", AccountType::Asset, "1200");
        let savings = account("Savings", AccountType::Asset, "1300");
        tx.add_debit(checking, money(dec!(50))).expect("debit");
        tx.add_credit(savings.clone(), money(dec!(50))).expect("credit");
        tx.post(&eur()).expect("post");

        let converted = tx
            .convert_to_internal_transfer(&savings, "hash-3", &eur())
            .expect("convert");
        assert!(!converted);
        assert!(tx.is_posted());
    }

    #[test]
    fn failed_conversion_is_not_reposted() {
        let mut tx = bank_import(Uuid::new_v4());
        let checking = account("Checking", AccountType::Asset, "1200");
        let expense = account("Other expenses", AccountType::Expense, "4900");
        tx.add_debit(expense, money(dec!(100))).expect("debit");
        tx.add_credit(checking, money(dec!(100))).expect("credit");
        tx.post(&eur()).expect("post");

        // An income account is not a valid transfer destination; the
        // rebuild error must come back unmasked and the aggregate must
        // not be re-posted behind it.
        let not_an_asset = account("Other income", AccountType::Income, "8200");
        let err = tx
            .convert_to_internal_transfer(&not_an_asset, "hash-4", &eur())
            .unwrap_err();
        assert!(matches!(err, LedgerError::BusinessRule(_)));
        assert!(!tx.is_posted());
        assert!(!tx.is_internal_transfer());
        assert!(tx.metadata().transfer_identity_hash.is_none());
    }

    #[test]
    fn metadata_source_stays_in_sync() {
        let mut tx = bank_import(Uuid::new_v4());
        tx.update_metadata(|metadata| {
            metadata.source = Some("tampered".into());
            metadata.merchant = Some("REWE".into());
        })
        .expect("update");
        assert_eq!(tx.metadata().source.as_deref(), Some("bank_import"));
        assert_eq!(tx.metadata().merchant.as_deref(), Some("REWE"));
    }
}
