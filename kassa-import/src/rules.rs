use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use kassa_bank::BankTransaction;
use kassa_ledger::Account;
use kassa_ledger::AccountId;
use kassa_ledger::AccountRepository;
use kassa_ledger::AiResolution;
use kassa_ledger::UserId;
use kassa_ledger::normalize_iban;

use crate::ImportConfig;
use crate::ImportError;
use crate::ImportResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    CounterpartyName,
    PurposeText,
    AmountExact,
    AmountRange,
    Iban,
    Combined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSource {
    System,
    User,
    AiLearned,
    AiGenerated,
}

/// A user-defined (or learned) shortcut that maps matching bank
/// transactions straight to a counter-account, ahead of the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterAccountRule {
    pub id: Uuid,
    pub user_id: UserId,
    pub pattern_type: PatternType,
    pub pattern_value: String,
    pub counter_account_id: AccountId,
    pub priority: u32,
    pub source: RuleSource,
    pub is_active: bool,
    pub match_count: u64,
}

impl CounterAccountRule {
    pub const DEFAULT_PRIORITY: u32 = 100;

    pub fn new(
        user_id: UserId,
        pattern_type: PatternType,
        pattern_value: impl Into<String>,
        counter_account_id: AccountId,
    ) -> ImportResult<Self> {
        let pattern_value = pattern_value.into().trim().to_string();
        if pattern_value.is_empty() {
            return Err(ImportError::Validation(
                "rule pattern value cannot be empty".into(),
            ));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            pattern_type,
            pattern_value,
            counter_account_id,
            priority: Self::DEFAULT_PRIORITY,
            source: RuleSource::User,
            is_active: true,
            match_count: 0,
        })
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: RuleSource) -> Self {
        self.source = source;
        self
    }

    /// Whether this rule matches the bank transaction. Inactive rules
    /// never match; amount patterns compare against the absolute value.
    #[must_use]
    pub fn matches(&self, transaction: &BankTransaction) -> bool {
        if !self.is_active {
            return false;
        }
        match self.pattern_type {
            PatternType::CounterpartyName => transaction
                .applicant_name
                .as_deref()
                .is_some_and(|name| contains_ignore_case(name, &self.pattern_value)),
            PatternType::PurposeText => {
                contains_ignore_case(&transaction.purpose, &self.pattern_value)
            }
            PatternType::AmountExact => Decimal::from_str(self.pattern_value.trim())
                .map(|expected| transaction.amount.abs() == expected.abs())
                .unwrap_or(false),
            PatternType::AmountRange => match parse_range(&self.pattern_value) {
                Some((low, high)) => {
                    let amount = transaction.amount.abs();
                    amount >= low && amount <= high
                }
                None => false,
            },
            PatternType::Iban => {
                let expected = normalize_iban(Some(&self.pattern_value));
                expected.is_some() && transaction.normalized_applicant_iban() == expected
            }
            PatternType::Combined => match self.pattern_value.split_once('|') {
                Some((name_part, purpose_part)) => {
                    let name_matches = transaction
                        .applicant_name
                        .as_deref()
                        .is_some_and(|name| contains_ignore_case(name, name_part.trim()));
                    let purpose_matches =
                        contains_ignore_case(&transaction.purpose, purpose_part.trim());
                    name_matches && purpose_matches
                }
                None => false,
            },
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn parse_range(pattern: &str) -> Option<(Decimal, Decimal)> {
    let (low, high) = pattern.split_once('-')?;
    let low = Decimal::from_str(low.trim()).ok()?;
    let high = Decimal::from_str(high.trim()).ok()?;
    if low > high { Some((high, low)) } else { Some((low, high)) }
}

/// User-scoped rule storage.
#[async_trait]
pub trait CounterAccountRuleRepository: Send + Sync {
    async fn save(&self, rule: CounterAccountRule) -> ImportResult<CounterAccountRule>;

    /// Active rules ordered by priority, highest first.
    async fn list_active_by_priority(&self) -> ImportResult<Vec<CounterAccountRule>>;

    async fn increment_match_count(&self, rule_id: Uuid) -> ImportResult<()>;
}

/// Where a counter-account resolution came from.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionSource {
    Rule { rule_id: Uuid },
    Classifier,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub account: Account,
    pub source: ResolutionSource,
    pub ai: Option<AiResolution>,
}

/// Resolves the counter-account for an external bank transaction: rules by
/// priority first, then (from the coordinator) the classifier, then a
/// sign-based default account.
pub struct CounterAccountResolutionService {
    rule_repo: Arc<dyn CounterAccountRuleRepository>,
    account_repo: Arc<dyn AccountRepository>,
    config: ImportConfig,
}

impl CounterAccountResolutionService {
    pub fn new(
        rule_repo: Arc<dyn CounterAccountRuleRepository>,
        account_repo: Arc<dyn AccountRepository>,
        config: ImportConfig,
    ) -> Self {
        Self {
            rule_repo,
            account_repo,
            config,
        }
    }

    /// First active rule match wins and bumps the rule's match counter.
    pub async fn resolve_by_rules(
        &self,
        transaction: &BankTransaction,
    ) -> ImportResult<Option<ResolutionOutcome>> {
        let rules = self.rule_repo.list_active_by_priority().await?;
        for rule in rules {
            if !rule.matches(transaction) {
                continue;
            }
            let Some(account) = self.account_repo.find_by_id(rule.counter_account_id).await?
            else {
                tracing::warn!(
                    rule_id = %rule.id,
                    account_id = %rule.counter_account_id,
                    "rule points at a missing account"
                );
                continue;
            };
            self.rule_repo.increment_match_count(rule.id).await?;
            tracing::debug!(rule_id = %rule.id, account = %account.name, "rule matched");
            return Ok(Some(ResolutionOutcome {
                account,
                source: ResolutionSource::Rule { rule_id: rule.id },
                ai: None,
            }));
        }
        Ok(None)
    }

    /// Sign-based default: expenses to the default expense account,
    /// income to the default income account.
    pub async fn fallback_account(&self, is_expense: bool) -> ImportResult<Account> {
        let number = if is_expense {
            &self.config.default_expense_account_number
        } else {
            &self.config.default_income_account_number
        };
        self.account_repo
            .find_by_account_number(number)
            .await?
            .ok_or_else(|| ImportError::NotFound(format!("fallback account {number}")))
    }
}
