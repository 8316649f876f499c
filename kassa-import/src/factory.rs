use kassa_bank::BankTransaction;
use kassa_ledger::Account;
use kassa_ledger::AiResolution;
use kassa_ledger::Currency;
use kassa_ledger::LedgerResult;
use kassa_ledger::Money;
use kassa_ledger::NewTransaction;
use kassa_ledger::Transaction;
use kassa_ledger::TransactionMetadata;
use kassa_ledger::TransactionSource;
use kassa_ledger::UserContext;

/// Everything needed to turn a bank transaction into a draft accounting
/// transaction.
pub struct FactoryRequest<'a> {
    pub bank_transaction: &'a BankTransaction,
    pub asset_account: &'a Account,
    pub counter_account: &'a Account,
    pub source_iban: &'a str,
    pub is_internal_transfer: bool,
    pub ai_resolution: Option<AiResolution>,
    pub merchant: Option<String>,
    pub recurring_pattern: Option<String>,
}

/// Builds the two-legged accounting transaction for a bank import: the
/// protected asset leg mirroring the statement line plus the resolved
/// counter-account leg. Entry order is counter-account first so consumers
/// can show the category without digging.
pub struct BankImportTransactionFactory {
    user: UserContext,
    default_currency: Currency,
}

impl BankImportTransactionFactory {
    pub fn new(user: UserContext, default_currency: Currency) -> Self {
        Self {
            user,
            default_currency,
        }
    }

    pub fn create(&self, request: FactoryRequest<'_>) -> LedgerResult<Transaction> {
        let bank_transaction = request.bank_transaction;
        let description = description_for(bank_transaction);

        let metadata = TransactionMetadata {
            ai_resolution: request.ai_resolution,
            merchant: request.merchant,
            recurring_pattern: request.recurring_pattern,
            ..Default::default()
        };

        let params = NewTransaction {
            user_id: self.user.user_id,
            description,
            date: bank_transaction.booking_date,
            counterparty: bank_transaction.applicant_name.clone(),
            counterparty_iban: bank_transaction.applicant_iban.clone(),
            source: TransactionSource::BankImport,
            source_iban: Some(request.source_iban.to_string()),
            is_internal_transfer: request.is_internal_transfer,
            metadata,
        };
        let mut transaction = Transaction::new(params)?;

        let magnitude = Money::new(
            bank_transaction.amount.abs(),
            bank_transaction.currency.clone(),
        );
        if bank_transaction.is_debit() {
            // Money out: the counter-account carries the expense.
            transaction.add_debit(request.counter_account.clone(), magnitude.clone())?;
            transaction.add_credit(request.asset_account.clone(), magnitude)?;
        } else {
            // Money in: the counter-account is the income side.
            transaction.add_credit(request.counter_account.clone(), magnitude.clone())?;
            transaction.add_debit(request.asset_account.clone(), magnitude)?;
        }

        Ok(transaction)
    }

    #[must_use]
    pub fn default_currency(&self) -> &Currency {
        &self.default_currency
    }
}

fn description_for(transaction: &BankTransaction) -> String {
    let purpose = transaction.purpose.trim();
    if !purpose.is_empty() {
        return purpose.to_string();
    }
    if let Some(name) = transaction.applicant_name.as_deref()
        && !name.trim().is_empty()
    {
        return name.trim().to_string();
    }
    "Bank transaction".to_string()
}
