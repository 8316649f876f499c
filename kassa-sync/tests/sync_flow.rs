//! End-to-end sync scenarios against a scripted bank adapter.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use uuid::Uuid;

use kassa_bank::BankAccount;
use kassa_bank::BankConnectionPort;
use kassa_bank::BankCredentials;
use kassa_bank::BankError;
use kassa_bank::BankResult;
use kassa_bank::BankTransaction;
use kassa_bank::BankTransactionStore;
use kassa_bank::AccountMapping;
use kassa_bank::AccountMappingRepository;
use kassa_bank::TanCallback;
use kassa_classify::ClassifierConfig;
use kassa_classify::NoiseModelRepository;
use kassa_classify::NoiseModelSnapshot;
use kassa_ledger::Account;
use kassa_ledger::AccountRepository;
use kassa_ledger::AccountType;
use kassa_ledger::Currency;
use kassa_import::TransactionImportRepository;
use kassa_ledger::TransactionRepository;
use kassa_ledger::UserContext;
use kassa_sync::SyncConfig;
use kassa_sync::SyncEvent;
use kassa_sync::SyncRequest;
use kassa_sync::SyncStack;

const IBAN_A: &str = "DE11520513735120710131";
const IBAN_B: &str = "DE89370400440532013000";

/// Scripted FinTS-style adapter: fixed accounts and transactions, connect
/// and disconnect counters, optional fetch failure.
#[derive(Default)]
struct FakeBankAdapter {
    accounts: Mutex<Vec<BankAccount>>,
    transactions: Mutex<Vec<(String, BankTransaction)>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    fail_fetch: std::sync::atomic::AtomicBool,
}

impl FakeBankAdapter {
    fn new() -> Self {
        Self::default()
    }

    async fn set_balance(&self, iban: &str, balance: Option<Decimal>) {
        let mut accounts = self.accounts.lock().await;
        accounts.retain(|account| account.iban != iban);
        accounts.push(BankAccount {
            iban: iban.to_string(),
            account_number: iban.chars().rev().take(10).collect(),
            bank_code: iban.chars().skip(4).take(8).collect(),
            account_holder: "Max Mustermann".into(),
            account_type: "Girokonto".into(),
            currency: Currency::eur(),
            balance,
        });
    }

    async fn script(&self, iban: &str, transactions: Vec<BankTransaction>) {
        let mut scripted = self.transactions.lock().await;
        scripted.retain(|(account, _)| account != iban);
        for transaction in transactions {
            scripted.push((iban.to_string(), transaction));
        }
    }
}

#[async_trait]
impl BankConnectionPort for FakeBankAdapter {
    async fn connect(&self, _credentials: &BankCredentials) -> BankResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> BankResult<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_accounts(&self) -> BankResult<Vec<BankAccount>> {
        Ok(self.accounts.lock().await.clone())
    }

    async fn fetch_transactions(
        &self,
        account_iban: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> BankResult<Vec<BankTransaction>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(BankError::Adapter("connection reset by bank".into()));
        }
        Ok(self
            .transactions
            .lock()
            .await
            .iter()
            .filter(|(iban, _)| iban == account_iban)
            .map(|(_, transaction)| transaction.clone())
            .collect())
    }

    async fn set_tan_method(&self, _method: &str) -> BankResult<()> {
        Ok(())
    }

    async fn set_tan_medium(&self, _medium: &str) -> BankResult<()> {
        Ok(())
    }

    async fn set_tan_callback(&self, _callback: TanCallback) -> BankResult<()> {
        Ok(())
    }
}

struct World {
    adapter: Arc<FakeBankAdapter>,
    stack: SyncStack,
    checking: Account,
    equity: Account,
    expense: Account,
    income: Account,
}

/// Chart with a mapped checking account, the opening-balance equity
/// account and the two sign-based fallback accounts.
async fn world() -> World {
    let user = UserContext::new(Uuid::new_v4(), "max@example.com");
    let adapter = Arc::new(FakeBankAdapter::new());
    let stack = SyncStack::in_memory(
        user.clone(),
        adapter.clone(),
        SyncConfig::default(),
        ClassifierConfig::default(),
        None,
    );

    let checking = stack
        .accounts
        .save(
            Account::new(user.user_id, "Checking", AccountType::Asset, "1200", Currency::eur())
                .expect("account")
                .with_iban(IBAN_A),
        )
        .await
        .expect("save checking");
    stack
        .mappings
        .save(AccountMapping::new(user.user_id, IBAN_A, checking.id, "Checking").expect("mapping"))
        .await
        .expect("save mapping");

    let equity = stack
        .accounts
        .save(
            Account::new(
                user.user_id,
                "Opening balance",
                AccountType::Equity,
                "2000",
                Currency::eur(),
            )
            .expect("account"),
        )
        .await
        .expect("save equity");
    let expense = stack
        .accounts
        .save(
            Account::new(
                user.user_id,
                "Other expenses",
                AccountType::Expense,
                "4900",
                Currency::eur(),
            )
            .expect("account"),
        )
        .await
        .expect("save expense");
    let income = stack
        .accounts
        .save(
            Account::new(
                user.user_id,
                "Other income",
                AccountType::Income,
                "8200",
                Currency::eur(),
            )
            .expect("account"),
        )
        .await
        .expect("save income");

    World {
        adapter,
        stack,
        checking,
        equity,
        expense,
        income,
    }
}

fn transaction(
    amount: Decimal,
    purpose: &str,
    applicant: Option<&str>,
    applicant_iban: Option<&str>,
    date: NaiveDate,
) -> BankTransaction {
    BankTransaction {
        booking_date: date,
        value_date: date,
        amount,
        currency: Currency::eur(),
        purpose: purpose.into(),
        applicant_name: applicant.map(str::to_string),
        applicant_iban: applicant_iban.map(str::to_string),
        applicant_bic: None,
        bank_reference: None,
        customer_reference: None,
        end_to_end_reference: None,
        mandate_reference: None,
    }
}

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("date")
}

fn request() -> SyncRequest {
    SyncRequest::new(IBAN_A)
        .with_credentials(BankCredentials {
            bank_code: "52051373".into(),
            login: "max".into(),
            secret: "opaque".into(),
            endpoint: "https://fints.example".into(),
        })
        .with_auto_post(true)
}

/// Keep test tokens below the noise cutoff by pre-observing documents.
async fn warm_noise_model(stack: &SyncStack) {
    stack
        .noise_models
        .save(NoiseModelSnapshot {
            document_count: 30,
            token_document_frequency: std::collections::HashMap::from([
                ("kartenzahlung".to_string(), 25_u64),
                ("lastschrift".to_string(), 20_u64),
            ]),
        })
        .await
        .expect("seed noise model");
}

#[tokio::test]
async fn opening_balance_on_first_sync() {
    let world = world().await;
    world.adapter.set_balance(IBAN_A, Some(dec!(1000.00))).await;
    world
        .adapter
        .script(
            IBAN_A,
            vec![
                transaction(dec!(500.00), "Gehalt Januar", Some("Employer GmbH"), None, date(2025, 1, 25)),
                transaction(dec!(-100.00), "Einkauf", Some("REWE"), None, date(2025, 1, 15)),
                transaction(dec!(-50.00), "Tanken", Some("ARAL"), None, date(2025, 1, 10)),
            ],
        )
        .await;

    let result = world.stack.command.execute(request()).await;

    assert!(result.success, "sync failed: {:?}", result.error_message);
    assert_eq!(result.transactions_fetched, 3);
    assert_eq!(result.transactions_imported, 3);
    assert!(result.opening_balance_created);
    assert_eq!(result.opening_balance_amount, Some(dec!(650.00)));

    let opening = world
        .stack
        .transactions
        .find_by_opening_balance_iban(IBAN_A)
        .await
        .expect("query");
    assert_eq!(opening.len(), 1);
    let opening = &opening[0];
    assert!(opening.is_posted());
    assert_eq!(opening.date(), date(2025, 1, 10));
    let asset_leg = opening
        .entries()
        .iter()
        .find(|entry| entry.account().id == world.checking.id)
        .expect("asset leg");
    assert!(asset_leg.is_debit());
    assert_eq!(asset_leg.amount().amount, dec!(650.00));
    assert!(opening.involves_account(world.equity.id));

    // Second run: same inputs, no second opening balance, nothing new.
    let again = world.stack.command.execute(request()).await;
    assert!(again.success);
    assert!(!again.opening_balance_created);
    assert_eq!(again.transactions_imported, 0);
    let opening = world
        .stack
        .transactions
        .find_by_opening_balance_iban(IBAN_A)
        .await
        .expect("query");
    assert_eq!(opening.len(), 1);
}

#[tokio::test]
async fn identical_refunds_become_two_transactions() {
    let world = world().await;
    world.adapter.set_balance(IBAN_A, None).await;
    let refund = transaction(
        dec!(3.10),
        "Erstattung Pfand",
        Some("ACME GmbH"),
        None,
        date(2025, 11, 10),
    );
    world.adapter.script(IBAN_A, vec![refund.clone(), refund]).await;

    let result = world.stack.command.execute(request()).await;
    assert!(result.success);
    assert_eq!(result.transactions_imported, 2);

    let stored = world
        .stack
        .bank_store
        .query(IBAN_A, None, None, None)
        .await
        .expect("query");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].identity_hash, stored[1].identity_hash);
    assert_eq!(stored[0].hash_sequence, 1);
    assert_eq!(stored[1].hash_sequence, 2);
    assert!(stored.iter().all(|record| record.is_imported));

    // Two distinct accounting transactions, one per occurrence.
    let booked = world.stack.transactions.list().await.expect("list");
    assert_eq!(booked.len(), 2);
    assert!(booked.iter().all(|tx| tx.involves_account(world.income.id)));
}

#[tokio::test]
async fn transfer_is_reconciled_across_accounts() {
    let world = world().await;
    world.adapter.set_balance(IBAN_A, None).await;

    // Yesterday account A imported an outgoing 100 to the then-unmapped
    // IBAN B; it landed on the expense fallback.
    world
        .adapter
        .script(
            IBAN_A,
            vec![transaction(
                dec!(-100.00),
                "Uebertrag Sparen",
                Some("Max Mustermann"),
                Some(IBAN_B),
                date(2025, 6, 2),
            )],
        )
        .await;
    let first = world.stack.command.execute(request()).await;
    assert!(first.success);
    assert_eq!(first.transactions_imported, 1);
    let booked = world.stack.transactions.list().await.expect("list");
    assert!(booked[0].involves_account(world.expense.id));
    assert!(!booked[0].is_internal_transfer());

    // Now the user adds account B with its own mapping and syncs it.
    let savings = world
        .stack
        .accounts
        .save(
            Account::new(
                world.stack.user.user_id,
                "Savings",
                AccountType::Asset,
                "1300",
                Currency::eur(),
            )
            .expect("account")
            .with_iban(IBAN_B),
        )
        .await
        .expect("save savings");
    world
        .stack
        .mappings
        .save(
            AccountMapping::new(world.stack.user.user_id, IBAN_B, savings.id, "Savings")
                .expect("mapping"),
        )
        .await
        .expect("save mapping");

    world.adapter.set_balance(IBAN_B, None).await;
    world
        .adapter
        .script(
            IBAN_B,
            vec![transaction(
                dec!(100.00),
                "Uebertrag Sparen",
                Some("Max Mustermann"),
                Some(IBAN_A),
                date(2025, 6, 2),
            )],
        )
        .await;

    let second = world
        .stack
        .command
        .execute(SyncRequest::new(IBAN_B).with_credentials(BankCredentials {
            bank_code: "37040044".into(),
            login: "max".into(),
            secret: "opaque".into(),
            endpoint: "https://fints.example".into(),
        }).with_auto_post(true))
        .await;

    assert!(second.success, "sync failed: {:?}", second.error_message);
    assert_eq!(second.transactions_imported, 1);
    assert_eq!(second.transactions_reconciled, 1);
    assert!(
        second
            .warning_message
            .as_deref()
            .expect("warning")
            .contains("Reconciled 1 internal transfer")
    );

    // The original transaction was converted in place; no new accounting
    // transaction exists for B's leg.
    let booked = world.stack.transactions.list().await.expect("list");
    assert_eq!(booked.len(), 1);
    let converted = &booked[0];
    assert!(converted.is_internal_transfer());
    assert!(converted.is_posted());
    assert!(converted.involves_account(world.checking.id));
    assert!(converted.involves_account(savings.id));
    assert!(!converted.involves_account(world.expense.id));
    assert!(converted.metadata().transfer_identity_hash.is_some());
}

#[tokio::test]
async fn example_tier_classifies_repeat_merchants() {
    let world = world().await;
    warm_noise_model(&world.stack).await;
    world.adapter.set_balance(IBAN_A, None).await;

    let groceries = world
        .stack
        .accounts
        .save(
            Account::new(
                world.stack.user.user_id,
                "Groceries",
                AccountType::Expense,
                "4000",
                Currency::eur(),
            )
            .expect("account"),
        )
        .await
        .expect("save groceries");

    // Twenty posted imports previously categorised as groceries.
    for _ in 0..20 {
        world
            .stack
            .pipeline
            .add_example(
                &groceries,
                Some("REWE Markt"),
                "einkauf lebensmittel",
                Some(Uuid::new_v4()),
            )
            .await
            .expect("example");
    }

    world
        .adapter
        .script(
            IBAN_A,
            vec![transaction(
                dec!(-23.45),
                "einkauf lebensmittel",
                Some("REWE Markt"),
                None,
                date(2025, 7, 14),
            )],
        )
        .await;

    let result = world.stack.command.execute(request()).await;
    assert!(result.success);
    assert_eq!(result.transactions_imported, 1);

    let booked = world.stack.transactions.list().await.expect("list");
    assert_eq!(booked.len(), 1);
    assert!(booked[0].involves_account(groceries.id));
    let ai = booked[0]
        .metadata()
        .ai_resolution
        .as_ref()
        .expect("ai resolution");
    assert_eq!(ai.tier, "example");
    assert!(ai.confidence >= 0.85);
    assert_eq!(ai.account_number.as_deref(), Some("4000"));
}

#[tokio::test]
async fn anchor_tier_covers_the_cold_start() {
    let world = world().await;
    warm_noise_model(&world.stack).await;
    world.adapter.set_balance(IBAN_A, None).await;

    let fuel = world
        .stack
        .accounts
        .save(
            Account::new(
                world.stack.user.user_id,
                "Fuel",
                AccountType::Expense,
                "4100",
                Currency::eur(),
            )
            .expect("account")
            .with_description("tankstelle kraftstoff benzin diesel"),
        )
        .await
        .expect("save fuel");

    let chart = world.stack.accounts.list_active().await.expect("chart");
    world
        .stack
        .pipeline
        .embed_accounts(&chart)
        .await
        .expect("embed anchors");

    world
        .adapter
        .script(
            IBAN_A,
            vec![transaction(
                dec!(-54.20),
                "tankstelle benzin diesel kraftstoff",
                Some("Aral"),
                None,
                date(2025, 7, 20),
            )],
        )
        .await;

    let result = world.stack.command.execute(request()).await;
    assert!(result.success);

    let booked = world.stack.transactions.list().await.expect("list");
    assert!(booked[0].involves_account(fuel.id));
    let ai = booked[0]
        .metadata()
        .ai_resolution
        .as_ref()
        .expect("ai resolution");
    assert_eq!(ai.tier, "anchor");
    assert!(ai.confidence >= 0.55);
}

#[tokio::test]
async fn failures_are_isolated_and_reported_as_warnings() {
    let world = world().await;
    world.adapter.set_balance(IBAN_A, None).await;

    // Removing the income fallback makes incoming transactions fail
    // during counter-account resolution.
    world
        .stack
        .accounts
        .deactivate(world.income.id)
        .await
        .expect("deactivate");

    world
        .adapter
        .script(
            IBAN_A,
            vec![
                transaction(dec!(-10.00), "Erste", Some("A"), None, date(2025, 8, 1)),
                transaction(dec!(75.00), "Kaputt", Some("B"), None, date(2025, 8, 2)),
                transaction(dec!(-20.00), "Dritte", Some("C"), None, date(2025, 8, 3)),
            ],
        )
        .await;

    let result = world.stack.command.execute(request()).await;

    assert!(result.success);
    assert_eq!(result.transactions_imported, 2);
    assert_eq!(result.transactions_failed, 1);
    let warning = result.warning_message.as_deref().expect("warning");
    assert!(warning.contains("1 transaction failed to import"));
    assert!(warning.contains("fallback account"));

    // First and third committed; the failed one left an audit record but
    // no accounting rows.
    assert_eq!(world.stack.transactions.list().await.expect("list").len(), 2);
    let stored = world
        .stack
        .bank_store
        .query(IBAN_A, None, None, None)
        .await
        .expect("query");
    let failed_record = stored
        .iter()
        .find(|record| record.transaction.purpose == "Kaputt")
        .expect("stored");
    let audit = world
        .stack
        .imports
        .find_by_bank_transaction_id(failed_record.id)
        .await
        .expect("find")
        .expect("audit record");
    assert_eq!(audit.status, kassa_import::ImportStatus::Failed);
    assert!(!failed_record.is_imported);

    // The failed transaction is retried on the next sync.
    world
        .stack
        .accounts
        .save({
            let mut income = world.income.clone();
            income.is_active = true;
            income
        })
        .await
        .expect("reactivate");
    let retry = world.stack.command.execute(request()).await;
    assert!(retry.success);
    assert_eq!(retry.transactions_imported, 1);
    assert_eq!(world.stack.transactions.list().await.expect("list").len(), 3);
}

#[tokio::test]
async fn adapter_failure_produces_an_error_result_and_disconnects() {
    let world = world().await;
    world.adapter.set_balance(IBAN_A, None).await;
    world.adapter.fail_fetch.store(true, Ordering::SeqCst);

    let result = world.stack.command.execute(request()).await;
    assert!(!result.success);
    assert!(
        result
            .error_message
            .as_deref()
            .expect("error")
            .contains("connection reset")
    );
    assert_eq!(result.transactions_fetched, 0);

    // The scoped session released the connection despite the failure.
    assert_eq!(world.adapter.connects.load(Ordering::SeqCst), 1);
    assert_eq!(world.adapter.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_mapping_is_an_error_result() {
    let world = world().await;
    let result = world
        .stack
        .command
        .execute(
            SyncRequest::new(IBAN_B).with_credentials(BankCredentials {
                bank_code: "37040044".into(),
                login: "max".into(),
                secret: "opaque".into(),
                endpoint: "https://fints.example".into(),
            }),
        )
        .await;
    assert!(!result.success);
    assert!(
        result
            .error_message
            .as_deref()
            .expect("error")
            .contains("No active account mapping")
    );
}

#[tokio::test]
async fn stored_credentials_are_resolved_and_stamped() {
    let world = world().await;
    world.adapter.set_balance(IBAN_A, None).await;
    world.adapter.script(IBAN_A, vec![]).await;
    world
        .stack
        .credentials
        .insert(BankCredentials {
            bank_code: "52051373".into(),
            login: "max".into(),
            secret: "opaque".into(),
            endpoint: "https://fints.example".into(),
        })
        .await;

    // No credentials in the request: the store supplies them.
    let result = world.stack.command.execute(SyncRequest::new(IBAN_A)).await;
    assert!(result.success, "sync failed: {:?}", result.error_message);
    assert!(world.stack.credentials.last_used("52051373").await.is_some());
}

#[tokio::test]
async fn streaming_emits_progress_and_a_final_result() {
    let world = world().await;
    world.adapter.set_balance(IBAN_A, None).await;
    world
        .adapter
        .script(
            IBAN_A,
            vec![
                transaction(dec!(-10.00), "Erste", Some("A"), None, date(2025, 8, 1)),
                transaction(dec!(-20.00), "Zweite", Some("B"), None, date(2025, 8, 2)),
            ],
        )
        .await;

    let (sender, mut receiver) = tokio::sync::mpsc::channel(32);
    world.stack.command.execute_streaming(request(), sender).await;

    let mut fetched = 0;
    let mut classified = 0;
    let mut finished = None;
    while let Some(event) = receiver.recv().await {
        match event {
            SyncEvent::Fetched {
                transactions_fetched,
                new_transactions,
                ..
            } => {
                fetched += 1;
                assert_eq!(transactions_fetched, 2);
                assert_eq!(new_transactions, 2);
            }
            SyncEvent::Classifying { total, .. } => assert_eq!(total, 2),
            SyncEvent::Classified {
                current,
                total,
                counter_account_name,
                ..
            } => {
                classified += 1;
                assert!(current <= total);
                assert!(!counter_account_name.is_empty());
            }
            SyncEvent::Finished(result) => finished = Some(result),
        }
    }

    assert_eq!(fetched, 1);
    assert_eq!(classified, 2);
    let result = finished.expect("final event");
    assert!(result.success);
    assert_eq!(result.transactions_imported, 2);
}
