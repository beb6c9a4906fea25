//! Two-Phase Commit Tests
//!
//! One transaction spanning several environments:
//! - A lost read condition anywhere writes nothing everywhere
//! - Write-only environments commit only after every condition held
//! - Randomized interleavings never break a cross-database invariant

use std::sync::Arc;

use meshlog::audit::RetentionPolicy;
use meshlog::table::{Database, Table, TableDef, WriteOptions};
use meshlog::txn::{Isolation, Transaction};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

const ACCOUNTS: usize = 4;
const OPENING_BALANCE: i64 = 100;

struct Bank {
    db: Arc<Database>,
    accounts: Arc<Table>,
}

impl Bank {
    fn open(name: &str) -> Self {
        let db = Database::in_memory(name, RetentionPolicy::default()).unwrap();
        let accounts = db.table(TableDef::new("accounts")).unwrap();
        for n in 0..ACCOUNTS {
            db.transact(3, |txn| {
                accounts.put(
                    txn,
                    &format!("acct-{}", n),
                    json!({ "balance": OPENING_BALANCE }),
                    &WriteOptions::default(),
                )
            })
            .unwrap();
        }
        Self { db, accounts }
    }

    fn balance(&self, id: &str) -> i64 {
        balance_of(self.accounts.get_value(id).unwrap())
    }

    fn total(&self) -> i64 {
        (0..ACCOUNTS).map(|n| self.balance(&format!("acct-{}", n))).sum()
    }

    /// Rewrite a record with its current value, bumping its version
    fn touch(&self, id: &str) {
        let value = self.accounts.get_value(id).unwrap().unwrap();
        self.db
            .transact(3, |txn| self.accounts.put(txn, id, value.clone(), &WriteOptions::default()))
            .unwrap();
    }
}

fn balance_of(value: Option<Value>) -> i64 {
    value
        .and_then(|value| value["balance"].as_i64())
        .expect("account has a balance")
}

/// Stage a transfer from `from` in one bank to `to` in another
fn stage_transfer(txn: &mut Transaction, source: &Bank, from: &str, target: &Bank, to: &str, amount: i64) {
    let from_balance = balance_of(source.accounts.get(txn, from).unwrap());
    let to_balance = balance_of(target.accounts.get(txn, to).unwrap());
    source
        .accounts
        .put(txn, from, json!({ "balance": from_balance - amount }), &WriteOptions::default())
        .unwrap();
    target
        .accounts
        .put(txn, to, json!({ "balance": to_balance + amount }), &WriteOptions::default())
        .unwrap();
}

// =============================================================================
// Atomicity Tests
// =============================================================================

/// A transfer across two databases commits in both.
#[test]
fn test_cross_database_commit() {
    let east = Bank::open("east");
    let west = Bank::open("west");

    let mut txn = Transaction::begin(east.db.env(), Isolation::Tracked);
    stage_transfer(&mut txn, &east, "acct-0", &west, "acct-1", 30);
    assert_eq!(txn.environments().len(), 2);

    let receipts = txn.commit_with_receipts().unwrap().expect("committed");
    assert_eq!(receipts.len(), 2);
    assert!(receipts.iter().all(|(_, receipt)| receipt.local_times.len() == 1));

    assert_eq!(east.balance("acct-0"), 70);
    assert_eq!(west.balance("acct-1"), 130);
    assert_eq!(east.total() + west.total(), 2 * ACCOUNTS as i64 * OPENING_BALANCE);
}

/// A condition lost in one database leaves the other untouched.
#[test]
fn test_lost_condition_writes_nothing() {
    let east = Bank::open("east");
    let west = Bank::open("west");
    let west_history = west.accounts.history("acct-1").unwrap().len();

    let mut txn = Transaction::begin(east.db.env(), Isolation::Tracked);
    stage_transfer(&mut txn, &east, "acct-0", &west, "acct-1", 30);
    west.touch("acct-1");

    assert!(!txn.commit().unwrap());
    assert_eq!(east.balance("acct-0"), OPENING_BALANCE);
    assert_eq!(west.balance("acct-1"), OPENING_BALANCE);
    assert_eq!(east.accounts.history("acct-0").unwrap().len(), 1);
    assert_eq!(west.accounts.history("acct-1").unwrap().len(), west_history + 1);
}

/// An environment with writes but no reads waits on the others' conditions.
#[test]
fn test_write_only_environment_follows_conditions() {
    let east = Bank::open("east");
    let west = Bank::open("west");

    let mut txn = Transaction::begin(east.db.env(), Isolation::Tracked);
    let balance = balance_of(east.accounts.get(&mut txn, "acct-2").unwrap());
    west.accounts
        .put(&mut txn, "acct-9", json!({ "balance": balance }), &WriteOptions::default())
        .unwrap();
    east.touch("acct-2");

    assert!(!txn.commit().unwrap());
    assert_eq!(west.accounts.get_value("acct-9").unwrap(), None);
    assert!(west.accounts.history("acct-9").unwrap().is_empty());
}

/// Untracked transactions ignore interleaved writes.
#[test]
fn test_untracked_ignores_conflicts() {
    let east = Bank::open("east");
    let mut txn = Transaction::begin(east.db.env(), Isolation::Untracked);
    let balance = balance_of(east.accounts.get(&mut txn, "acct-0").unwrap());
    east.accounts
        .put(&mut txn, "acct-0", json!({ "balance": balance + 1 }), &WriteOptions::default())
        .unwrap();
    east.touch("acct-0");

    assert!(txn.commit().unwrap());
    assert_eq!(east.balance("acct-0"), OPENING_BALANCE + 1);
}

// =============================================================================
// Randomized Interleavings
// =============================================================================

/// Random transfers, some raced by a concurrent write to one of their
/// records. Raced transfers fail whole; the combined balance never moves.
#[test]
fn test_random_transfers_conserve_total() {
    let east = Bank::open("east");
    let west = Bank::open("west");
    let expected_total = 2 * ACCOUNTS as i64 * OPENING_BALANCE;
    let mut rng = StdRng::seed_from_u64(0x6d65_7368);
    let mut committed = 0;
    let mut aborted = 0;

    for _ in 0..200 {
        let eastward = rng.gen_bool(0.5);
        let (source, target) = if eastward { (&west, &east) } else { (&east, &west) };
        let from = format!("acct-{}", rng.gen_range(0..ACCOUNTS));
        let to = format!("acct-{}", rng.gen_range(0..ACCOUNTS));
        let amount = rng.gen_range(1..=20);

        let mut txn = Transaction::begin(source.db.env(), Isolation::Tracked);
        stage_transfer(&mut txn, source, &from, target, &to, amount);

        let raced = rng.gen_bool(0.3);
        if raced {
            if rng.gen_bool(0.5) {
                source.touch(&from);
            } else {
                target.touch(&to);
            }
        }

        let ok = txn.commit().unwrap();
        assert_eq!(ok, !raced);
        if ok {
            committed += 1;
        } else {
            aborted += 1;
        }
        assert_eq!(east.total() + west.total(), expected_total);
    }

    assert!(committed > 0);
    assert!(aborted > 0);
}
