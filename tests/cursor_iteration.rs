//! Ordered iteration over trees deep enough to exercise splits and
//! sibling traversal across branch pages.

use mapledb::{Cursor, CursorOp, DbFlags, Dbi, Environment, WriteFlags};
use tempfile::TempDir;

fn open_env(dir: &TempDir) -> Environment {
    Environment::builder()
        .map_size(64 << 20)
        .open(dir.path())
        .unwrap()
}

fn fill_numbered(env: &Environment, count: usize) {
    let mut txn = env.begin_write().unwrap();
    for i in 0..count {
        let key = format!("k{:03}", i);
        let value = (i as u64).to_le_bytes();
        txn.put(Dbi::MAIN, key.as_bytes(), &value, WriteFlags::empty())
            .unwrap();
    }
    txn.commit().unwrap();
}

#[test]
fn thousand_keys_iterate_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    fill_numbered(&env, 1000);

    let stat = env.stat().unwrap();
    assert_eq!(stat.entries, 1000);
    assert!(stat.depth >= 2, "depth {}", stat.depth);
    assert!(stat.leaf_pages >= 2);

    let rtxn = env.begin_read().unwrap();
    let mut cursor = rtxn.cursor(Dbi::MAIN).unwrap();
    let mut seen = Vec::new();
    let mut entry = cursor.first().unwrap();
    while let Some((key, value)) = entry {
        seen.push((key.to_vec(), value.to_vec()));
        entry = cursor.next().unwrap();
    }

    assert_eq!(seen.len(), 1000);
    for (i, (key, value)) in seen.iter().enumerate() {
        assert_eq!(key, format!("k{:03}", i).as_bytes());
        assert_eq!(value.as_slice(), &(i as u64).to_le_bytes());
    }
}

#[test]
fn reverse_iteration_visits_everything() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    fill_numbered(&env, 300);

    let rtxn = env.begin_read().unwrap();
    let mut cursor = rtxn.cursor(Dbi::MAIN).unwrap();
    let mut count = 0;
    let mut last_key: Option<Vec<u8>> = None;
    let mut entry = cursor.last().unwrap();
    while let Some((key, _)) = entry {
        if let Some(prev) = &last_key {
            assert!(key < prev.as_slice(), "descending order violated");
        }
        last_key = Some(key.to_vec());
        count += 1;
        entry = cursor.prev().unwrap();
    }

    assert_eq!(count, 300);
    assert_eq!(last_key.unwrap(), b"k000");
}

#[test]
fn set_and_set_range_position_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    fill_numbered(&env, 500);

    let rtxn = env.begin_read().unwrap();
    let mut cursor = rtxn.cursor(Dbi::MAIN).unwrap();

    let (key, _) = cursor.set(b"k250").unwrap().unwrap();
    assert_eq!(key, b"k250");
    assert!(cursor.set(b"k250x").unwrap().is_none());

    // Range: "k250x" falls between k250 and k251.
    let (key, _) = cursor.set_range(b"k250x").unwrap().unwrap();
    assert_eq!(key, b"k251");

    // And iteration continues from the set point.
    let (key, _) = cursor.next().unwrap().unwrap();
    assert_eq!(key, b"k252");

    // Past the last key there is nothing.
    assert!(cursor.set_range(b"z").unwrap().is_none());
}

#[test]
fn next_runs_off_the_end_and_stays_there() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    fill_numbered(&env, 5);

    let rtxn = env.begin_read().unwrap();
    let mut cursor = rtxn.cursor(Dbi::MAIN).unwrap();
    for _ in 0..5 {
        assert!(cursor.next().unwrap().is_some());
    }
    assert!(cursor.next().unwrap().is_none());
    assert!(cursor.next().unwrap().is_none());

    // Prev after EOF restarts from the last entry.
    let (key, _) = cursor.prev().unwrap().unwrap();
    assert_eq!(key, b"k004");
}

#[test]
fn uninitialized_next_behaves_like_first() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    fill_numbered(&env, 10);

    let rtxn = env.begin_read().unwrap();
    let mut cursor = rtxn.cursor(Dbi::MAIN).unwrap();
    let (key, _) = cursor.next().unwrap().unwrap();
    assert_eq!(key, b"k000");
}

#[test]
fn cursor_on_empty_database() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    let rtxn = env.begin_read().unwrap();
    let mut cursor = rtxn.cursor(Dbi::MAIN).unwrap();
    assert!(cursor.first().unwrap().is_none());
    assert!(cursor.last().unwrap().is_none());
    assert!(cursor.set_range(b"anything").unwrap().is_none());
}

#[test]
fn cursor_sees_uncommitted_writes_in_its_own_txn() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    fill_numbered(&env, 50);

    let mut txn = env.begin_write().unwrap();
    txn.put(Dbi::MAIN, b"k025x", b"inserted", WriteFlags::empty())
        .unwrap();

    let mut cursor = txn.cursor(Dbi::MAIN).unwrap();
    let (key, _) = cursor.set(b"k025").unwrap().unwrap();
    assert_eq!(key, b"k025");
    let (key, value) = cursor.next().unwrap().unwrap();
    assert_eq!(key, b"k025x");
    assert_eq!(value, b"inserted");
    let (key, _) = cursor.next().unwrap().unwrap();
    assert_eq!(key, b"k026");
}

#[test]
fn deleting_down_to_empty_collapses_the_tree() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    fill_numbered(&env, 400);

    let mut txn = env.begin_write().unwrap();
    for i in 0..400 {
        let key = format!("k{:03}", i);
        assert!(txn.del(Dbi::MAIN, key.as_bytes(), None).unwrap());
    }
    txn.commit().unwrap();

    let stat = env.stat().unwrap();
    assert_eq!(stat.entries, 0);
    assert_eq!(stat.depth, 0);

    let rtxn = env.begin_read().unwrap();
    let mut cursor = rtxn.cursor(Dbi::MAIN).unwrap();
    assert!(cursor.first().unwrap().is_none());
}

#[test]
fn reverse_key_database_orders_backwards() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    let mut txn = env.begin_write().unwrap();
    let db = txn.db(Some("rev"), DbFlags::CREATE | DbFlags::REVERSEKEY).unwrap();
    txn.put(db, b"ab", b"1", WriteFlags::empty()).unwrap();
    txn.put(db, b"ba", b"2", WriteFlags::empty()).unwrap();
    txn.put(db, b"ca", b"3", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut rtxn = env.begin_read().unwrap();
    let db = rtxn.db(Some("rev"), DbFlags::empty()).unwrap();
    let mut cursor = rtxn.cursor(db).unwrap();
    // Compared from the last byte backwards: "ba" < "ca" < "ab".
    let mut keys = Vec::new();
    let mut entry = cursor.get(None, None, CursorOp::First).unwrap();
    while let Some((key, _)) = entry {
        keys.push(key.to_vec());
        entry = cursor.get(None, None, CursorOp::Next).unwrap();
    }
    assert_eq!(keys, vec![b"ba".to_vec(), b"ca".to_vec(), b"ab".to_vec()]);
}

#[test]
fn cursor_borrows_stay_valid_while_it_moves() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    fill_numbered(&env, 20);

    let rtxn = env.begin_read().unwrap();
    let mut cursor: Cursor<'_> = rtxn.cursor(Dbi::MAIN).unwrap();
    let (first_key, _) = cursor.first().unwrap().unwrap();
    let (second_key, _) = cursor.next().unwrap().unwrap();

    // Both borrows point into the transaction's pages, not the cursor.
    assert_eq!(first_key, b"k000");
    assert_eq!(second_key, b"k001");
}
