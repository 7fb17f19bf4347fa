//! Round-trip behavior of the core key-value operations, including
//! persistence across reopen and transaction isolation basics.

use mapledb::{DbFlags, Dbi, EnvFlags, Environment, WriteFlags};
use tempfile::TempDir;

fn open_env(dir: &TempDir) -> Environment {
    Environment::builder()
        .map_size(10 << 20)
        .open(dir.path())
        .unwrap()
}

#[test]
fn get_on_empty_env_finds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    let txn = env.begin_read().unwrap();
    assert_eq!(txn.get(Dbi::MAIN, b"a").unwrap(), None);
}

#[test]
fn put_get_commit_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let env = open_env(&dir);
        let mut txn = env.begin_write().unwrap();
        assert_eq!(txn.get(Dbi::MAIN, b"a").unwrap(), None);
        txn.put(Dbi::MAIN, b"a", b"1", WriteFlags::empty()).unwrap();
        assert_eq!(txn.get(Dbi::MAIN, b"a").unwrap(), Some(&b"1"[..]));
        txn.commit().unwrap();

        let rtxn = env.begin_read().unwrap();
        assert_eq!(rtxn.get(Dbi::MAIN, b"a").unwrap(), Some(&b"1"[..]));
    }

    let env = open_env(&dir);
    let rtxn = env.begin_read().unwrap();
    assert_eq!(rtxn.get(Dbi::MAIN, b"a").unwrap(), Some(&b"1"[..]));
}

#[test]
fn delete_then_get_finds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    let mut txn = env.begin_write().unwrap();
    txn.put(Dbi::MAIN, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_write().unwrap();
    assert!(txn.del(Dbi::MAIN, b"k", None).unwrap());
    assert!(!txn.del(Dbi::MAIN, b"k", None).unwrap());
    txn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(rtxn.get(Dbi::MAIN, b"k").unwrap(), None);
}

#[test]
fn nooverwrite_rejects_existing_key() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    let mut txn = env.begin_write().unwrap();
    txn.put(Dbi::MAIN, b"k", b"old", WriteFlags::empty()).unwrap();
    let err = txn
        .put(Dbi::MAIN, b"k", b"new", WriteFlags::NOOVERWRITE)
        .unwrap_err();
    assert!(err.to_string().contains("already exists"));

    // The transaction stays usable after a duplicate-key rejection.
    assert_eq!(txn.get(Dbi::MAIN, b"k").unwrap(), Some(&b"old"[..]));
    txn.put(Dbi::MAIN, b"k2", b"v2", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

#[test]
fn same_size_overwrite_does_not_allocate() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    let mut txn = env.begin_write().unwrap();
    txn.put(Dbi::MAIN, b"k", b"aaaa", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    let before = env.info().unwrap().last_pgno;

    let mut txn = env.begin_write().unwrap();
    txn.put(Dbi::MAIN, b"k", b"bbbb", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    let after = env.info().unwrap().last_pgno;

    let rtxn = env.begin_read().unwrap();
    assert_eq!(rtxn.get(Dbi::MAIN, b"k").unwrap(), Some(&b"bbbb"[..]));
    // Copy-on-write of the path still happens, but the overwrite itself
    // must not grow the value storage beyond that.
    assert!(after - before <= 4, "before {} after {}", before, after);
}

#[test]
fn abort_discards_changes() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    let mut txn = env.begin_write().unwrap();
    txn.put(Dbi::MAIN, b"kept", b"1", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let mut txn = env.begin_write().unwrap();
    txn.put(Dbi::MAIN, b"dropped", b"2", WriteFlags::empty()).unwrap();
    txn.abort();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(rtxn.get(Dbi::MAIN, b"kept").unwrap(), Some(&b"1"[..]));
    assert_eq!(rtxn.get(Dbi::MAIN, b"dropped").unwrap(), None);
}

#[test]
fn dropping_write_txn_aborts_it() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    {
        let mut txn = env.begin_write().unwrap();
        txn.put(Dbi::MAIN, b"ghost", b"1", WriteFlags::empty()).unwrap();
        // No commit.
    }

    // The writer mutex was released; the change is gone.
    let mut txn = env.begin_write().unwrap();
    assert_eq!(txn.get(Dbi::MAIN, b"ghost").unwrap(), None);
    txn.put(Dbi::MAIN, b"real", b"2", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

#[test]
fn empty_commit_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    let before = env.info().unwrap().last_txnid;

    let txn = env.begin_write().unwrap();
    txn.commit().unwrap();

    assert_eq!(env.info().unwrap().last_txnid, before);
}

#[test]
fn snapshot_isolation_for_readers() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    let mut txn = env.begin_write().unwrap();
    txn.put(Dbi::MAIN, b"k", b"v1", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let old = env.begin_read().unwrap();

    let mut txn = env.begin_write().unwrap();
    txn.put(Dbi::MAIN, b"k", b"v2", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    // The old snapshot still sees the old value; a new one sees v2.
    assert_eq!(old.get(Dbi::MAIN, b"k").unwrap(), Some(&b"v1"[..]));
    let fresh = env.begin_read().unwrap();
    assert_eq!(fresh.get(Dbi::MAIN, b"k").unwrap(), Some(&b"v2"[..]));
}

#[test]
fn named_databases_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    {
        let env = open_env(&dir);
        let mut txn = env.begin_write().unwrap();
        let authors = txn.db(Some("authors"), DbFlags::CREATE).unwrap();
        txn.put(authors, b"knuth", b"taocp", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();

        let mut rtxn = env.begin_read().unwrap();
        let authors = rtxn.db(Some("authors"), DbFlags::empty()).unwrap();
        assert_eq!(rtxn.get(authors, b"knuth").unwrap(), Some(&b"taocp"[..]));
    }

    let env = open_env(&dir);
    let mut rtxn = env.begin_read().unwrap();
    let authors = rtxn.db(Some("authors"), DbFlags::empty()).unwrap();
    assert_eq!(rtxn.get(authors, b"knuth").unwrap(), Some(&b"taocp"[..]));

    let err = rtxn.db(Some("missing"), DbFlags::empty()).unwrap_err();
    assert!(err.to_string().contains("no database named"));
}

#[test]
fn read_only_env_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    {
        let env = open_env(&dir);
        let mut txn = env.begin_write().unwrap();
        txn.put(Dbi::MAIN, b"k", b"v", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    let env = Environment::builder()
        .flags(EnvFlags::RDONLY)
        .open(dir.path())
        .unwrap();
    assert!(env.begin_write().is_err());

    let rtxn = env.begin_read().unwrap();
    assert_eq!(rtxn.get(Dbi::MAIN, b"k").unwrap(), Some(&b"v"[..]));
}

#[test]
fn key_size_limits_are_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    let mut txn = env.begin_write().unwrap();
    assert!(txn.put(Dbi::MAIN, b"", b"v", WriteFlags::empty()).is_err());
    let oversized = vec![b'x'; 512];
    assert!(txn
        .put(Dbi::MAIN, &oversized, b"v", WriteFlags::empty())
        .is_err());
    let max = vec![b'x'; 511];
    txn.put(Dbi::MAIN, &max, b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    assert_eq!(rtxn.get(Dbi::MAIN, &max).unwrap(), Some(&b"v"[..]));
}

#[test]
fn txnid_increases_across_commits() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    for i in 0..3u64 {
        let mut txn = env.begin_write().unwrap();
        assert_eq!(txn.id(), i + 1);
        txn.put(Dbi::MAIN, b"k", &i.to_le_bytes(), WriteFlags::empty())
            .unwrap();
        txn.commit().unwrap();
        assert_eq!(env.info().unwrap().last_txnid, i + 1);
    }
}

#[test]
fn reader_table_lists_live_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    let mut txn = env.begin_write().unwrap();
    txn.put(Dbi::MAIN, b"k", b"v", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    let rtxn = env.begin_read().unwrap();
    let readers = env.reader_list();
    assert_eq!(readers.len(), 1);
    assert_eq!(readers[0].pid, std::process::id());
    assert_eq!(readers[0].txnid, rtxn.id());

    drop(rtxn);
    let readers = env.reader_list();
    assert_eq!(readers.len(), 1);
    assert_eq!(readers[0].txnid, 0);
}
