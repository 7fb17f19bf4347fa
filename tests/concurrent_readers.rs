//! Readers and the writer running in parallel threads: snapshots must
//! stay internally consistent while commits land underneath them.

use std::sync::atomic::{AtomicBool, Ordering};

use mapledb::{Dbi, Environment, WriteFlags};

#[test]
fn readers_see_consistent_snapshots_under_writes() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::builder()
        .map_size(64 << 20)
        .open(dir.path())
        .unwrap();

    // Seed: a generation counter plus a block of keys stamped with it.
    let mut txn = env.begin_write().unwrap();
    txn.put(Dbi::MAIN, b"generation", &0u64.to_le_bytes(), WriteFlags::empty())
        .unwrap();
    for i in 0..50u32 {
        txn.put(
            Dbi::MAIN,
            format!("k{:02}", i).as_bytes(),
            &0u64.to_le_bytes(),
            WriteFlags::empty(),
        )
        .unwrap();
    }
    txn.commit().unwrap();

    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    let rtxn = env.begin_read().unwrap();
                    let generation = rtxn.get(Dbi::MAIN, b"generation").unwrap().unwrap();
                    let generation = u64::from_le_bytes(generation.try_into().unwrap());

                    // Every key must carry the snapshot's generation,
                    // no matter how many commits land meanwhile.
                    for i in 0..50u32 {
                        let value = rtxn
                            .get(Dbi::MAIN, format!("k{:02}", i).as_bytes())
                            .unwrap()
                            .unwrap();
                        assert_eq!(
                            u64::from_le_bytes(value.try_into().unwrap()),
                            generation,
                            "snapshot mixed two generations"
                        );
                    }
                }
            });
        }

        for generation in 1..=20u64 {
            let mut txn = env.begin_write().unwrap();
            txn.put(
                Dbi::MAIN,
                b"generation",
                &generation.to_le_bytes(),
                WriteFlags::empty(),
            )
            .unwrap();
            for i in 0..50u32 {
                txn.put(
                    Dbi::MAIN,
                    format!("k{:02}", i).as_bytes(),
                    &generation.to_le_bytes(),
                    WriteFlags::empty(),
                )
                .unwrap();
            }
            txn.commit().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
    });

    let rtxn = env.begin_read().unwrap();
    let generation = rtxn.get(Dbi::MAIN, b"generation").unwrap().unwrap();
    assert_eq!(u64::from_le_bytes(generation.try_into().unwrap()), 20);
}

#[test]
fn writers_in_threads_serialize_on_the_mutex() {
    let dir = tempfile::tempdir().unwrap();
    let env = Environment::builder()
        .map_size(32 << 20)
        .open(dir.path())
        .unwrap();

    std::thread::scope(|scope| {
        for t in 0..4u32 {
            let env = &env;
            scope.spawn(move || {
                for i in 0..10u32 {
                    let mut txn = env.begin_write().unwrap();
                    txn.put(
                        Dbi::MAIN,
                        format!("t{}-{:02}", t, i).as_bytes(),
                        &[1u8; 32],
                        WriteFlags::empty(),
                    )
                    .unwrap();
                    txn.commit().unwrap();
                }
            });
        }
    });

    let stat = env.stat().unwrap();
    assert_eq!(stat.entries, 40);

    let rtxn = env.begin_read().unwrap();
    for t in 0..4u32 {
        for i in 0..10u32 {
            assert!(rtxn
                .get(Dbi::MAIN, format!("t{}-{:02}", t, i).as_bytes())
                .unwrap()
                .is_some());
        }
    }
}
