//! Write-ahead log durability properties.

mod common;

use common::open_engine_at;
use l3kv::storage::wal::{BatchOp, WriteAheadLog};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::TempDir;

fn truncate_file(path: &Path, drop_bytes: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len - drop_bytes).unwrap();
}

// ============================================================================
// Round-trip
// ============================================================================

#[test]
fn restart_is_observationally_equivalent() {
    let dir = TempDir::new().unwrap();

    let (root_before, age_before) = {
        let engine = open_engine_at(&dir, 1, "node.wal");
        for i in 0..50 {
            engine
                .put(&format!("user:{i}"), format!("{{\"age\":{i}}}").as_bytes())
                .unwrap();
        }
        engine.patch_int("user:7", "age", 70).unwrap();
        engine.patch_str("user:8", "name", "octavia").unwrap();
        engine.del("user:9").unwrap();
        engine.flush().unwrap();
        (engine.root_hash(), engine.get("user:7").get_i64("age"))
    };

    let engine = open_engine_at(&dir, 1, "node.wal");
    assert_eq!(engine.root_hash(), root_before);
    assert_eq!(engine.get("user:7").get_i64("age"), age_before);
    assert_eq!(engine.get("user:8").get_str("name").as_deref(), Some("octavia"));
    assert!(engine.get("user:9").is_empty());
    assert!(engine.is_tombstoned("user:9"));
    for i in 0..50 {
        if i == 7 || i == 9 {
            continue;
        }
        assert_eq!(engine.get(&format!("user:{i}")).get_i64("age"), Some(i));
    }
}

// ============================================================================
// Corruption handling
// ============================================================================

#[test]
fn bit_flip_cuts_recovery_at_the_flipped_record() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("corrupt.wal");

    let record_len;
    {
        let wal = WriteAheadLog::open(&path, |_, _, _| {}).unwrap();
        // Fixed-size records so offsets are predictable.
        record_len = 11 + 4 + 4;
        for i in 0..10u32 {
            wal.append(
                l3kv::storage::wal::WalOp::Put,
                format!("k{i:03}").as_bytes(),
                b"val!",
            )
            .unwrap();
        }
        wal.flush().unwrap();
    }

    // Flip one payload bit of record 6; records 0-5 must survive, 6-9 must
    // not.
    let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let flip_at = 6 * record_len + 11 + 4; // first payload byte of record 6
    file.seek(SeekFrom::Start(flip_at as u64)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0x01;
    file.seek(SeekFrom::Start(flip_at as u64)).unwrap();
    file.write_all(&byte).unwrap();
    drop(file);

    let mut recovered = Vec::new();
    let _wal = WriteAheadLog::open(&path, |_, key, _| {
        recovered.push(String::from_utf8_lossy(key).into_owned());
    })
    .unwrap();

    assert_eq!(
        recovered,
        (0..6).map(|i| format!("k{i:03}")).collect::<Vec<_>>()
    );
}

#[test]
fn crash_truncation_recovers_the_prefix() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("node.wal");

    // 100 puts, then a simulated crash that loses the last 3 bytes.
    {
        let engine = open_engine_at(&dir, 1, "node.wal");
        for i in 0..100 {
            engine
                .put(&format!("user:{i}"), format!("{{\"n\":{i}}}").as_bytes())
                .unwrap();
        }
        engine.flush().unwrap();
    }
    truncate_file(&path, 3);

    let engine = open_engine_at(&dir, 1, "node.wal");
    for i in 0..99 {
        assert_eq!(engine.get(&format!("user:{i}")).get_i64("n"), Some(i));
    }
    // The torn final batch contributed nothing.
    assert!(engine.get("user:99").is_empty());
    assert!(engine.get("user:99:meta").is_empty());

    // The recovered root equals a fresh engine's root after the same 99
    // operations.
    let reference_dir = TempDir::new().unwrap();
    let reference = open_engine_at(&reference_dir, 1, "node.wal");
    for i in 0..99 {
        reference
            .put(&format!("user:{i}"), format!("{{\"n\":{i}}}").as_bytes())
            .unwrap();
    }
    assert_eq!(engine.root_hash(), reference.root_hash());
}

#[test]
fn torn_batch_applies_no_inner_operation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("batch.wal");

    {
        let wal = WriteAheadLog::open(&path, |_, _, _| {}).unwrap();
        wal.append_batch(&[
            BatchOp::put(b"a".as_slice(), b"1".as_slice()),
            BatchOp::put(b"b".as_slice(), b"2".as_slice()),
        ])
        .unwrap();
        wal.append_batch(&[
            BatchOp::put(b"c".as_slice(), b"3".as_slice()),
            BatchOp::put(b"d".as_slice(), b"4".as_slice()),
        ])
        .unwrap();
        wal.flush().unwrap();
    }

    // Tear the second batch mid-payload.
    truncate_file(&path, 5);

    let mut recovered = Vec::new();
    let _wal = WriteAheadLog::open(&path, |_, key, _| {
        recovered.push(String::from_utf8_lossy(key).into_owned());
    })
    .unwrap();

    // The first batch is fully applied, the torn one not at all.
    assert_eq!(recovered, vec!["a", "b"]);
}

// ============================================================================
// Locking
// ============================================================================

#[test]
fn double_open_is_refused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("locked.wal");

    let _wal = WriteAheadLog::open(&path, |_, _, _| {}).unwrap();
    let second = WriteAheadLog::open(&path, |_, _, _| {});
    assert!(second.is_err());
}

#[test]
fn lock_is_released_on_drop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("relock.wal");

    {
        let _wal = WriteAheadLog::open(&path, |_, _, _| {}).unwrap();
    }
    let reopened = WriteAheadLog::open(&path, |_, _, _| {});
    assert!(reopened.is_ok());
}
