//! Credential-store properties exercised the way independent administrative
//! processes would hit them: several writers contending on one directory,
//! and recovery from a replace interrupted at its worst moment.

use std::path::Path;
use std::time::Duration;

use gitgate::store::{KeyStore, LockFile, PublicKey, StoreError};

fn store_in(dir: &Path) -> KeyStore {
    std::fs::create_dir_all(dir.join("keys")).unwrap();
    std::fs::create_dir_all(dir.join("run")).unwrap();
    KeyStore::new(dir, Path::new("/usr/local/bin/gitgate-session"))
}

fn key(material: &str) -> PublicKey {
    PublicKey {
        algo: "ssh-rsa".to_string(),
        material: material.to_string(),
    }
}

#[test]
fn concurrent_adds_never_interleave_lines() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(tmp.path());
    let materials = ["QQ==", "QUI=", "QUJD", "QUJDRA==", "aGVsbG8="];

    let handles: Vec<_> = (0..8)
        .map(|writer| {
            let store = store.clone();
            std::thread::spawn(move || {
                for material in materials {
                    store
                        .add(&format!("user{writer}"), &key(material))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let contents = std::fs::read_to_string(store.path()).unwrap();
    let lines: Vec<&str> = contents.lines().collect();

    // Every successful add landed as exactly one whole line.
    assert_eq!(lines.len(), 8 * materials.len());
    for line in &lines {
        assert!(line.starts_with("command=\""), "torn line: {line:?}");
        let token = line.split(' ').next_back().unwrap();
        assert!(token.contains('-'), "torn line: {line:?}");
    }
}

#[test]
fn add_blocks_until_a_held_lock_is_released() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(tmp.path());
    let lock_path = tmp.path().join("run/authorized_keys.lock");

    let held = LockFile::acquire(&lock_path).unwrap();
    let writer = std::thread::spawn({
        let store = store.clone();
        move || store.add("alice", &key("aGVsbG8=")).unwrap()
    });

    // The writer must not get through while the lock is held.
    std::thread::sleep(Duration::from_millis(200));
    assert!(!store.path().exists());

    drop(held);
    writer.join().unwrap();
    assert_eq!(store.scan().unwrap().len(), 1);
}

#[test]
fn remove_keeps_every_other_line_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(tmp.path());
    let materials = ["QQ==", "QUI=", "QUJD", "QUJDRA==", "aGVsbG8="];

    let mut fingerprints = Vec::new();
    for (i, material) in materials.iter().enumerate() {
        fingerprints.push(store.add(&format!("user{i}"), &key(material)).unwrap());
    }
    let before: Vec<String> = std::fs::read_to_string(store.path())
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();

    store.remove("user2", &fingerprints[2]).unwrap();

    let after: Vec<String> = std::fs::read_to_string(store.path())
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();

    assert_eq!(after.len(), before.len() - 1);
    let expected: Vec<&String> = before
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 2)
        .map(|(_, line)| line)
        .collect();
    assert_eq!(after.iter().collect::<Vec<_>>(), expected);
}

#[test]
fn remove_not_found_is_a_byte_for_byte_no_op() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(tmp.path());

    store.add("alice", &key("aGVsbG8=")).unwrap();
    store.add("bob", &key("d29ybGQ=")).unwrap();
    let before = std::fs::read(store.path()).unwrap();

    let err = store.remove("carol", "0123456789abcdef").unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
    assert_eq!(std::fs::read(store.path()).unwrap(), before);
}

#[test]
fn crash_between_unlink_and_rename_is_recoverable() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(tmp.path());

    store.add("alice", &key("aGVsbG8=")).unwrap();
    store.add("bob", &key("d29ybGQ=")).unwrap();
    let pre_removal = std::fs::read(store.path()).unwrap();

    // Replay the replace up to its most exposed point: the backup link
    // exists, the original has been unlinked, and the filtered replacement
    // has not yet been renamed into place.
    let backup = tmp.path().join("keys/authorized_keys.bak");
    let staging = tmp.path().join("keys/authorized_keys.new");
    std::fs::hard_link(store.path(), &backup).unwrap();
    std::fs::write(&staging, "filtered-but-unrenamed\n").unwrap();
    std::fs::remove_file(store.path()).unwrap();

    store.recover().unwrap();

    assert_eq!(std::fs::read(store.path()).unwrap(), pre_removal);
    assert!(!backup.exists());
    assert!(!staging.exists());

    // The healed store is fully operational.
    let records = store.scan().unwrap();
    assert_eq!(records.len(), 2);
    store.remove("alice", &records[0].fingerprint).unwrap();
    assert_eq!(store.scan().unwrap().len(), 1);
}

#[test]
fn removing_one_of_a_users_keys_leaves_the_others() {
    let tmp = tempfile::tempdir().unwrap();
    let store = store_in(tmp.path());

    let fp_old = store.add("alice", &key("aGVsbG8=")).unwrap();
    let fp_new = store.add("alice", &key("d29ybGQ=")).unwrap();
    assert_ne!(fp_old, fp_new);

    store.remove("alice", &fp_old).unwrap();

    let records = store.scan().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user, "alice");
    assert_eq!(records[0].fingerprint, fp_new);
}
