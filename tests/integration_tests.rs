// Integration tests for the flush pipeline of a standalone node

use chaindb::memtable::{InternalKey, ValueType};
use chaindb::sstable::SSTableReader;
use chaindb::{Error, Node, Options, DEFAULT_COLUMN_FAMILY};
use rand::seq::SliceRandom;
use std::path::Path;
use tempfile::TempDir;

fn options() -> Options {
    let _ = env_logger::builder().is_test(true).try_init();
    Options::default().slot_pool_size(16).target_file_size(64 * 1024)
}

fn read_table(dir: &Path, file_number: u64) -> Vec<(InternalKey, Vec<u8>)> {
    let reader = SSTableReader::open(dir.join(format!("{:06}.sst", file_number))).unwrap();
    reader
        .entries()
        .unwrap()
        .into_iter()
        .map(|(k, v)| (InternalKey::decode(&k).unwrap(), v))
        .collect()
}

#[test]
fn test_flush_writes_one_sorted_file() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(dir.path(), options()).unwrap();

    let mut keys: Vec<u32> = (0..500).collect();
    keys.shuffle(&mut rand::rng());
    for k in &keys {
        node.put(format!("key{:05}", k).as_bytes(), format!("value{}", k).as_bytes()).unwrap();
    }

    let summary = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    let identity = summary.identity.clone().unwrap();
    assert_eq!(identity.num_entries, 500);
    assert_eq!(identity.checksum_func_name, "crc32");
    assert_eq!(summary.stats.output_entries, 500);

    let entries = read_table(dir.path(), summary.file_number);
    assert_eq!(entries.len(), 500);
    for (i, (key, value)) in entries.iter().enumerate() {
        assert_eq!(key.user_key(), format!("key{:05}", i).as_bytes());
        assert_eq!(value, format!("value{}", i).as_bytes());
    }

    // Boundary keys are the true min and max of the output.
    assert_eq!(InternalKey::decode(&identity.smallest_key).unwrap().user_key(), b"key00000");
    assert_eq!(InternalKey::decode(&identity.largest_key).unwrap().user_key(), b"key00499");
    assert_eq!(
        std::fs::metadata(dir.path().join(format!("{:06}.sst", summary.file_number))).unwrap().len(),
        identity.file_size
    );
}

#[test]
fn test_overwrites_and_deletes_keep_newest_version() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(dir.path(), options()).unwrap();

    node.put(b"a", b"1").unwrap();
    node.put(b"a", b"2").unwrap();
    node.put(b"b", b"1").unwrap();
    node.delete(b"b").unwrap();

    let summary = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    assert_eq!(summary.stats.superseded, 2);

    let entries = read_table(dir.path(), summary.file_number);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0.user_key(), b"a");
    assert_eq!(entries[0].1, b"2");
    assert_eq!(entries[1].0.user_key(), b"b");
    assert_eq!(entries[1].0.value_type(), ValueType::Deletion);
}

#[test]
fn test_snapshot_keeps_older_version() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(dir.path(), options()).unwrap();

    node.put(b"a", b"old").unwrap();
    let snapshot = node.snapshot();
    node.put(b"a", b"new").unwrap();

    let summary = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    let entries = read_table(dir.path(), summary.file_number);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].1, b"new");
    assert_eq!(entries[1].1, b"old");
    assert_eq!(entries[1].0.sequence(), snapshot.sequence());
}

#[test]
fn test_range_deletion_drops_covered_entries() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(dir.path(), options()).unwrap();

    for k in [b"a", b"b", b"c", b"d"] {
        node.put(k, b"v").unwrap();
    }
    node.delete_range(DEFAULT_COLUMN_FAMILY, b"b", b"d").unwrap();
    node.put(b"c", b"after").unwrap();

    let summary = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    assert_eq!(summary.stats.range_deleted, 1);
    assert_eq!(summary.stats.superseded, 1);
    assert_eq!(summary.identity.as_ref().unwrap().num_range_deletions, 1);

    let keys: Vec<_> = read_table(dir.path(), summary.file_number)
        .into_iter()
        .map(|(k, v)| (k.user_key().to_vec(), v))
        .collect();
    assert_eq!(
        keys,
        vec![(b"a".to_vec(), b"v".to_vec()), (b"c".to_vec(), b"after".to_vec()), (b"d".to_vec(), b"v".to_vec())]
    );

    let reader =
        SSTableReader::open(dir.path().join(format!("{:06}.sst", summary.file_number))).unwrap();
    assert_eq!(reader.range_tombstones().len(), 1);
    assert_eq!(reader.range_tombstones()[0].start, b"b");
}

#[test]
fn test_invalid_range_deletion() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(dir.path(), options()).unwrap();
    assert!(matches!(
        node.delete_range(DEFAULT_COLUMN_FAMILY, b"z", b"a"),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_empty_flush_reports_zero_size() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(dir.path(), options()).unwrap();

    let summary = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    assert_eq!(summary.file_size, 0);
    assert_eq!(summary.input_count, 1);
    assert!(summary.identity.is_none());

    let tables = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "sst"))
        .count();
    assert_eq!(tables, 0);

    // The generation was consumed and its slot released.
    node.put(b"k", b"v").unwrap();
    let next = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    assert_eq!(next.generation, 1);
    assert_eq!(node.slots(DEFAULT_COLUMN_FAMILY).unwrap().free_slots(), 15);
}

#[test]
fn test_consecutive_flushes_use_consecutive_generations() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(dir.path(), options()).unwrap();

    let mut file_numbers = Vec::new();
    for round in 0..5u32 {
        node.put(format!("key{}", round).as_bytes(), b"v").unwrap();
        let summary = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
        assert_eq!(summary.generation, round as u64);
        file_numbers.push(summary.file_number);
    }
    assert_eq!(file_numbers, vec![1, 2, 3, 4, 5]);

    let files = node.live_files(DEFAULT_COLUMN_FAMILY).unwrap();
    let generations: Vec<_> = files.iter().map(|f| f.generation).collect();
    assert_eq!(generations, vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_column_families_have_separate_file_numbers() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(dir.path(), options().column_family("meta")).unwrap();
    let meta = node.column_family("meta").unwrap();

    node.put(b"k", b"v").unwrap();
    node.put_cf(meta, b"k", b"v").unwrap();

    let default_file = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap().file_number;
    let meta_file = node.flush(meta).unwrap().unwrap().file_number;
    assert_eq!(default_file, 1);
    assert_eq!(meta_file, 17);
}

#[test]
fn test_pool_exhaustion_is_backpressure() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(dir.path(), options().slot_pool_size(2)).unwrap();

    for round in 0..2 {
        node.put(format!("key{}", round).as_bytes(), b"v").unwrap();
        node.flush(DEFAULT_COLUMN_FAMILY).unwrap();
    }

    node.put(b"key2", b"v").unwrap();
    assert!(matches!(node.flush(DEFAULT_COLUMN_FAMILY), Err(Error::PoolExhausted(_))));
    assert_eq!(node.live_files(DEFAULT_COLUMN_FAMILY).unwrap().len(), 2);

    // Compaction removing the oldest file frees its slot.
    node.release_file(DEFAULT_COLUMN_FAMILY, 1).unwrap();
    let summary = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    assert_eq!(summary.file_number, 1);
    assert_eq!(read_table(dir.path(), 1)[0].0.user_key(), b"key2");
}

#[test]
fn test_paranoid_checks_pass_on_good_files() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(dir.path(), options().paranoid_file_checks(true)).unwrap();

    for i in 0..200 {
        node.put(format!("key{:04}", i).as_bytes(), &[b'v'; 100]).unwrap();
    }
    let summary = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    assert!(node.verify_file(DEFAULT_COLUMN_FAMILY, summary.file_number).is_ok());
    assert!(node.flagged_files(DEFAULT_COLUMN_FAMILY).unwrap().is_empty());
}

#[test]
fn test_marked_for_compaction() {
    let dir = TempDir::new().unwrap();
    let node =
        Node::open(dir.path(), options().mark_for_compaction_deletion_ratio(0.5)).unwrap();

    node.put(b"a", b"v").unwrap();
    node.delete(b"b").unwrap();
    node.delete(b"c").unwrap();
    let summary = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    assert!(summary.identity.unwrap().marked_for_compaction);
}

#[test]
fn test_blob_files_hold_large_values() {
    let dir = TempDir::new().unwrap();
    let node = Node::open(dir.path(), options().blob_files(128)).unwrap();

    node.put(b"small", b"v").unwrap();
    node.put(b"large", &[b'x'; 1024]).unwrap();
    let summary = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    assert_eq!(summary.stats.blobs_written, 1);
    assert!(dir.path().join(format!("{:06}.blob", summary.file_number)).exists());

    let entries = read_table(dir.path(), summary.file_number);
    assert_eq!(entries[0].0.value_type(), ValueType::BlobIndex);
    assert_eq!(entries[1].0.value_type(), ValueType::Value);
}
