// Chain replication tests: a primary, a middle node and a tail in one process

use chaindb::ship::{InProcessTransport, RetryPolicy, ShipTransport};
use chaindb::slots::SlotState;
use chaindb::{ChainConfig, Error, Node, Options, Result, Role, ShipAck, ShipRequest, DEFAULT_COLUMN_FAMILY};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn options(chain: ChainConfig, pool_size: usize) -> Options {
    let _ = env_logger::builder().is_test(true).try_init();
    Options::default()
        .slot_pool_size(pool_size)
        .target_file_size(64 * 1024)
        .retry(RetryPolicy::immediate(3))
        .chain(chain)
}

/// Records the generation order of everything it delivers.
struct RecordingTransport {
    inner: Arc<InProcessTransport>,
    delivered: Mutex<Vec<(u64, u64)>>,
}

impl ShipTransport for RecordingTransport {
    fn ship(&self, target: &str, request: &ShipRequest) -> Result<ShipAck> {
        let ack = self.inner.ship(target, request)?;
        self.delivered.lock().push((request.generation, request.file_number));
        Ok(ack)
    }
}

struct Chain {
    _dir: TempDir,
    primary: Node,
    middle: Arc<Node>,
    tail: Arc<Node>,
    recorder: Arc<RecordingTransport>,
}

fn chain() -> Chain {
    chain_with_pool(16)
}

fn chain_with_pool(pool_size: usize) -> Chain {
    let dir = TempDir::new().unwrap();
    let transport = InProcessTransport::new();

    let tail = Arc::new(
        Node::open(dir.path().join("tail"), options(ChainConfig::tail("tail", "middle:1", 3), pool_size))
            .unwrap(),
    );
    transport.register("tail:1", &tail);

    let middle = Arc::new(
        Node::open_with_transport(
            dir.path().join("middle"),
            options(ChainConfig::middle("middle", "primary:1", "tail:1", 3), pool_size),
            transport.clone(),
        )
        .unwrap(),
    );
    transport.register("middle:1", &middle);

    let recorder =
        Arc::new(RecordingTransport { inner: transport, delivered: Mutex::new(Vec::new()) });
    let primary = Node::open_with_transport(
        dir.path().join("primary"),
        options(ChainConfig::primary("primary", "middle:1", 3), pool_size),
        recorder.clone(),
    )
    .unwrap();

    Chain { _dir: dir, primary, middle, tail, recorder }
}

fn table_bytes(dir: &Path, file_number: u64) -> Vec<u8> {
    std::fs::read(dir.join(format!("{:06}.sst", file_number))).unwrap()
}

#[test]
fn test_flush_reaches_every_node() {
    let chain = chain();
    for i in 0..100 {
        chain.primary.put(format!("key{:03}", i).as_bytes(), b"value").unwrap();
    }

    let summary = chain.primary.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    let ack = summary.ack.clone().unwrap();
    assert_eq!(ack.node_id, "middle");
    assert!(ack.chain_durable);
    assert!(summary.chain_durable);

    // Every node holds the same bytes under the same file number.
    let primary_bytes = table_bytes(chain.primary.path(), summary.file_number);
    assert_eq!(table_bytes(chain.middle.path(), summary.file_number), primary_bytes);
    assert_eq!(table_bytes(chain.tail.path(), summary.file_number), primary_bytes);

    let identity = summary.identity.as_ref().unwrap();
    for node in [&chain.primary, chain.middle.as_ref(), chain.tail.as_ref()] {
        let files = node.live_files(DEFAULT_COLUMN_FAMILY).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].identity.file_number, identity.file_number);
        assert_eq!(files[0].identity.file_checksum, identity.file_checksum);
        assert_eq!(files[0].identity.num_entries, 100);
        assert_eq!(files[0].identity.largest_key, identity.largest_key);
        assert!(files[0].chain_durable);
        assert_eq!(
            node.slots(DEFAULT_COLUMN_FAMILY).unwrap().state(0),
            Some(SlotState::Committed { generation: 0, acknowledged: true })
        );
    }

    let stats = chain.primary.ship_stats().unwrap();
    assert_eq!(stats.shipped, 1);
    assert_eq!(stats.bytes_shipped, primary_bytes.len() as u64);
    assert_eq!(chain.middle.ship_stats().unwrap().shipped, 1);
    assert!(chain.tail.ship_stats().is_none());
}

#[test]
fn test_generations_ship_in_order_with_identical_file_numbers() {
    let chain = chain();
    let mut expected = Vec::new();
    for round in 0..6u64 {
        chain.primary.put(format!("key{}", round).as_bytes(), b"v").unwrap();
        let summary = chain.primary.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
        expected.push((round, summary.file_number));
    }

    assert_eq!(*chain.recorder.delivered.lock(), expected);
    let tail_files: Vec<_> = chain
        .tail
        .live_files(DEFAULT_COLUMN_FAMILY)
        .unwrap()
        .into_iter()
        .map(|f| (f.generation, f.identity.file_number))
        .collect();
    assert_eq!(tail_files, expected);
    assert!(chain.tail.sequence() >= 6);
}

#[test]
fn test_empty_generation_does_not_block_later_ships() {
    let chain = chain();

    let empty = chain.primary.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    assert_eq!(empty.file_size, 0);
    assert!(empty.ack.is_none());

    chain.primary.put(b"k", b"v").unwrap();
    let summary = chain.primary.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    assert_eq!(summary.generation, 1);
    assert!(summary.ack.is_some());
    assert_eq!(chain.tail.live_files(DEFAULT_COLUMN_FAMILY).unwrap()[0].generation, 1);
}

#[test]
fn test_replicas_reject_writes() {
    let chain = chain();
    assert_eq!(chain.middle.role(), Role::Middle);
    assert!(matches!(chain.middle.put(b"k", b"v"), Err(Error::InvalidState(_))));
    assert!(matches!(chain.tail.delete(b"k"), Err(Error::InvalidState(_))));
    assert!(chain.primary.compaction_allowed());
    assert!(!chain.middle.compaction_allowed());
}

#[test]
fn test_redelivery_is_acknowledged_without_rewrite() {
    let chain = chain();
    chain.primary.put(b"k", b"v").unwrap();
    let summary = chain.primary.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();

    let payload = table_bytes(chain.primary.path(), summary.file_number);
    let request = ShipRequest::new(DEFAULT_COLUMN_FAMILY, 0, summary.file_number, payload.into());
    let ack = chain.tail.install_shipped(request).unwrap();
    assert!(ack.chain_durable);
    assert_eq!(chain.tail.live_files(DEFAULT_COLUMN_FAMILY).unwrap().len(), 1);
}

#[test]
fn test_diverging_file_number_rejected() {
    let chain = chain();
    chain.primary.put(b"k", b"v").unwrap();
    let summary = chain.primary.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();

    let payload = table_bytes(chain.primary.path(), summary.file_number);
    let request = ShipRequest::new(DEFAULT_COLUMN_FAMILY, 1, 7, payload.into());
    let err = chain.tail.install_shipped(request).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_corrupted_payload_rejected() {
    let chain = chain();
    let mut request = ShipRequest::new(DEFAULT_COLUMN_FAMILY, 0, 1, bytes::Bytes::from_static(b"table"));
    request.checksum ^= 1;
    assert!(matches!(chain.tail.install_shipped(request), Err(Error::ChecksumMismatch { .. })));
    assert!(chain.tail.live_files(DEFAULT_COLUMN_FAMILY).unwrap().is_empty());
    assert_eq!(chain.tail.slots(DEFAULT_COLUMN_FAMILY).unwrap().free_slots(), 16);
}

#[test]
fn test_unreadable_payload_releases_slot() {
    let chain = chain();
    let request = ShipRequest::new(DEFAULT_COLUMN_FAMILY, 0, 1, bytes::Bytes::from_static(b"not a table"));
    assert!(chain.tail.install_shipped(request).is_err());
    assert_eq!(chain.tail.slots(DEFAULT_COLUMN_FAMILY).unwrap().free_slots(), 16);
    assert!(!chain.tail.path().join("000001.sst").exists());
}

#[test]
fn test_reused_slot_replaces_released_file_downstream() {
    let chain = chain_with_pool(2);
    for round in 0..2 {
        chain.primary.put(format!("key{}", round).as_bytes(), b"v").unwrap();
        chain.primary.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    }

    // Compaction on the primary frees file 1; generation 2 reuses its slot.
    chain.primary.release_file(DEFAULT_COLUMN_FAMILY, 1).unwrap();
    chain.primary.put(b"key2", b"v").unwrap();
    let summary = chain.primary.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    assert_eq!((summary.generation, summary.file_number), (2, 1));
    assert!(summary.chain_durable);

    let primary_bytes = table_bytes(chain.primary.path(), 1);
    for node in [&chain.primary, chain.middle.as_ref(), chain.tail.as_ref()] {
        let files: Vec<_> = node
            .live_files(DEFAULT_COLUMN_FAMILY)
            .unwrap()
            .into_iter()
            .map(|f| (f.generation, f.identity.file_number))
            .collect();
        assert_eq!(files, vec![(1, 2), (2, 1)]);
        assert_eq!(table_bytes(node.path(), 1), primary_bytes);
        assert_eq!(
            node.slots(DEFAULT_COLUMN_FAMILY).unwrap().state(0),
            Some(SlotState::Committed { generation: 2, acknowledged: true })
        );
    }
    assert!(chain.primary.chain_health().is_consistent());

    // The pool keeps cycling once every slot has been reused.
    chain.primary.release_file(DEFAULT_COLUMN_FAMILY, 2).unwrap();
    chain.primary.put(b"key3", b"v").unwrap();
    let summary = chain.primary.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
    assert_eq!((summary.generation, summary.file_number), (3, 2));
    let tail_files: Vec<_> =
        chain.tail.live_files(DEFAULT_COLUMN_FAMILY).unwrap().into_iter().map(|f| f.generation).collect();
    assert_eq!(tail_files, vec![2, 3]);
}
