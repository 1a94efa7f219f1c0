//! # ChainDb - An LSM-Tree Storage Engine with Chain-Replicated Flushes
//!
//! ChainDb is an embedded key-value storage engine whose flush output is
//! replicated along a chain of nodes. The primary accepts writes and turns
//! its memtables into table files; every file is shipped, byte for byte and
//! with the same file number, to each replica before it counts as durable.
//!
//! ## Architecture
//!
//! - **MemTable**: In-memory sorted structure for recent writes
//! - **Flush**: Merges memtables, applies range deletions and validates the
//!   output while writing one table file per generation
//! - **Slots**: Chain-wide consistent file numbers from a fixed pool, backed
//!   by a recovery log
//! - **Ship**: Aligned buffers and an ordered queue that hand the synced bytes
//!   to the next node
//! - **Chain**: Role policy of primary, middle and tail nodes
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use chaindb::{Node, Options};
//!
//! # fn main() -> Result<(), chaindb::Error> {
//! let node = Node::open("./data", Options::default())?;
//!
//! node.put(b"key1", b"value1")?;
//! node.delete(b"key2")?;
//!
//! if let Some(summary) = node.flush(chaindb::DEFAULT_COLUMN_FAMILY)? {
//!     println!("flushed file {} ({} bytes)", summary.file_number, summary.file_size);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// Module declarations
pub mod chain;
pub mod column_family;
pub mod config;
pub mod error;
pub mod flush;
pub mod memtable;
pub mod ship;
pub mod slots;
pub mod snapshot;
pub mod sstable;
pub mod wal;

// Re-exports
pub use chain::{ChainConfig, ChainHealth, Role};
pub use column_family::{LiveFile, DEFAULT_COLUMN_FAMILY};
pub use config::Options;
pub use error::{Error, Result};
pub use flush::FlushSummary;
pub use ship::{ShipAck, ShipRequest};

use chain::RolePolicy;
use column_family::{ColumnFamily, DEFAULT_COLUMN_FAMILY_NAME};
use flush::job::FlushContext;
use flush::scheduler::{FlushHandle, FlushScheduler};
use flush::{table_path, verify_table, FlushJob};
use parking_lot::Mutex;
use ship::{ShipQueue, ShipReceiver, ShipStats, ShipTransport};
use slots::{ShippedReservation, SlotAllocator, SlotHandle, SlotLog, SlotState};
use snapshot::{Snapshot, SnapshotList};
use sstable::{BufferMode, FileIdentity, SSTableReader, TableFileWriter};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A node of a replication chain.
///
/// A primary accepts writes and flushes them; middle and tail nodes install
/// the files the primary ships. Files are identified by the slot their
/// generation maps to, so every node of the chain holds the same file under
/// the same number.
///
/// # Thread Safety
///
/// `Node` is thread-safe and can be shared across threads using `Arc<Node>`.
/// Wrapping it in an `Arc` is also what lets it receive files through
/// [`ship::InProcessTransport`].
pub struct Node {
    inner: Arc<NodeInner>,
    scheduler: FlushScheduler,
}

struct NodeInner {
    /// Data directory path
    path: PathBuf,

    /// Configuration options
    options: Arc<Options>,

    /// Role policy derived from the chain configuration
    policy: RolePolicy,

    /// Column families, indexed by id
    cfs: Vec<Arc<ColumnFamily>>,

    /// Last sequence number handed out
    sequence: AtomicU64,

    /// Id of the next memtable
    next_memtable_id: AtomicU64,

    /// Live snapshots
    snapshots: Arc<SnapshotList>,

    /// Outbound replication queue, if this node ships onward
    ship: Option<ShipQueue>,

    /// Replication health
    health: Arc<ChainHealth>,

    /// Serializes installs of shipped files
    install_lock: Mutex<()>,

    /// Set on shutdown; running flushes stop at the next entry
    shutting_down: AtomicBool,
}

impl Node {
    /// Opens a node at the specified path.
    ///
    /// A node with a downstream neighbour needs a transport; use
    /// [`Node::open_with_transport`] for it.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The options are invalid
    /// - The directory is missing and `create_if_missing` is off
    /// - The slot recovery log or a committed table file is corrupt
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use chaindb::{Node, Options};
    ///
    /// # fn main() -> Result<(), chaindb::Error> {
    /// let node = Node::open("./my_node", Options::default())?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Self> {
        if options.chain.downstream.is_some() {
            return Err(Error::invalid_argument(format!(
                "node {} ships to {:?} and needs a transport",
                options.chain.node_id, options.chain.downstream
            )));
        }
        Self::open_inner(path.as_ref(), options, None)
    }

    /// Opens a node that ships its files through `transport`.
    pub fn open_with_transport<P: AsRef<Path>>(
        path: P,
        options: Options,
        transport: Arc<dyn ShipTransport>,
    ) -> Result<Self> {
        Self::open_inner(path.as_ref(), options, Some(transport))
    }

    fn open_inner(
        path: &Path,
        options: Options,
        transport: Option<Arc<dyn ShipTransport>>,
    ) -> Result<Self> {
        options.validate()?;
        let path = path.to_path_buf();

        // Step 1: Create directory if not exists
        if !path.exists() {
            if options.create_if_missing {
                std::fs::create_dir_all(&path)?;
            } else {
                return Err(Error::NotFound(format!("Node directory does not exist: {:?}", path)));
            }
        } else if options.error_if_exists && path.join(slots::log::SLOT_LOG_FILE).exists() {
            return Err(Error::AlreadyExists(format!("Node already exists: {:?}", path)));
        }

        let options = Arc::new(options);
        let policy = options.chain.policy();
        let health = Arc::new(ChainHealth::new());

        // Step 2: Replay the slot recovery log
        let (slot_log, records) = SlotLog::open(&path)?;
        let slot_log = Arc::new(slot_log);
        log::info!("Recovered {} slot log records from {:?}", records.len(), slot_log.path());

        // Step 3: Rebuild column families from the committed slots
        let pool_size = options.effective_pool_size();
        let names = std::iter::once(DEFAULT_COLUMN_FAMILY_NAME.to_string())
            .chain(options.column_families.iter().cloned());
        let mut cfs = Vec::new();
        let mut next_memtable_id = 1u64;
        for (id, name) in names.enumerate() {
            let slots = SlotAllocator::new(
                id as u32,
                pool_size,
                options.slot_pool.exhaustion,
                Some(Arc::clone(&slot_log)),
            );
            slots.recover(&records)?;
            let cf = Arc::new(ColumnFamily::new(id as u32, name, slots, next_memtable_id));
            next_memtable_id += 1;
            load_committed_files(&path, &options, &cf)?;
            cfs.push(cf);
        }
        remove_orphan_files(&path, &cfs)?;

        let sequence = cfs.iter().map(|cf| cf.largest_file_sequence()).max().unwrap_or(0);

        // Step 4: Start the outbound queue
        let ship = match (policy.ships_onward(), &options.chain.downstream, transport) {
            (true, Some(target), Some(transport)) => {
                let queue =
                    ShipQueue::new(target.clone(), transport, options.retry.clone(), Arc::clone(&health))?;
                for cf in &cfs {
                    queue.register(cf.id(), cf.slots().next_generation());
                }
                Some(queue)
            }
            (true, Some(target), None) => {
                return Err(Error::invalid_argument(format!(
                    "node ships to {} but no transport was given",
                    target
                )));
            }
            _ => None,
        };

        let inner = Arc::new(NodeInner {
            path,
            options: Arc::clone(&options),
            policy,
            cfs,
            sequence: AtomicU64::new(sequence),
            next_memtable_id: AtomicU64::new(next_memtable_id),
            snapshots: SnapshotList::new(),
            ship,
            health,
            install_lock: Mutex::new(()),
            shutting_down: AtomicBool::new(false),
        });

        // Step 5: Ship what the chain never acknowledged
        inner.resume_shipping()?;

        // Step 6: Start the flush workers
        let weak: Weak<NodeInner> = Arc::downgrade(&inner);
        let scheduler = FlushScheduler::new(
            options.background_threads,
            Arc::new(move |cf_id: u32| match weak.upgrade() {
                Some(inner) => inner.run_flush(cf_id),
                None => Err(Error::Cancelled("node is closed".to_string())),
            }),
        )?;

        log::info!(
            "Opened {} node {} at {:?} (sequence {}, {} column families, {} slots each)",
            policy.role().as_str(),
            options.chain.node_id,
            inner.path,
            sequence,
            inner.cfs.len(),
            pool_size
        );

        Ok(Node { inner, scheduler })
    }

    /// Inserts a key-value pair into the default column family.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` on replicas, which only take shipped files.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_cf(DEFAULT_COLUMN_FAMILY, key, value)
    }

    /// Inserts a key-value pair into column family `cf_id`.
    pub fn put_cf(&self, cf_id: u32, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(cf_id, |memtable, seq| memtable.put(key, value, seq))
    }

    /// Deletes a key from the default column family.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.delete_cf(DEFAULT_COLUMN_FAMILY, key)
    }

    /// Deletes a key from column family `cf_id`.
    pub fn delete_cf(&self, cf_id: u32, key: &[u8]) -> Result<()> {
        self.write(cf_id, |memtable, seq| memtable.delete(key, seq))
    }

    /// Deletes every key in `[start, end)` of column family `cf_id`.
    pub fn delete_range(&self, cf_id: u32, start: &[u8], end: &[u8]) -> Result<()> {
        if start >= end {
            return Err(Error::invalid_argument("range deletion needs start < end"));
        }
        self.write(cf_id, |memtable, seq| memtable.delete_range(start, end, seq))
    }

    fn write(&self, cf_id: u32, apply: impl FnOnce(&memtable::MemTable, u64)) -> Result<()> {
        let inner = &self.inner;
        if !inner.policy.produces_flush_output() {
            return Err(Error::invalid_state(format!(
                "{} node {} does not accept writes",
                inner.policy.role().as_str(),
                inner.options.chain.node_id
            )));
        }
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Cancelled("node is shutting down".to_string()));
        }
        let cf = inner.cf(cf_id)?;

        // Write stall: too many memtables wait for a flush.
        if cf.memtable_count() > inner.options.max_write_buffer_number {
            log::warn!(
                "cf {} holds {} memtables (limit {}), flushing before the write",
                cf.name(),
                cf.memtable_count(),
                inner.options.max_write_buffer_number
            );
            inner.run_flush(cf_id)?;
        }

        cf.write(|memtable| {
            let seq = inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            apply(memtable, seq);
        });

        let limit = inner.options.memtable_size;
        if cf.write(|memtable| memtable.approximate_size()) >= limit
            && cf.freeze_if_full(inner.next_memtable_id.fetch_add(1, Ordering::SeqCst), limit)
        {
            if let Err(e) = self.scheduler.schedule(cf_id) {
                log::warn!("Could not schedule flush of cf {}: {}", cf.name(), e);
            }
        }
        Ok(())
    }

    /// Pins the current sequence number. Flushes keep the data visible at
    /// that sequence until the snapshot is dropped.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshots.acquire(self.inner.sequence.load(Ordering::SeqCst))
    }

    /// Last sequence number written or installed.
    pub fn sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::SeqCst)
    }

    /// Flushes column family `cf_id` on the calling thread.
    ///
    /// The active memtable is frozen even if it is empty, so a flush always
    /// runs; a flush without output reports a file size of 0. Returns `None`
    /// only if another flush already picked every waiting memtable.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use chaindb::{Node, Options, DEFAULT_COLUMN_FAMILY};
    /// # fn main() -> Result<(), chaindb::Error> {
    /// # let node = Node::open("./data", Options::default())?;
    /// node.put(b"key", b"value")?;
    /// let summary = node.flush(DEFAULT_COLUMN_FAMILY)?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn flush(&self, cf_id: u32) -> Result<Option<FlushSummary>> {
        let inner = &self.inner;
        if !inner.policy.produces_flush_output() {
            return Err(Error::invalid_state(format!(
                "{} nodes install shipped files instead of flushing",
                inner.policy.role().as_str()
            )));
        }
        let cf = inner.cf(cf_id)?;
        cf.freeze(inner.next_memtable_id.fetch_add(1, Ordering::SeqCst), true);
        inner.run_flush(cf_id)
    }

    /// Flushes every column family that holds data.
    pub fn flush_all(&self) -> Result<Vec<FlushSummary>> {
        let inner = &self.inner;
        let mut summaries = Vec::new();
        for cf in &inner.cfs {
            cf.freeze(inner.next_memtable_id.fetch_add(1, Ordering::SeqCst), false);
            if cf.pending_count() > 0 {
                summaries.extend(inner.run_flush(cf.id())?);
            }
        }
        Ok(summaries)
    }

    /// Freezes the active memtable of `cf_id` and flushes it in the background.
    pub fn schedule_flush(&self, cf_id: u32) -> Result<FlushHandle> {
        let inner = &self.inner;
        if !inner.policy.produces_flush_output() {
            return Err(Error::invalid_state("replicas do not flush"));
        }
        let cf = inner.cf(cf_id)?;
        cf.freeze(inner.next_memtable_id.fetch_add(1, Ordering::SeqCst), false);
        self.scheduler.schedule(cf_id)
    }

    /// Installs a file shipped by the upstream node and acknowledges it.
    ///
    /// Middle nodes relay the file downstream and acknowledge only once the
    /// downstream node did. A file that is already installed is acknowledged
    /// again without being rewritten.
    pub fn install_shipped(&self, request: ShipRequest) -> Result<ShipAck> {
        self.inner.install_shipped(request)
    }

    /// Removes a file from column family `cf_id` and frees its slot, as
    /// compaction does once a file is no longer needed.
    pub fn release_file(&self, cf_id: u32, file_number: u64) -> Result<()> {
        let inner = &self.inner;
        let cf = inner.cf(cf_id)?;
        cf.slots().release_file(file_number)?;
        cf.remove_file(file_number);
        sstable::writer::remove_if_exists(&table_path(&inner.path, &inner.options, file_number))?;
        sstable::writer::remove_if_exists(&inner.path.join(flush::blob::blob_file_name(file_number)))?;
        log::info!("Released file {} of cf {}", file_number, cf.name());
        Ok(())
    }

    /// Re-reads a file and checks it against what was recorded when it was
    /// written. A file that fails the check is moved to the flagged set and
    /// `Corruption` is returned; the file itself stays on disk.
    pub fn verify_file(&self, cf_id: u32, file_number: u64) -> Result<()> {
        let inner = &self.inner;
        let cf = inner.cf(cf_id)?;
        let file = cf
            .file(file_number)
            .ok_or_else(|| Error::not_found(format!("file {} is not in cf {}", file_number, cf_id)))?;
        let path = table_path(&inner.path, &inner.options, file_number);

        let result = match &file.digest {
            Some(digest) => verify_table(&path, digest, inner.options.check_flush_key_order),
            None => verify_checksum(&path, &file.identity),
        };
        if let Err(e) = result {
            cf.flag_file(file);
            return Err(e);
        }
        Ok(())
    }

    /// Live files of column family `cf_id`, in generation order.
    pub fn live_files(&self, cf_id: u32) -> Result<Vec<LiveFile>> {
        Ok(self.inner.cf(cf_id)?.live_files())
    }

    /// Files of column family `cf_id` kept on disk but flagged for inspection.
    pub fn flagged_files(&self, cf_id: u32) -> Result<Vec<LiveFile>> {
        Ok(self.inner.cf(cf_id)?.flagged_files())
    }

    /// Id of the column family called `name`.
    pub fn column_family(&self, name: &str) -> Option<u32> {
        self.inner.cfs.iter().find(|cf| cf.name() == name).map(|cf| cf.id())
    }

    /// Slot pool of column family `cf_id`.
    pub fn slots(&self, cf_id: u32) -> Result<&SlotAllocator> {
        let cf = self
            .inner
            .cfs
            .get(cf_id as usize)
            .ok_or_else(|| Error::not_found(format!("no column family {}", cf_id)))?;
        Ok(cf.slots())
    }

    /// Role of this node.
    pub fn role(&self) -> Role {
        self.inner.policy.role()
    }

    /// Data directory of this node.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Replication health. Flagged once a shipment failed for good.
    pub fn chain_health(&self) -> &ChainHealth {
        &self.inner.health
    }

    /// Counters of the outbound queue, if this node ships.
    pub fn ship_stats(&self) -> Option<ShipStats> {
        self.inner.ship.as_ref().map(ShipQueue::stats)
    }

    /// Whether background compaction may run on this node.
    pub fn compaction_allowed(&self) -> bool {
        self.inner.policy.background_compaction()
    }

    /// Waits for background flushes, flushes every column family, then
    /// shuts the node down.
    pub fn close(&self) -> Result<()> {
        self.scheduler.shutdown();
        if self.inner.policy.produces_flush_output() {
            self.flush_all()?;
        }
        self.shutdown();
        log::info!("Node {} closed successfully", self.inner.options.chain.node_id);
        Ok(())
    }

    /// Stops the node without flushing. Running flushes are cancelled and
    /// roll back; their memtables are discarded with the node.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scheduler.shutdown();
        if let Some(ship) = &self.inner.ship {
            ship.shutdown();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ShipReceiver for Node {
    fn receive(&self, request: ShipRequest) -> Result<ShipAck> {
        self.install_shipped(request)
    }
}

impl NodeInner {
    fn cf(&self, cf_id: u32) -> Result<Arc<ColumnFamily>> {
        self.cfs
            .get(cf_id as usize)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no column family {}", cf_id)))
    }

    fn run_flush(&self, cf_id: u32) -> Result<Option<FlushSummary>> {
        let cf = self.cf(cf_id)?;
        FlushJob::new(FlushContext {
            dir: &self.path,
            options: &self.options,
            cf: &cf,
            ship: self.ship.as_ref(),
            snapshots: self.snapshots.sequences(),
            cancel: &self.shutting_down,
        })
        .run()
    }

    fn install_shipped(&self, request: ShipRequest) -> Result<ShipAck> {
        if !self.policy.applies_upstream() {
            return Err(Error::invalid_state(format!(
                "{} node {} does not install shipped files",
                self.policy.role().as_str(),
                self.options.chain.node_id
            )));
        }
        request.verify_payload()?;
        let cf = self.cf(request.cf_id)?;
        let _guard = self.install_lock.lock();

        let handle = match cf.slots().reserve_shipped(request.generation, request.file_number)? {
            ShippedReservation::AlreadyInstalled(handle) => {
                log::debug!("File {} is already installed, acknowledging again", handle.file_number);
                return self.relay(&cf, &handle, request);
            }
            ShippedReservation::Reserved(handle) => handle,
            ShippedReservation::Superseded { reserved, stale } => {
                self.drop_superseded(&cf, &stale);
                reserved
            }
        };

        let path = table_path(&self.path, &self.options, request.file_number);
        let identity = match self.write_shipped(&path, &request) {
            Ok(identity) => identity,
            Err(e) => {
                self.discard_shipped(&cf, &handle, &path);
                return Err(e);
            }
        };
        if let Err(e) = cf.slots().commit(&handle, &identity) {
            self.discard_shipped(&cf, &handle, &path);
            return Err(e);
        }

        self.sequence.fetch_max(identity.largest_seqno, Ordering::SeqCst);
        log::info!(
            "Installed shipped file {} (cf {}, generation {}, {} bytes)",
            identity.file_number,
            cf.name(),
            handle.generation,
            identity.file_size
        );
        cf.install_file(LiveFile {
            identity,
            generation: handle.generation,
            digest: None,
            blob: None,
            chain_durable: false,
        });
        self.relay(&cf, &handle, request)
    }

    fn write_shipped(&self, path: &Path, request: &ShipRequest) -> Result<FileIdentity> {
        let mut writer = TableFileWriter::create(
            path,
            BufferMode::Retain,
            request.payload.len(),
            self.options.io_alignment,
            self.options.use_fsync,
        )?;
        writer.append(&request.payload)?;
        writer.sync()?;
        drop(writer.close());

        SSTableReader::open(path)?.describe(request.file_number, &request.payload)
    }

    /// Ships every committed file the next node never acknowledged again, in
    /// generation order, and waits for the acknowledgements. A file that still
    /// cannot be shipped leaves the chain flagged.
    fn resume_shipping(&self) -> Result<()> {
        let Some(ship) = &self.ship else {
            return Ok(());
        };
        if !self.policy.produces_flush_output() {
            return Ok(());
        }

        for cf in &self.cfs {
            let slots = cf.slots();
            let unshipped: Vec<SlotHandle> = slots
                .committed()
                .into_iter()
                .filter(|h| {
                    matches!(slots.state(h.slot_index), Some(SlotState::Committed { acknowledged: false, .. }))
                })
                .collect();
            let Some(first) = unshipped.first().map(|h| h.generation) else {
                continue;
            };
            log::warn!(
                "cf {} holds {} files the chain never acknowledged, shipping them again",
                cf.name(),
                unshipped.len()
            );
            ship.register(cf.id(), first);

            let mut tickets = Vec::new();
            let mut pending = unshipped.into_iter().peekable();
            for generation in first..slots.next_generation() {
                match pending.next_if(|h| h.generation == generation) {
                    Some(handle) => {
                        let path = table_path(&self.path, &self.options, handle.file_number);
                        let payload = std::fs::read(&path)?;
                        let request =
                            ShipRequest::new(cf.id(), generation, handle.file_number, payload.into());
                        tickets.push((handle, ship.submit(request)?));
                    }
                    None => ship.skip(cf.id(), generation)?,
                }
            }

            for (handle, ticket) in tickets {
                match ticket.wait() {
                    Ok(ack) => {
                        slots.acknowledge(&handle)?;
                        if ack.chain_durable {
                            cf.mark_chain_durable(handle.file_number);
                        }
                    }
                    Err(e) => log::error!(
                        "File {} of cf {} is still not replicated: {}",
                        handle.file_number,
                        cf.name(),
                        e
                    ),
                }
            }
        }
        Ok(())
    }

    /// Drops the file of a generation the upstream node released. Its slot
    /// release is already logged; a file left behind is an orphan on reopen.
    fn drop_superseded(&self, cf: &ColumnFamily, stale: &SlotHandle) {
        cf.remove_file(stale.file_number);
        let path = table_path(&self.path, &self.options, stale.file_number);
        if let Err(e) = sstable::writer::remove_if_exists(&path) {
            log::warn!("Failed to delete superseded file {}: {}", path.display(), e);
        }
        log::info!(
            "Dropped file {} of cf {} (generation {}), released upstream",
            stale.file_number,
            cf.name(),
            stale.generation
        );
    }

    fn discard_shipped(&self, cf: &ColumnFamily, handle: &SlotHandle, path: &Path) {
        if let Err(e) = sstable::writer::remove_if_exists(path) {
            log::warn!("Failed to delete {}: {}", path.display(), e);
        }
        if let Err(e) = cf.slots().release(handle) {
            log::error!("Failed to release slot {}: {}", handle.slot_index, e);
        }
    }

    /// Forwards a file downstream if this node has a next hop, then
    /// acknowledges it.
    fn relay(&self, cf: &ColumnFamily, handle: &SlotHandle, request: ShipRequest) -> Result<ShipAck> {
        let chain_durable = match &self.ship {
            Some(ship) => ship.forward(request)?.wait()?.chain_durable,
            None => self.policy.is_durability_boundary(),
        };
        cf.slots().acknowledge(handle)?;
        if chain_durable {
            cf.mark_chain_durable(handle.file_number);
        }
        Ok(ShipAck {
            node_id: self.options.chain.node_id.clone(),
            file_number: handle.file_number,
            chain_durable,
        })
    }
}

/// Adds every file the slot log lists as committed to `cf`. A committed file
/// missing from disk has its slot released. Every acknowledgement a node
/// receives comes from the end of the chain, so an acknowledged slot holds a
/// chain-durable file.
fn load_committed_files(dir: &Path, options: &Options, cf: &ColumnFamily) -> Result<()> {
    for handle in cf.slots().committed() {
        let path = table_path(dir, options, handle.file_number);
        if !path.exists() {
            log::warn!(
                "Committed file {} of cf {} is missing, releasing its slot",
                handle.file_number,
                cf.name()
            );
            cf.slots().release(&handle)?;
            continue;
        }

        let bytes = std::fs::read(&path)?;
        let identity = SSTableReader::open(&path)?.describe(handle.file_number, &bytes)?;
        let acknowledged = matches!(
            cf.slots().state(handle.slot_index),
            Some(SlotState::Committed { acknowledged: true, .. })
        );
        cf.install_file(LiveFile {
            identity,
            generation: handle.generation,
            digest: None,
            blob: None,
            chain_durable: acknowledged,
        });
    }
    log::info!("Loaded {} table files of cf {}", cf.live_files().len(), cf.name());
    Ok(())
}

/// Deletes table and blob files no committed slot accounts for. They are
/// leftovers of flushes that crashed before committing.
fn remove_orphan_files(dir: &Path, cfs: &[Arc<ColumnFamily>]) -> Result<()> {
    let known: HashSet<u64> = cfs
        .iter()
        .flat_map(|cf| cf.slots().committed())
        .map(|h| h.file_number)
        .collect();

    for entry in std::fs::read_dir(dir)?.flatten() {
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Some((stem, ext)) = name.split_once('.') else {
            continue;
        };
        if ext != "sst" && ext != "blob" {
            continue;
        }
        match stem.parse::<u64>() {
            Ok(number) if !known.contains(&number) => {
                log::warn!("Removing orphan file {:?}", entry.path());
                sstable::writer::remove_if_exists(&entry.path())?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Checks a file installed from upstream against its recorded checksum.
fn verify_checksum(path: &Path, identity: &FileIdentity) -> Result<()> {
    let bytes = std::fs::read(path)?;
    let actual = crc32fast::hash(&bytes);
    if actual != identity.file_checksum {
        return Err(Error::corruption(format!(
            "file {} checksum {:#010x}, expected {:#010x}",
            identity.file_number, actual, identity.file_checksum
        )));
    }
    SSTableReader::open(path)
        .and_then(|reader| reader.entries())
        .map_err(|e| Error::corruption(format!("file {} is unreadable: {}", identity.file_number, e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> Options {
        Options::default().slot_pool_size(8)
    }

    #[test]
    fn test_node_open() {
        let temp_dir = TempDir::new().unwrap();
        let node = Node::open(temp_dir.path(), options()).unwrap();
        assert_eq!(node.role(), Role::Primary);
        assert!(node.compaction_allowed());
        assert!(node.ship_stats().is_none());
        assert!(temp_dir.path().join(slots::log::SLOT_LOG_FILE).exists());
    }

    #[test]
    fn test_open_missing_dir_without_create() {
        let temp_dir = TempDir::new().unwrap();
        let result = Node::open(temp_dir.path().join("missing"), options().create_if_missing(false));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_downstream_needs_transport() {
        let temp_dir = TempDir::new().unwrap();
        let options = options().chain(ChainConfig::primary("p", "tail:1", 2));
        assert!(matches!(Node::open(temp_dir.path(), options), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_manual_flush() {
        let temp_dir = TempDir::new().unwrap();
        let node = Node::open(temp_dir.path(), options()).unwrap();

        for i in 0..100 {
            let key = format!("key{:03}", i);
            let value = format!("value{}", i);
            node.put(key.as_bytes(), value.as_bytes()).unwrap();
        }

        let summary = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
        assert_eq!(summary.generation, 0);
        assert!(summary.file_size > 0);
        assert!(summary.chain_durable);

        let files = node.live_files(DEFAULT_COLUMN_FAMILY).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].identity.num_entries, 100);
        assert_eq!(files[0].identity.file_number, summary.file_number);
    }

    #[test]
    fn test_flush_empty_memtable_no_file() {
        let temp_dir = TempDir::new().unwrap();
        let node = Node::open(temp_dir.path(), options()).unwrap();

        let summary = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();
        assert_eq!(summary.file_size, 0);
        assert!(summary.identity.is_none());
        assert!(node.live_files(DEFAULT_COLUMN_FAMILY).unwrap().is_empty());
        assert_eq!(node.slots(DEFAULT_COLUMN_FAMILY).unwrap().free_slots(), 8);
    }

    #[test]
    fn test_auto_flush_on_memtable_full() {
        let temp_dir = TempDir::new().unwrap();
        let node = Node::open(temp_dir.path(), options().memtable_size(1024)).unwrap();

        for i in 0..200 {
            let key = format!("key{:04}", i);
            node.put(key.as_bytes(), &[b'x'; 64]).unwrap();
        }
        node.close().unwrap();

        let files = node.live_files(DEFAULT_COLUMN_FAMILY).unwrap();
        assert!(files.len() > 1);
        let total: u64 = files.iter().map(|f| f.identity.num_entries).sum();
        assert_eq!(total, 200);
    }

    #[test]
    fn test_replica_rejects_writes_and_primary_rejects_installs() {
        let temp_dir = TempDir::new().unwrap();
        let tail = Node::open(temp_dir.path().join("tail"), options().chain(ChainConfig::tail("t", "p", 2)))
            .unwrap();
        assert!(matches!(tail.put(b"k", b"v"), Err(Error::InvalidState(_))));
        assert!(matches!(tail.flush(0), Err(Error::InvalidState(_))));
        assert!(!tail.compaction_allowed());

        let primary = Node::open(temp_dir.path().join("primary"), options()).unwrap();
        let request = ShipRequest::new(0, 0, 1, bytes::Bytes::from_static(b"table"));
        assert!(matches!(primary.install_shipped(request), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_unknown_column_family() {
        let temp_dir = TempDir::new().unwrap();
        let node = Node::open(temp_dir.path(), options().column_family("meta")).unwrap();
        assert_eq!(node.column_family("meta"), Some(1));
        assert_eq!(node.column_family("nope"), None);
        assert!(node.put_cf(1, b"k", b"v").is_ok());
        assert!(matches!(node.put_cf(7, b"k", b"v"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_release_file_frees_slot() {
        let temp_dir = TempDir::new().unwrap();
        let node = Node::open(temp_dir.path(), options()).unwrap();
        node.put(b"k", b"v").unwrap();
        let summary = node.flush(DEFAULT_COLUMN_FAMILY).unwrap().unwrap();

        node.release_file(DEFAULT_COLUMN_FAMILY, summary.file_number).unwrap();
        assert!(node.live_files(DEFAULT_COLUMN_FAMILY).unwrap().is_empty());
        assert_eq!(node.slots(DEFAULT_COLUMN_FAMILY).unwrap().free_slots(), 8);
        assert!(!table_path(temp_dir.path(), &options(), summary.file_number).exists());
    }
}
