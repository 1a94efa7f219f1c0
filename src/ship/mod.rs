//! Ship job queue.
//!
//! Finished table files travel to the next chain node through a
//! [`ShipQueue`]. The queue owns one worker thread that transmits jobs in
//! FIFO order, so a flush thread never blocks on the network while building.
//!
//! Downstream slot identity depends on generation order, so per column family
//! jobs pass through a reorder buffer and are released strictly by
//! generation. A generation that produced no file must be [`ShipQueue::skip`]ped
//! or later generations would wait forever.
//!
//! ## Example
//!
//! ```rust,no_run
//! use chaindb::chain::ChainHealth;
//! use chaindb::ship::{transport::InProcessTransport, RetryPolicy, ShipQueue, ShipRequest};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), chaindb::Error> {
//! let transport = InProcessTransport::new();
//! let queue = ShipQueue::new("tail:1", transport, RetryPolicy::default(), Arc::new(ChainHealth::new()))?;
//! queue.register(0, 0);
//! let ticket = queue.submit(ShipRequest::new(0, 0, 1, bytes::Bytes::from_static(b"table")))?;
//! let ack = ticket.wait()?;
//! println!("file {} acknowledged by {}", ack.file_number, ack.node_id);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod retry;
pub mod transport;

pub use buffer::{AlignedBuffer, SealedBuffer};
pub use retry::RetryPolicy;
pub use transport::{InProcessTransport, ShipReceiver, ShipTransport};

use crate::chain::ChainHealth;
use crate::error::{Error, Result};
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A finished table file on its way to the next node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipRequest {
    /// Column family of the file.
    pub cf_id: u32,
    /// Generation that produced the file.
    pub generation: u64,
    /// File number assigned by the primary.
    pub file_number: u64,
    /// crc32 of `payload`.
    pub checksum: u32,
    /// The file bytes, exactly as synced on the sender.
    pub payload: Bytes,
}

impl ShipRequest {
    /// Creates a request, computing the payload checksum.
    pub fn new(cf_id: u32, generation: u64, file_number: u64, payload: Bytes) -> Self {
        let checksum = crc32fast::hash(&payload);
        Self { cf_id, generation, file_number, checksum, payload }
    }

    /// Checks that the payload matches the checksum it was sent with.
    pub fn verify_payload(&self) -> Result<()> {
        let actual = crc32fast::hash(&self.payload);
        if actual != self.checksum {
            return Err(Error::ChecksumMismatch { expected: self.checksum, actual });
        }
        Ok(())
    }
}

/// Acknowledgement of a shipped file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShipAck {
    /// Node that sent the acknowledgement.
    pub node_id: String,
    /// The acknowledged file.
    pub file_number: u64,
    /// True once the tail of the chain holds the file.
    pub chain_durable: bool,
}

/// Counters of a ship queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShipStats {
    /// Jobs accepted.
    pub queued: u64,
    /// Jobs acknowledged by the next node.
    pub shipped: u64,
    /// Jobs that exhausted their retries.
    pub failed: u64,
    /// Payload bytes acknowledged.
    pub bytes_shipped: u64,
    /// Transport attempts that failed and were retried.
    pub retries: u64,
}

impl ShipStats {
    /// Jobs accepted but not finished yet.
    pub fn in_flight(&self) -> u64 {
        self.queued.saturating_sub(self.shipped + self.failed)
    }
}

/// Handle to the outcome of one shipment.
#[derive(Debug)]
pub struct ShipTicket {
    file_number: u64,
    receiver: Receiver<Result<ShipAck>>,
}

impl ShipTicket {
    /// File being shipped.
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Blocks until the next node acknowledges the file or the retries are
    /// exhausted.
    pub fn wait(self) -> Result<ShipAck> {
        self.receiver.recv().map_err(|_| {
            Error::Cancelled(format!("ship queue stopped before file {} was shipped", self.file_number))
        })?
    }

    /// Like [`ShipTicket::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<ShipAck> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(channel::RecvTimeoutError::Timeout) => Err(Error::invalid_state(format!(
                "file {} not acknowledged within {:?}",
                self.file_number, timeout
            ))),
            Err(channel::RecvTimeoutError::Disconnected) => Err(Error::Cancelled(format!(
                "ship queue stopped before file {} was shipped",
                self.file_number
            ))),
        }
    }
}

struct ShipJob {
    request: ShipRequest,
    reply: Sender<Result<ShipAck>>,
}

/// Jobs of one column family waiting for their turn.
struct Reorder {
    next: u64,
    /// `None` marks a skipped generation.
    pending: BTreeMap<u64, Option<ShipJob>>,
}

struct Shared {
    target: String,
    transport: Arc<dyn ShipTransport>,
    retry: RetryPolicy,
    health: Arc<ChainHealth>,
    stats: Mutex<ShipStats>,
}

/// Outbound replication path of a node.
pub struct ShipQueue {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<ShipJob>>>,
    order: Mutex<HashMap<u32, Reorder>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ShipQueue {
    /// Starts a queue shipping to `target` through `transport`.
    pub fn new(
        target: impl Into<String>,
        transport: Arc<dyn ShipTransport>,
        retry: RetryPolicy,
        health: Arc<ChainHealth>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            target: target.into(),
            transport,
            retry,
            health,
            stats: Mutex::new(ShipStats::default()),
        });
        let (sender, receiver) = channel::unbounded::<ShipJob>();

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("chaindb-ship".to_string())
                .spawn(move || {
                    for job in receiver {
                        shared.transmit(job);
                    }
                    log::debug!("Ship worker for {} stopped", shared.target);
                })?
        };

        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            order: Mutex::new(HashMap::new()),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Address of the next node.
    pub fn target(&self) -> &str {
        &self.shared.target
    }

    /// Sets the first generation the queue expects for column family `cf_id`.
    pub fn register(&self, cf_id: u32, next_generation: u64) {
        self.order
            .lock()
            .entry(cf_id)
            .or_insert_with(|| Reorder { next: next_generation, pending: BTreeMap::new() })
            .next = next_generation;
    }

    /// Queues a file for shipping. It is transmitted once every earlier
    /// generation of its column family has been transmitted or skipped.
    pub fn submit(&self, request: ShipRequest) -> Result<ShipTicket> {
        let (reply, receiver) = channel::bounded(1);
        let file_number = request.file_number;
        let (cf_id, generation) = (request.cf_id, request.generation);
        self.shared.stats.lock().queued += 1;
        if let Err(e) = self.enqueue(cf_id, generation, Some(ShipJob { request, reply })) {
            self.shared.stats.lock().queued -= 1;
            return Err(e);
        }
        Ok(ShipTicket { file_number, receiver })
    }

    /// Marks a generation that produced no file as done.
    pub fn skip(&self, cf_id: u32, generation: u64) -> Result<()> {
        log::debug!("Skipping generation {} of cf {} in ship order", generation, cf_id);
        self.enqueue(cf_id, generation, None)
    }

    /// Transmits a file without generation reordering. Used by middle nodes
    /// relaying files that already arrive in order.
    pub fn forward(&self, request: ShipRequest) -> Result<ShipTicket> {
        let (reply, receiver) = channel::bounded(1);
        let file_number = request.file_number;
        self.shared.stats.lock().queued += 1;
        if let Err(e) = self.send(ShipJob { request, reply }) {
            self.shared.stats.lock().queued -= 1;
            return Err(e);
        }
        Ok(ShipTicket { file_number, receiver })
    }

    fn enqueue(&self, cf_id: u32, generation: u64, job: Option<ShipJob>) -> Result<()> {
        let mut order = self.order.lock();
        let reorder = order
            .entry(cf_id)
            .or_insert_with(|| Reorder { next: 0, pending: BTreeMap::new() });

        if generation < reorder.next || reorder.pending.contains_key(&generation) {
            return Err(Error::invalid_argument(format!(
                "generation {} of cf {} was already submitted",
                generation, cf_id
            )));
        }
        reorder.pending.insert(generation, job);

        let mut released = 0;
        while let Some(job) = reorder.pending.remove(&reorder.next) {
            reorder.next += 1;
            if let Some(job) = job {
                self.send(job)?;
                released += 1;
            }
        }
        if !reorder.pending.is_empty() {
            log::debug!(
                "cf {} holds {} shipments waiting for generation {}",
                cf_id,
                reorder.pending.len(),
                reorder.next
            );
        } else if released > 1 {
            log::debug!("Released {} shipments of cf {}", released, cf_id);
        }
        Ok(())
    }

    fn send(&self, job: ShipJob) -> Result<()> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender
                .send(job)
                .map_err(|_| Error::Cancelled("ship worker has stopped".to_string())),
            None => Err(Error::Cancelled("ship queue is shut down".to_string())),
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ShipStats {
        *self.shared.stats.lock()
    }

    /// Stops accepting jobs, finishes the jobs already released and joins
    /// the worker. Jobs still waiting for an earlier generation are dropped
    /// and their tickets resolve with `Cancelled`.
    pub fn shutdown(&self) {
        let dropped: usize = self.order.lock().drain().map(|(_, r)| r.pending.len()).sum();
        if dropped > 0 {
            log::warn!("Ship queue for {} dropped {} unreleased shipments", self.shared.target, dropped);
        }
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("Ship worker for {} panicked", self.shared.target);
            }
        }
    }
}

impl Shared {
    fn transmit(&self, job: ShipJob) {
        let ShipJob { request, reply } = job;
        log::debug!(
            "Shipping file {} (cf {}, generation {}, {} bytes) to {}",
            request.file_number,
            request.cf_id,
            request.generation,
            request.payload.len(),
            self.target
        );

        let mut attempts_made = 0u32;
        let outcome = self.retry.run(|attempt| {
            attempts_made = attempt;
            self.transport.ship(&self.target, &request).inspect_err(|e| {
                log::warn!(
                    "Attempt {} to ship file {} to {} failed: {}",
                    attempt,
                    request.file_number,
                    self.target,
                    e
                );
            })
        });

        let result = match outcome {
            Ok(ack) => {
                let mut stats = self.stats.lock();
                stats.shipped += 1;
                stats.bytes_shipped += request.payload.len() as u64;
                log::info!(
                    "File {} acknowledged by {} (chain durable: {})",
                    ack.file_number,
                    ack.node_id,
                    ack.chain_durable
                );
                Ok(ack)
            }
            Err((attempts, e)) => {
                self.stats.lock().failed += 1;
                let err = Error::Replication {
                    file_number: request.file_number,
                    attempts,
                    reason: e.to_string(),
                };
                self.health.flag(err.to_string());
                Err(err)
            }
        };
        self.stats.lock().retries += attempts_made.saturating_sub(1) as u64;
        let _ = reply.send(result);
    }
}

impl Drop for ShipQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records the order of delivered files and fails the first `failures`
    /// attempts.
    struct Recorder {
        delivered: Mutex<Vec<u64>>,
        failures: AtomicU32,
    }

    impl Recorder {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self { delivered: Mutex::new(Vec::new()), failures: AtomicU32::new(failures) })
        }
    }

    impl ShipTransport for Recorder {
        fn ship(&self, _target: &str, request: &ShipRequest) -> Result<ShipAck> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::internal("link down"));
            }
            self.delivered.lock().push(request.file_number);
            Ok(ShipAck { node_id: "tail".into(), file_number: request.file_number, chain_durable: true })
        }
    }

    fn request(generation: u64) -> ShipRequest {
        ShipRequest::new(0, generation, generation + 1, Bytes::from(vec![generation as u8; 16]))
    }

    #[test]
    fn test_ships_in_generation_order() {
        let transport = Recorder::new(0);
        let queue =
            ShipQueue::new("tail", transport.clone(), RetryPolicy::immediate(1), Arc::new(ChainHealth::new()))
                .unwrap();
        queue.register(0, 0);

        let t2 = queue.submit(request(2)).unwrap();
        let t0 = queue.submit(request(0)).unwrap();
        queue.skip(0, 1).unwrap();
        let t3 = queue.submit(request(3)).unwrap();

        for ticket in [t0, t2, t3] {
            ticket.wait().unwrap();
        }
        assert_eq!(*transport.delivered.lock(), vec![1, 3, 4]);

        let stats = queue.stats();
        assert_eq!(stats.shipped, 3);
        assert_eq!(stats.bytes_shipped, 48);
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn test_retries_then_succeeds() {
        let transport = Recorder::new(2);
        let health = Arc::new(ChainHealth::new());
        let queue = ShipQueue::new("tail", transport.clone(), RetryPolicy::immediate(3), health.clone()).unwrap();

        let ack = queue.submit(request(0)).unwrap().wait().unwrap();
        assert_eq!(ack.file_number, 1);
        assert!(health.is_consistent());
        assert_eq!(queue.stats().retries, 2);
    }

    #[test]
    fn test_exhausted_retries_flag_chain() {
        let transport = Recorder::new(10);
        let health = Arc::new(ChainHealth::new());
        let queue = ShipQueue::new("tail", transport, RetryPolicy::immediate(3), health.clone()).unwrap();

        let err = queue.submit(request(0)).unwrap().wait().unwrap_err();
        match err {
            Error::Replication { file_number, attempts, .. } => {
                assert_eq!(file_number, 1);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!health.is_consistent());
        assert_eq!(queue.stats().failed, 1);
        assert_eq!(queue.stats().retries, 2);
    }

    #[test]
    fn test_duplicate_generation_rejected() {
        let queue =
            ShipQueue::new("tail", Recorder::new(0), RetryPolicy::immediate(1), Arc::new(ChainHealth::new()))
                .unwrap();
        queue.submit(request(0)).unwrap().wait().unwrap();
        assert!(matches!(queue.submit(request(0)), Err(Error::InvalidArgument(_))));
        assert!(matches!(queue.skip(0, 0), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_shutdown_cancels_waiting_jobs() {
        let queue =
            ShipQueue::new("tail", Recorder::new(0), RetryPolicy::immediate(1), Arc::new(ChainHealth::new()))
                .unwrap();
        let waiting = queue.submit(request(5)).unwrap();
        queue.shutdown();

        assert!(matches!(waiting.wait(), Err(Error::Cancelled(_))));
        assert!(matches!(queue.forward(request(6)), Err(Error::Cancelled(_))));
    }

    #[test]
    fn test_payload_checksum() {
        let mut req = request(0);
        req.verify_payload().unwrap();
        req.payload = Bytes::from_static(b"tampered");
        assert!(matches!(req.verify_payload(), Err(Error::ChecksumMismatch { .. })));
    }
}
