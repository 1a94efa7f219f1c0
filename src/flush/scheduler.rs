//! Background flush workers.
//!
//! A fixed pool of threads pulls column family ids from a channel and runs
//! the flush handler for each. Callers get a [`FlushHandle`] they may wait on
//! or drop.

use super::FlushSummary;
use crate::error::{Error, Result};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Runs one flush of the given column family.
pub type FlushHandler = Arc<dyn Fn(u32) -> Result<Option<FlushSummary>> + Send + Sync>;

type Reply = Sender<Result<Option<FlushSummary>>>;

/// Pending result of a scheduled flush.
#[derive(Debug)]
pub struct FlushHandle {
    cf_id: u32,
    receiver: Receiver<Result<Option<FlushSummary>>>,
}

impl FlushHandle {
    /// Column family the flush runs for.
    pub fn cf_id(&self) -> u32 {
        self.cf_id
    }

    /// Blocks until the flush finishes.
    pub fn wait(self) -> Result<Option<FlushSummary>> {
        self.receiver
            .recv()
            .map_err(|_| Error::Cancelled(format!("flush of cf {} was dropped", self.cf_id)))?
    }
}

/// Pool of flush worker threads.
pub struct FlushScheduler {
    sender: Mutex<Option<Sender<(u32, Reply)>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FlushScheduler {
    /// Starts `threads` workers running `handler`.
    pub fn new(threads: usize, handler: FlushHandler) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<(u32, Reply)>();
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads.max(1) {
            let receiver = receiver.clone();
            let handler = Arc::clone(&handler);
            let worker = std::thread::Builder::new()
                .name(format!("chaindb-flush-{}", i))
                .spawn(move || {
                    for (cf_id, reply) in receiver {
                        let result = handler(cf_id);
                        if let Err(e) = &result {
                            log::warn!("Background flush of cf {} failed: {}", cf_id, e);
                        }
                        let _ = reply.send(result);
                    }
                })?;
            workers.push(worker);
        }
        Ok(Self { sender: Mutex::new(Some(sender)), workers: Mutex::new(workers) })
    }

    /// Queues a flush of column family `cf_id`.
    pub fn schedule(&self, cf_id: u32) -> Result<FlushHandle> {
        let (reply, receiver) = channel::bounded(1);
        match self.sender.lock().as_ref() {
            Some(sender) => sender
                .send((cf_id, reply))
                .map_err(|_| Error::Cancelled("flush workers have stopped".to_string()))?,
            None => return Err(Error::Cancelled("flush scheduler is shut down".to_string())),
        }
        log::debug!("Scheduled flush of cf {}", cf_id);
        Ok(FlushHandle { cf_id, receiver })
    }

    /// Lets queued flushes finish, then joins the workers.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                log::error!("Flush worker panicked");
            }
        }
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
