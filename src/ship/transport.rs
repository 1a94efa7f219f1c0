//! Replication transport.
//!
//! The ship queue talks to the next chain node through [`ShipTransport`]. The
//! wire encoding is up to the implementation. [`InProcessTransport`] hands
//! requests straight to nodes living in the same process, which is how chains
//! are wired in tests and demos.

use super::{ShipAck, ShipRequest};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Request/response channel to other chain nodes.
pub trait ShipTransport: Send + Sync {
    /// Delivers `request` to the node at `target` and returns its
    /// acknowledgement.
    fn ship(&self, target: &str, request: &ShipRequest) -> Result<ShipAck>;
}

/// A node that accepts shipped files.
pub trait ShipReceiver: Send + Sync {
    /// Installs a shipped file and acknowledges it.
    fn receive(&self, request: ShipRequest) -> Result<ShipAck>;
}

/// Transport between nodes of the same process, keyed by address.
#[derive(Default)]
pub struct InProcessTransport {
    nodes: RwLock<HashMap<String, Weak<dyn ShipReceiver>>>,
}

impl InProcessTransport {
    /// Creates an empty transport.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes `node` reachable at `address`. The transport holds a weak
    /// reference, so a dropped node becomes unreachable.
    pub fn register<R: ShipReceiver + 'static>(&self, address: impl Into<String>, node: &Arc<R>) {
        let weak: Weak<dyn ShipReceiver> = Arc::downgrade(node) as Weak<dyn ShipReceiver>;
        self.nodes.write().insert(address.into(), weak);
    }

    /// Removes the node at `address`.
    pub fn unregister(&self, address: &str) {
        self.nodes.write().remove(address);
    }
}

impl ShipTransport for InProcessTransport {
    fn ship(&self, target: &str, request: &ShipRequest) -> Result<ShipAck> {
        let node = self
            .nodes
            .read()
            .get(target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::not_found(format!("no chain node at {}", target)))?;
        node.receive(request.clone())
    }
}
