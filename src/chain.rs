//! Chain role controller.
//!
//! Every node in a replication chain runs with one fixed [`Role`]. Writes enter
//! at the primary, which flushes memtables into table files and ships each
//! file downstream. Middle nodes install shipped files and relay them; the
//! tail installs them and acknowledges, at which point a file is chain-durable.
//!
//! ```text
//! primary --ship--> middle --ship--> ... --ship--> tail
//!         <--ack---        <--ack---         <--ack--
//! ```

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Position of a node in the replication chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Accepts writes, produces flush output and ships it onward.
    Primary,
    /// Installs files shipped from upstream and relays them downstream.
    Middle,
    /// Installs files shipped from upstream; the durability boundary.
    Tail,
}

impl Role {
    /// Short lowercase name, used in log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Middle => "middle",
            Role::Tail => "tail",
        }
    }
}

/// Static description of this node's place in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Role of this node.
    /// Default: Primary
    pub role: Role,

    /// Identifier of this node, reported in acknowledgements.
    /// Default: "node-0"
    pub node_id: String,

    /// Address of the previous node, if any.
    pub upstream: Option<String>,

    /// Address of the next node, if any.
    pub downstream: Option<String>,

    /// Number of nodes in the chain.
    /// Default: 1
    pub replication_factor: usize,

    /// Run background compaction on middle and tail nodes as well.
    /// Default: false
    pub compaction_on_replicas: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            role: Role::Primary,
            node_id: "node-0".to_string(),
            upstream: None,
            downstream: None,
            replication_factor: 1,
            compaction_on_replicas: false,
        }
    }
}

impl ChainConfig {
    /// A standalone primary with no replicas.
    pub fn standalone(node_id: impl Into<String>) -> Self {
        Self { node_id: node_id.into(), ..Default::default() }
    }

    /// A primary shipping to `downstream`.
    pub fn primary(
        node_id: impl Into<String>,
        downstream: impl Into<String>,
        replication_factor: usize,
    ) -> Self {
        Self {
            role: Role::Primary,
            node_id: node_id.into(),
            downstream: Some(downstream.into()),
            replication_factor,
            ..Default::default()
        }
    }

    /// A middle node between `upstream` and `downstream`.
    pub fn middle(
        node_id: impl Into<String>,
        upstream: impl Into<String>,
        downstream: impl Into<String>,
        replication_factor: usize,
    ) -> Self {
        Self {
            role: Role::Middle,
            node_id: node_id.into(),
            upstream: Some(upstream.into()),
            downstream: Some(downstream.into()),
            replication_factor,
            ..Default::default()
        }
    }

    /// The last node of the chain.
    pub fn tail(
        node_id: impl Into<String>,
        upstream: impl Into<String>,
        replication_factor: usize,
    ) -> Self {
        Self {
            role: Role::Tail,
            node_id: node_id.into(),
            upstream: Some(upstream.into()),
            replication_factor,
            ..Default::default()
        }
    }

    /// Checks that the addresses match the role.
    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            return Err(Error::invalid_argument("replication_factor must be > 0"));
        }
        match self.role {
            Role::Primary => {
                if self.upstream.is_some() {
                    return Err(Error::invalid_argument("a primary has no upstream"));
                }
                if self.downstream.is_some() && self.replication_factor < 2 {
                    return Err(Error::invalid_argument(
                        "a primary with a downstream needs replication_factor >= 2",
                    ));
                }
            }
            Role::Middle => {
                if self.upstream.is_none() || self.downstream.is_none() {
                    return Err(Error::invalid_argument(
                        "a middle node needs both upstream and downstream",
                    ));
                }
                if self.replication_factor < 3 {
                    return Err(Error::invalid_argument(
                        "a middle node implies replication_factor >= 3",
                    ));
                }
            }
            Role::Tail => {
                if self.downstream.is_some() {
                    return Err(Error::invalid_argument("a tail has no downstream"));
                }
                if self.upstream.is_none() {
                    return Err(Error::invalid_argument("a tail needs an upstream"));
                }
            }
        }
        Ok(())
    }

    /// Behavioral policy derived from this configuration.
    pub fn policy(&self) -> RolePolicy {
        RolePolicy {
            role: self.role,
            has_downstream: self.downstream.is_some(),
            compaction_on_replicas: self.compaction_on_replicas,
        }
    }
}

/// What a node does with flushes, shipments and compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolePolicy {
    role: Role,
    has_downstream: bool,
    compaction_on_replicas: bool,
}

impl RolePolicy {
    /// The role this policy was derived from.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the node turns its own memtables into table files.
    pub fn produces_flush_output(&self) -> bool {
        self.role == Role::Primary
    }

    /// Whether files produced or installed here travel further down the chain.
    pub fn ships_onward(&self) -> bool {
        self.role != Role::Tail && self.has_downstream
    }

    /// Whether the node installs files shipped from upstream.
    pub fn applies_upstream(&self) -> bool {
        self.role != Role::Primary
    }

    /// Whether background compaction may run on this node.
    pub fn background_compaction(&self) -> bool {
        self.role == Role::Primary || self.compaction_on_replicas
    }

    /// Whether an acknowledgement from this node makes a file chain-durable.
    pub fn is_durability_boundary(&self) -> bool {
        self.role == Role::Tail || (self.role == Role::Primary && !self.has_downstream)
    }
}

/// Operator-visible replication health of a node.
///
/// Once a shipment fails for good the chain holds diverging file sets and
/// stays flagged until an operator intervenes.
#[derive(Debug, Default)]
pub struct ChainHealth {
    inconsistent: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl ChainHealth {
    /// Creates a healthy state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the chain inconsistent.
    pub fn flag(&self, reason: impl Into<String>) {
        let reason = reason.into();
        log::error!("Chain marked inconsistent, operator intervention required: {}", reason);
        self.inconsistent.store(true, Ordering::SeqCst);
        *self.last_error.lock() = Some(reason);
    }

    /// Returns true while no shipment has failed permanently.
    pub fn is_consistent(&self) -> bool {
        !self.inconsistent.load(Ordering::SeqCst)
    }

    /// The reason recorded by the last [`ChainHealth::flag`] call.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_policy() {
        let config = ChainConfig::primary("p", "m:1", 3);
        config.validate().unwrap();
        let policy = config.policy();

        assert!(policy.produces_flush_output());
        assert!(policy.ships_onward());
        assert!(!policy.applies_upstream());
        assert!(policy.background_compaction());
        assert!(!policy.is_durability_boundary());
    }

    #[test]
    fn test_standalone_primary_is_its_own_boundary() {
        let policy = ChainConfig::standalone("solo").policy();
        assert!(policy.produces_flush_output());
        assert!(!policy.ships_onward());
        assert!(policy.is_durability_boundary());
    }

    #[test]
    fn test_middle_policy() {
        let config = ChainConfig::middle("m", "p:1", "t:1", 3);
        config.validate().unwrap();
        let policy = config.policy();

        assert!(!policy.produces_flush_output());
        assert!(policy.ships_onward());
        assert!(policy.applies_upstream());
        assert!(!policy.background_compaction());
    }

    #[test]
    fn test_replica_compaction_opt_in() {
        let mut config = ChainConfig::tail("t", "m:1", 3);
        assert!(!config.policy().background_compaction());

        config.compaction_on_replicas = true;
        assert!(config.policy().background_compaction());
        assert!(config.policy().is_durability_boundary());
        assert!(!config.policy().ships_onward());
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = ChainConfig::tail("t", "m:1", 3);
        config.downstream = Some("x:1".into());
        assert!(config.validate().is_err());

        let config = ChainConfig { role: Role::Middle, ..Default::default() };
        assert!(config.validate().is_err());

        let config = ChainConfig::primary("p", "t:1", 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chain_health_flag() {
        let health = ChainHealth::new();
        assert!(health.is_consistent());

        health.flag("file 12 not shipped");
        assert!(!health.is_consistent());
        assert_eq!(health.last_error().as_deref(), Some("file 12 not shipped"));
    }
}
