//! Copyset identity & node configuration.

use std::fmt;

use crate::node::request::{CopysetId, LogicPoolId};
use crate::utils::CopysetError;

use serde::{Deserialize, Serialize};

/// Composite key identifying one copyset: `(logicPoolId, copysetId)`.
/// Immutable once a node is constructed. One process holds at most one
/// replica of any given identity.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub struct CopysetIdentity {
    pub logic_pool_id: LogicPoolId,
    pub copyset_id: CopysetId,
}

impl CopysetIdentity {
    pub fn new(logic_pool_id: LogicPoolId, copyset_id: CopysetId) -> Self {
        CopysetIdentity {
            logic_pool_id,
            copyset_id,
        }
    }

    /// Globally unique group id string namespacing all on-disk paths and
    /// the consensus group name, e.g. `"1-10001"`.
    pub fn group_id(&self) -> String {
        format!("{}-{}", self.logic_pool_id, self.copyset_id)
    }
}

impl fmt::Display for CopysetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.group_id())
    }
}

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CopysetNodeOptions {
    /// Election timeout in millisecs.
    pub election_timeout_ms: u64,

    /// Automatic snapshot triggering interval in secs.
    pub snapshot_interval_s: u64,

    /// URI prefix of replicated log directories.
    pub log_uri: String,

    /// URI prefix of consensus metadata directories.
    pub raft_meta_uri: String,

    /// URI prefix of snapshot directories.
    pub raft_snapshot_uri: String,

    /// URI of chunk data directories, protocol-tagged,
    /// e.g. `local:///mnt/sda`.
    pub chunk_data_uri: String,

    /// This node's local IP address.
    pub ip: String,

    /// This node's local port.
    pub port: u16,

    /// Whether administrative reconfiguration commands are disabled.
    pub disable_cli: bool,

    /// Whether state-machine callback code runs on a dedicated worker.
    pub usercode_dedicated_worker: bool,

    /// Maximum chunk size in bytes accepted for writes.
    pub max_chunk_size: usize,
}

impl Default for CopysetNodeOptions {
    fn default() -> Self {
        CopysetNodeOptions {
            election_timeout_ms: 1000,
            snapshot_interval_s: 3600,
            log_uri: "/log".into(),
            raft_meta_uri: "/raft_meta".into(),
            raft_snapshot_uri: "/raft_snapshot".into(),
            chunk_data_uri: "local:///data".into(),
            ip: "127.0.0.1".into(),
            port: 8200,
            disable_cli: false,
            usercode_dedicated_worker: false,
            max_chunk_size: 16 * 1024 * 1024,
        }
    }
}

impl CopysetNodeOptions {
    /// Composes options from defaults overlaid with an optional TOML
    /// config string.
    pub fn from_config_str(
        config_str: Option<&str>,
    ) -> Result<Self, CopysetError> {
        parsed_config!(config_str => CopysetNodeOptions;
                       election_timeout_ms, snapshot_interval_s,
                       log_uri, raft_meta_uri, raft_snapshot_uri,
                       chunk_data_uri, ip, port, disable_cli,
                       usercode_dedicated_worker, max_chunk_size)
    }
}

/// Splits a protocol-tagged URI like `local:///mnt/sda` into its protocol
/// tag and directory path.
pub fn parse_uri(uri: &str) -> Result<(&str, &str), CopysetError> {
    match uri.split_once("://") {
        Some((protocol, dir)) if !protocol.is_empty() && !dir.is_empty() => {
            Ok((protocol, dir))
        }
        _ => logged_err!("malformed uri '{}'", uri),
    }
}
