//! Replicated log engine abstraction.
//!
//! The consensus protocol itself (leader election, log replication, quorum
//! commit) is an external collaborator; this module pins down the exact
//! surface the copyset node consumes from it and the state-machine callback
//! contract it exposes back. A concrete engine (any Raft-family
//! implementation) implements [`RaftEngine`] and drives the node through
//! [`StateMachine`] from its own worker tasks.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::node::operation::OpClosure;
use crate::utils::CopysetError;

use async_trait::async_trait;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Identity of one replica peer within a consensus group. The index field
/// distinguishes multiple local replicas of the same group in one process;
/// a chunkserver never runs more than one, so it always uses index 0.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize,
)]
pub struct PeerId {
    pub addr: SocketAddr,
    pub idx: u32,
}

impl PeerId {
    pub fn new(addr: SocketAddr, idx: u32) -> Self {
        PeerId { addr, idx }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.idx)
    }
}

impl FromStr for PeerId {
    type Err = CopysetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((addr, idx)) => Ok(PeerId {
                addr: addr.parse()?,
                idx: idx.parse()?,
            }),
            None => Err(CopysetError::msg(format!("invalid peer id '{}'", s))),
        }
    }
}

/// Options handed to `RaftEngine::init()`, assembled by the copyset node
/// from its own configuration during `init()`.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Consensus group name; the copyset's group id string.
    pub group_id: String,

    /// This replica's own peer identity.
    pub peer_id: PeerId,

    /// Initial peer configuration of the group.
    pub initial_conf: Vec<PeerId>,

    /// Election timeout in millisecs.
    pub election_timeout_ms: u64,

    /// Automatic snapshot triggering interval in secs.
    pub snapshot_interval_s: u64,

    /// Directory holding the replicated log segments.
    pub log_uri: String,

    /// Directory holding consensus metadata (term/vote records).
    pub raft_meta_uri: String,

    /// Directory holding snapshot instances.
    pub raft_snapshot_uri: String,

    /// Whether administrative reconfiguration commands are disabled.
    pub disable_cli: bool,

    /// Whether state-machine callback code runs on a dedicated worker
    /// instead of the engine's internal executor.
    pub usercode_dedicated_worker: bool,
}

/// A command submitted to the replicated log: the encoded payload plus an
/// optional completion closure released exactly once by the engine, either
/// through `on_apply` after commit or through the failure path.
pub struct LogTask {
    pub data: Bytes,
    pub closure: Option<OpClosure>,
}

/// One committed log entry handed to `on_apply`. The closure is attached
/// only on the replica that originated the task and only while it is live;
/// recovery replay and follower apply see `None`.
pub struct CommittedEntry {
    pub index: u64,
    pub data: Bytes,
    pub closure: Option<OpClosure>,
}

/// Snapshot file-set builder passed to `on_snapshot_save`. The state
/// machine registers, for each file to include, its absolute source path
/// and the path it takes relative to the snapshot root; the engine then
/// persists the registered set atomically as one snapshot instance.
#[derive(Debug, Default)]
pub struct SnapshotWriter {
    files: Vec<(PathBuf, PathBuf)>,
}

impl SnapshotWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a file at absolute path `src` to be stored under the
    /// snapshot-relative path `rel`.
    pub fn add_file(&mut self, src: PathBuf, rel: PathBuf) {
        self.files.push((src, rel));
    }

    /// All registered (absolute, relative) path pairs.
    pub fn files(&self) -> &[(PathBuf, PathBuf)] {
        &self.files
    }
}

/// Handle on one opened snapshot instance passed to `on_snapshot_load`.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    path: PathBuf,
}

impl SnapshotReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SnapshotReader { path: path.into() }
    }

    /// Root directory of this snapshot instance, e.g.
    /// `/mnt/sda/1-10001/raft_snapshot/snapshot_0043`.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Context reported by the engine on follower-side leader changes.
#[derive(Debug, Clone)]
pub struct LeaderChangeContext {
    pub leader: Option<PeerId>,
    pub term: i64,
    pub reason: String,
}

impl fmt::Display for LeaderChangeContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.leader {
            Some(leader) => {
                write!(f, "(leader {} term {}: {})", leader, self.term, self.reason)
            }
            None => write!(f, "(no leader, term {}: {})", self.term, self.reason),
        }
    }
}

/// State-machine callback contract invoked by the engine, in commit order
/// for `on_apply` and from the engine's own worker tasks throughout. The
/// target is shared ownership (`Arc`) because both the engine and every
/// in-flight closure must be able to reach it.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Applies a batch of committed log entries, in the exact commit order.
    /// Returning an error halts processing within this batch and marks the
    /// replica failed; remaining entries must not be applied.
    async fn on_apply(
        &self,
        entries: Vec<CommittedEntry>,
    ) -> Result<(), CopysetError>;

    /// Registers the point-in-time file set of this replica into `writer`.
    async fn on_snapshot_save(
        &self,
        writer: &mut SnapshotWriter,
    ) -> Result<(), CopysetError>;

    /// Installs the file set of an opened snapshot into live data paths.
    /// An error aborts replica startup/recovery.
    async fn on_snapshot_load(
        &self,
        reader: &SnapshotReader,
    ) -> Result<(), CopysetError>;

    /// This replica has become leader at `term`.
    fn on_leader_start(&self, term: i64);

    /// This replica has stepped down from leadership.
    fn on_leader_stop(&self, status: CopysetError);

    /// The engine hit an unrecoverable fault (log corruption, disk error).
    fn on_error(&self, err: CopysetError);

    /// A configuration change for this group has committed.
    fn on_configuration_committed(&self, conf: &[PeerId]);

    /// This follower started following a (new) leader.
    fn on_start_following(&self, ctx: LeaderChangeContext);

    /// This follower stopped following its leader.
    fn on_stop_following(&self, ctx: LeaderChangeContext);

    /// The engine has fully shut this replica down.
    fn on_shutdown(&self);
}

/// Surface the copyset node consumes from the replicated log engine.
#[async_trait]
pub trait RaftEngine: Send + Sync + 'static {
    /// Starts the engine for one consensus group with the node registered
    /// as its state-machine callback target.
    async fn init(
        &self,
        options: EngineOptions,
        fsm: Arc<dyn StateMachine>,
    ) -> Result<(), CopysetError>;

    /// Initiates shutdown of this replica's engine.
    async fn shutdown(&self) -> Result<(), CopysetError>;

    /// Blocks until all outstanding tasks (including queued applies) have
    /// drained after `shutdown()`.
    async fn join(&self);

    /// Submits a task for replication. Returns once the task is handed to
    /// the engine; the attached closure is released later, exactly once.
    fn apply(&self, task: LogTask) -> Result<(), CopysetError>;

    /// The believed-current leader of this group, if any is known.
    fn leader_id(&self) -> Option<PeerId>;
}
