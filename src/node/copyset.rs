//! Copyset node: the replica state machine binding a chunk store to a
//! replicated log.
//!
//! One `CopysetNode` owns exactly one chunk store handle and one engine
//! handle for its copyset. Request-handling tasks check leadership and
//! submit encoded operations to the engine without ever blocking on
//! commit; the engine's worker tasks later call back through the
//! [`StateMachine`] impl to apply committed entries (completing the
//! original requests) and to save/load snapshots. The node is held behind
//! an `Arc` since both the engine and every in-flight closure must be able
//! to reach it.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::engine::{
    CommittedEntry, EngineOptions, LeaderChangeContext, LogTask, PeerId,
    RaftEngine, SnapshotReader, SnapshotWriter, StateMachine,
};
use crate::fsadaptor::{FsAdaptor, LocalFsAdaptor};
use crate::node::operation::{LogEntryKind, OpClosure, OpContext};
use crate::node::options::{parse_uri, CopysetIdentity, CopysetNodeOptions};
use crate::node::request::{
    ChunkOp, ChunkRequest, ChunkResponse, ChunkStatus,
};
use crate::store::ChunkStore;
use crate::utils::CopysetError;

use async_trait::async_trait;

use tokio::sync::oneshot;

/// One copyset replica instance.
pub struct CopysetNode {
    /// Identity of the copyset this node replicates.
    identity: CopysetIdentity,

    /// Initial peer configuration of the group.
    initial_conf: Vec<PeerId>,

    /// Own peer identity; set at `init()`. Sub-index is always 0: a
    /// chunkserver process never holds two replicas of the same copyset.
    peer_id: Option<PeerId>,

    /// Chunk store handle, exclusively owned by this node.
    store: Arc<dyn ChunkStore>,

    /// Filesystem capability for snapshot I/O; set at `init()` from the
    /// chunk data URI's protocol tag.
    fs: Option<Arc<dyn FsAdaptor>>,

    /// Absolute path of the live chunk data directory,
    /// e.g. `/mnt/sda/1-10001/data`.
    chunk_data_apath: PathBuf,

    /// Path of the data directory relative to a snapshot root (`data`),
    /// so snapshot transfer ships only the relative subtree.
    chunk_data_rpath: PathBuf,

    /// Maximum accepted write payload size in bytes.
    max_chunk_size: usize,

    /// Engine options assembled at `init()`, consumed by `run()`.
    engine_options: Option<EngineOptions>,

    /// Replicated log engine handle; set once at `run()`.
    engine: OnceLock<Arc<dyn RaftEngine>>,

    /// Current leadership term; -1 when not leader. Written by the
    /// engine's callback tasks, read by request-handling tasks, hence the
    /// acquire/release discipline.
    leader_term: AtomicI64,
}

// CopysetNode lifecycle
impl CopysetNode {
    /// Creates a new copyset node. Not usable until `init()` + `run()`.
    pub fn new(
        identity: CopysetIdentity,
        initial_conf: Vec<PeerId>,
        store: Arc<dyn ChunkStore>,
    ) -> Self {
        CopysetNode {
            identity,
            initial_conf,
            peer_id: None,
            store,
            fs: None,
            chunk_data_apath: PathBuf::new(),
            chunk_data_rpath: PathBuf::new(),
            max_chunk_size: 0,
            engine_options: None,
            engine: OnceLock::new(),
            leader_term: AtomicI64::new(-1),
        }
    }

    /// Wires up paths, opens the chunk store, and assembles the engine
    /// options. Fails without leaving anything half-initialized.
    pub async fn init(
        &mut self,
        options: &CopysetNodeOptions,
    ) -> Result<(), CopysetError> {
        let group_id = self.identity.group_id();

        let (protocol, chunk_data_dir) = parse_uri(&options.chunk_data_uri)?;
        let fs: Arc<dyn FsAdaptor> = match protocol {
            "local" => Arc::new(LocalFsAdaptor),
            _ => {
                return logged_err!(
                    "unsupported chunk data uri protocol '{}'",
                    protocol
                );
            }
        };

        // every fallible step happens before the store is opened, so a
        // failed init leaves nothing half-initialized
        let addr: SocketAddr =
            format!("{}:{}", options.ip, options.port).parse()?;
        let peer_id = PeerId::new(addr, 0);

        let chunk_data_apath =
            PathBuf::from(chunk_data_dir).join(&group_id).join("data");
        if let Err(e) = self.store.initialize(&chunk_data_apath).await {
            return logged_err!(
                "chunk store init at '{}' failed: {}",
                chunk_data_apath.display(),
                e
            );
        }
        self.chunk_data_apath = chunk_data_apath;
        self.chunk_data_rpath = PathBuf::from("data");
        self.fs = Some(fs);
        self.max_chunk_size = options.max_chunk_size;
        self.peer_id = Some(peer_id);

        self.engine_options = Some(EngineOptions {
            group_id: group_id.clone(),
            peer_id,
            initial_conf: self.initial_conf.clone(),
            election_timeout_ms: options.election_timeout_ms,
            snapshot_interval_s: options.snapshot_interval_s,
            log_uri: format!("{}/{}/log", options.log_uri, group_id),
            raft_meta_uri: format!(
                "{}/{}/raft_meta",
                options.raft_meta_uri, group_id
            ),
            raft_snapshot_uri: format!(
                "{}/{}/raft_snapshot",
                options.raft_snapshot_uri, group_id
            ),
            disable_cli: options.disable_cli,
            usercode_dedicated_worker: options.usercode_dedicated_worker,
        });

        Ok(())
    }

    /// Starts the given replicated log engine with this node registered as
    /// its state-machine callback target.
    pub async fn run(
        self: &Arc<Self>,
        engine: Arc<dyn RaftEngine>,
    ) -> Result<(), CopysetError> {
        let options = match &self.engine_options {
            Some(options) => options.clone(),
            None => return logged_err!("run() called before init()"),
        };

        if let Err(e) = engine
            .init(options, Arc::clone(self) as Arc<dyn StateMachine>)
            .await
        {
            return logged_err!(
                "fail to start raft engine of {}: {}",
                self.identity,
                e
            );
        }
        if self.engine.set(engine).is_err() {
            return logged_err!("raft engine of {} already running", self.identity);
        }
        Ok(())
    }

    /// Shuts the engine down, waits for all in-flight tasks (including
    /// queued applies) to drain, THEN closes the chunk store. The store
    /// must outlive every possible apply callback. A shutdown error is
    /// logged but never skips the drain or the store close.
    pub async fn fini(&self) {
        if let Some(engine) = self.engine.get() {
            if let Err(e) = engine.shutdown().await {
                pf_error!(
                    "raft engine shutdown of {} failed: {}",
                    self.identity,
                    e
                );
            }
            engine.join().await;
        }
        self.store.uninitialize().await;
    }

    pub fn identity(&self) -> CopysetIdentity {
        self.identity
    }

    /// Current leadership term; -1 when not leader.
    pub fn leader_term(&self) -> i64 {
        self.leader_term.load(Ordering::Acquire)
    }

    pub fn chunk_data_apath(&self) -> &Path {
        &self.chunk_data_apath
    }

    pub fn chunk_data_rpath(&self) -> &Path {
        &self.chunk_data_rpath
    }

    pub fn engine_options(&self) -> Option<&EngineOptions> {
        self.engine_options.as_ref()
    }

    fn fs(&self) -> Result<&dyn FsAdaptor, CopysetError> {
        match &self.fs {
            Some(fs) => Ok(fs.as_ref()),
            None => logged_err!("copyset node {} not initialized", self.identity),
        }
    }
}

// CopysetNode request handling
impl CopysetNode {
    pub fn read_chunk(
        &self,
        request: ChunkRequest,
    ) -> Result<oneshot::Receiver<ChunkResponse>, CopysetError> {
        self.apply_chunk_request(request)
    }

    pub fn write_chunk(
        &self,
        request: ChunkRequest,
    ) -> Result<oneshot::Receiver<ChunkResponse>, CopysetError> {
        self.apply_chunk_request(request)
    }

    pub fn delete_chunk(
        &self,
        request: ChunkRequest,
    ) -> Result<oneshot::Receiver<ChunkResponse>, CopysetError> {
        self.apply_chunk_request(request)
    }

    /// Builds the redirect response pointing at the believed-current
    /// leader, if one is known.
    fn redirect_response(&self, leader: Option<PeerId>) -> ChunkResponse {
        let mut response = ChunkResponse::with_status(ChunkStatus::Redirected);
        if let Some(leader) = leader {
            response.redirect = Some(leader.to_string());
        }
        response
    }

    /// Common path of all three chunk operations: check leadership once up
    /// front, encode the operation, and hand it to the engine. Returns a
    /// receiver fulfilled exactly once, either from the apply callback after
    /// commit or from the engine's failure path. The leadership check is
    /// best-effort; term and leader can still change before the apply.
    pub fn apply_chunk_request(
        &self,
        request: ChunkRequest,
    ) -> Result<oneshot::Receiver<ChunkResponse>, CopysetError> {
        let (tx, rx) = oneshot::channel();

        let engine = match self.engine.get() {
            Some(engine) => engine,
            None => {
                let _ = tx.send(self.redirect_response(None));
                return Ok(rx);
            }
        };
        let term = self.leader_term.load(Ordering::Acquire);
        let leader = engine.leader_id();
        if term < 0 || leader.is_none() || leader != self.peer_id {
            let _ = tx.send(self.redirect_response(leader));
            return Ok(rx);
        }

        if let ChunkOp::Write { ref data, .. } = request.op {
            if data.len() > self.max_chunk_size {
                pf_warn!(
                    "rejecting write of {} bytes to chunk {} (max {})",
                    data.len(),
                    request.chunk_id(),
                    self.max_chunk_size
                );
                let _ = tx
                    .send(ChunkResponse::with_status(ChunkStatus::InvalidRequest));
                return Ok(rx);
            }
        }

        let ctx = OpContext::new(request);
        let data = match ctx.encode() {
            Ok(data) => data,
            Err(e) => {
                pf_error!("chunk op request encode failure: {}", e);
                let _ =
                    tx.send(ChunkResponse::with_status(ChunkStatus::EncodeError));
                return Ok(rx);
            }
        };

        engine.apply(LogTask {
            data,
            closure: Some(OpClosure::new(ctx, tx)),
        })?;
        Ok(rx)
    }
}

// CopysetNode state-machine callbacks (engine -> node)
#[async_trait]
impl StateMachine for CopysetNode {
    async fn on_apply(
        &self,
        entries: Vec<CommittedEntry>,
    ) -> Result<(), CopysetError> {
        for entry in entries {
            if entry.data.is_empty() {
                return logged_err!(
                    "empty log entry at index {}",
                    entry.index
                );
            }
            let tag = entry.data[0];
            let body = &entry.data[1..];

            match LogEntryKind::from_u8(tag) {
                Some(LogEntryKind::ChunkOp) => {
                    if let Some(closure) = entry.closure {
                        // this replica originated the task and is live;
                        // apply the in-memory op context directly
                        match closure
                            .op_context()
                            .apply(self.store.as_ref())
                            .await
                        {
                            Ok(response) => closure.complete(response),
                            Err(e) => {
                                // store-level failure is surfaced via the
                                // response status, not by halting the
                                // state machine
                                pf_error!(
                                    "chunk op apply failed at index {}: {}",
                                    entry.index,
                                    e
                                );
                                closure.fail(ChunkStatus::StoreError);
                            }
                        }
                    } else {
                        // replaying the log after restart, or applying an
                        // entry replicated from the leader; decode the op
                        // from the raw entry bytes, nothing to complete
                        let ctx = OpContext::decode(body)?;
                        if let Err(e) = ctx.apply(self.store.as_ref()).await {
                            pf_error!(
                                "chunk op replay failed at index {}: {}",
                                entry.index,
                                e
                            );
                        }
                    }
                }
                None => {
                    // an entry this state machine does not understand must
                    // never be skipped over
                    return logged_err!(
                        "unknown log entry tag {} at index {}",
                        tag,
                        entry.index
                    );
                }
            }
        }
        Ok(())
    }

    async fn on_snapshot_save(
        &self,
        writer: &mut SnapshotWriter,
    ) -> Result<(), CopysetError> {
        let names = match self.fs()?.list_dir(&self.chunk_data_apath).await {
            Ok(names) => names,
            Err(e) => {
                return logged_err!(
                    "snapshot save: listing '{}' failed (missing or no \
                     permission): {}",
                    self.chunk_data_apath.display(),
                    e
                );
            }
        };
        for name in names {
            // /mnt/sda/1-10001/data/100001.chunk -> data/100001.chunk
            writer.add_file(
                self.chunk_data_apath.join(&name),
                self.chunk_data_rpath.join(&name),
            );
        }
        Ok(())
    }

    async fn on_snapshot_load(
        &self,
        reader: &SnapshotReader,
    ) -> Result<(), CopysetError> {
        let snap_data_dir = reader.path().join(&self.chunk_data_rpath);
        let fs = self.fs()?;

        let names = match fs.list_dir(&snap_data_dir).await {
            Ok(names) => names,
            Err(e) => {
                return logged_err!(
                    "snapshot load: listing '{}' failed: {}",
                    snap_data_dir.display(),
                    e
                );
            }
        };
        for name in names {
            let src = snap_data_dir.join(&name);
            let dst = self.chunk_data_apath.join(&name);
            if let Err(e) = fs.rename(&src, &dst).await {
                // a partially installed snapshot must not pass as success
                return logged_err!(
                    "snapshot load: rename '{}' -> '{}' failed: {}",
                    src.display(),
                    dst.display(),
                    e
                );
            }
        }
        Ok(())
    }

    fn on_leader_start(&self, term: i64) {
        self.leader_term.store(term, Ordering::Release);
        pf_info!("{} became leader at term {}", self.identity, term);
    }

    fn on_leader_stop(&self, status: CopysetError) {
        self.leader_term.store(-1, Ordering::Release);
        pf_info!("{} stepped down: {}", self.identity, status);
    }

    fn on_error(&self, err: CopysetError) {
        pf_error!("{} met raft engine error: {}", self.identity, err);
    }

    fn on_configuration_committed(&self, conf: &[PeerId]) {
        let peers: Vec<String> = conf.iter().map(|p| p.to_string()).collect();
        pf_info!(
            "{} committed configuration [{}]",
            self.identity,
            peers.join(", ")
        );
    }

    fn on_start_following(&self, ctx: LeaderChangeContext) {
        pf_info!("{} starts following {}", self.identity, ctx);
    }

    fn on_stop_following(&self, ctx: LeaderChangeContext) {
        pf_info!("{} stops following {}", self.identity, ctx);
    }

    fn on_shutdown(&self) {
        pf_info!("{} is shutdown", self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::store::mem::MemChunkStore;
    use crate::store::FsChunkStore;

    use bytes::Bytes;

    use tokio::fs;

    fn test_options(chunk_data_uri: &str) -> CopysetNodeOptions {
        CopysetNodeOptions {
            chunk_data_uri: chunk_data_uri.into(),
            ..Default::default()
        }
    }

    fn own_peer() -> PeerId {
        PeerId::new("127.0.0.1:8200".parse().unwrap(), 0)
    }

    fn write_req(chunk_id: u64, data: &'static [u8]) -> ChunkRequest {
        ChunkRequest {
            logic_pool_id: 1,
            copyset_id: 10001,
            op: ChunkOp::Write {
                chunk_id,
                data: Bytes::from_static(data),
            },
        }
    }

    fn delete_req(chunk_id: u64) -> ChunkRequest {
        ChunkRequest {
            logic_pool_id: 1,
            copyset_id: 10001,
            op: ChunkOp::Delete {
                chunk_id,
                version: None,
            },
        }
    }

    async fn setup_node(
        uri: &str,
    ) -> Result<
        (Arc<CopysetNode>, Arc<MemChunkStore>, Arc<MockEngine>),
        CopysetError,
    > {
        let store = Arc::new(MemChunkStore::new());
        let mut node = CopysetNode::new(
            CopysetIdentity::new(1, 10001),
            vec![own_peer()],
            store.clone() as Arc<dyn ChunkStore>,
        );
        node.init(&test_options(uri)).await?;
        let node = Arc::new(node);
        let engine = Arc::new(MockEngine::new());
        node.run(engine.clone() as Arc<dyn RaftEngine>).await?;
        Ok((node, store, engine))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn init_derives_paths() -> Result<(), CopysetError> {
        let (node, store, _) = setup_node("local:///mnt/sda").await?;
        assert_eq!(
            node.chunk_data_apath(),
            Path::new("/mnt/sda/1-10001/data")
        );
        assert_eq!(node.chunk_data_rpath(), Path::new("data"));
        assert_eq!(
            store.dir.lock().unwrap().as_deref(),
            Some(Path::new("/mnt/sda/1-10001/data"))
        );

        let options = node.engine_options().unwrap();
        assert_eq!(options.group_id, "1-10001");
        assert_eq!(options.peer_id, own_peer());
        assert_eq!(options.log_uri, "/log/1-10001/log");
        assert_eq!(options.raft_meta_uri, "/raft_meta/1-10001/raft_meta");
        assert_eq!(
            options.raft_snapshot_uri,
            "/raft_snapshot/1-10001/raft_snapshot"
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn init_rejects_unknown_protocol() -> Result<(), CopysetError> {
        let store = Arc::new(MemChunkStore::new());
        let mut node = CopysetNode::new(
            CopysetIdentity::new(1, 10001),
            vec![own_peer()],
            store.clone() as Arc<dyn ChunkStore>,
        );
        assert!(node.init(&test_options("hdfs:///mnt/sda")).await.is_err());
        // nothing was initialized
        assert!(store.dir.lock().unwrap().is_none());
        assert!(node.engine_options().is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn init_bad_ip_leaves_store_closed() -> Result<(), CopysetError> {
        let store = Arc::new(MemChunkStore::new());
        let mut node = CopysetNode::new(
            CopysetIdentity::new(1, 10001),
            vec![own_peer()],
            store.clone() as Arc<dyn ChunkStore>,
        );
        let mut options = test_options("local:///mnt/sda");
        options.ip = "not an ip".into();
        assert!(node.init(&options).await.is_err());
        // the store was never opened and nothing else was wired up
        assert!(store.dir.lock().unwrap().is_none());
        assert!(node.engine_options().is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn run_before_init_fails() {
        let store = Arc::new(MemChunkStore::new());
        let node = Arc::new(CopysetNode::new(
            CopysetIdentity::new(1, 10001),
            vec![own_peer()],
            store as Arc<dyn ChunkStore>,
        ));
        let engine = Arc::new(MockEngine::new());
        assert!(node.run(engine as Arc<dyn RaftEngine>).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn run_fails_on_engine_start_error() -> Result<(), CopysetError> {
        let store = Arc::new(MemChunkStore::new());
        let mut node = CopysetNode::new(
            CopysetIdentity::new(1, 10001),
            vec![own_peer()],
            store as Arc<dyn ChunkStore>,
        );
        node.init(&test_options("local:///mnt/sda")).await?;
        let node = Arc::new(node);
        let engine = Arc::new(MockEngine {
            fail_init: true,
            ..Default::default()
        });
        assert!(node.run(engine as Arc<dyn RaftEngine>).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn redirect_when_no_leader() -> Result<(), CopysetError> {
        let (node, _, engine) = setup_node("local:///mnt/sda").await?;
        let rx = node.write_chunk(write_req(100001, b"abc"))?;
        let response = rx.await?;
        assert_eq!(response.status, ChunkStatus::Redirected);
        assert_eq!(response.redirect, None);
        // never reached the engine
        assert_eq!(engine.apply_count(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn redirect_to_other_leader() -> Result<(), CopysetError> {
        let (node, _, engine) = setup_node("local:///mnt/sda").await?;
        let other = PeerId::new("10.0.0.7:8200".parse().unwrap(), 0);
        engine.set_leader(Some(other));
        // stale local term with a different actual leader; identity check
        // must still redirect
        node.on_leader_start(2);

        let rx = node.read_chunk(ChunkRequest {
            logic_pool_id: 1,
            copyset_id: 10001,
            op: ChunkOp::Read { chunk_id: 100001 },
        })?;
        let response = rx.await?;
        assert_eq!(response.status, ChunkStatus::Redirected);
        assert_eq!(response.redirect, Some("10.0.0.7:8200:0".into()));
        assert_eq!(engine.apply_count(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn leader_commit_completes_success() -> Result<(), CopysetError> {
        let (node, store, engine) = setup_node("local:///mnt/sda").await?;
        engine.set_leader(Some(own_peer()));
        node.on_leader_start(3);
        assert_eq!(node.leader_term(), 3);

        let rx = node.write_chunk(write_req(100001, b"chunk contents"))?;
        assert_eq!(engine.apply_count(), 1);

        engine.commit_all().await?;
        let response = rx.await?;
        assert_eq!(response.status, ChunkStatus::Success);
        // exactly one store mutation
        assert_eq!(*store.trace.lock().unwrap(), vec!["write 100001"]);
        assert_eq!(
            store.chunks.lock().unwrap().get(&100001),
            Some(&Bytes::from_static(b"chunk contents"))
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn store_failure_surfaces_status_only() -> Result<(), CopysetError> {
        let (node, store, engine) = setup_node("local:///mnt/sda").await?;
        engine.set_leader(Some(own_peer()));
        node.on_leader_start(1);

        let rx = node.write_chunk(write_req(5, b"doomed"))?;
        store.set_fail_ops(true);
        // apply itself must not halt the state machine
        engine.commit_all().await?;
        assert_eq!(rx.await?.status, ChunkStatus::StoreError);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn applies_follow_commit_order() -> Result<(), CopysetError> {
        let (node, store, engine) = setup_node("local:///mnt/sda").await?;
        engine.set_leader(Some(own_peer()));
        node.on_leader_start(1);

        let rx1 = node.write_chunk(write_req(1, b"one"))?;
        let rx2 = node.write_chunk(write_req(2, b"two"))?;
        let rx3 = node.delete_chunk(delete_req(1))?;
        engine.commit_all().await?;

        for rx in [rx1, rx2, rx3] {
            assert_eq!(rx.await?.status, ChunkStatus::Success);
        }
        assert_eq!(
            *store.trace.lock().unwrap(),
            vec!["write 1", "write 2", "delete 1"]
        );
        assert!(!store.chunks.lock().unwrap().contains_key(&1));
        assert!(store.chunks.lock().unwrap().contains_key(&2));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn replay_from_raw_bytes_matches_live_apply(
    ) -> Result<(), CopysetError> {
        // live apply through the closure path
        let (node, store, engine) = setup_node("local:///mnt/sda").await?;
        engine.set_leader(Some(own_peer()));
        node.on_leader_start(1);
        let rx = node.write_chunk(write_req(100001, b"recovered bytes"))?;
        engine.commit_all().await?;
        assert_eq!(rx.await?.status, ChunkStatus::Success);

        // replay the same encoded entry on a fresh replica, closure-less
        let encoded =
            OpContext::new(write_req(100001, b"recovered bytes")).encode()?;
        let (replayed, replay_store, _) =
            setup_node("local:///mnt/sda").await?;
        replayed
            .on_apply(vec![CommittedEntry {
                index: 1,
                data: encoded,
                closure: None,
            }])
            .await?;

        assert_eq!(
            *replay_store.chunks.lock().unwrap(),
            *store.chunks.lock().unwrap()
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn unknown_entry_tag_halts_batch() -> Result<(), CopysetError> {
        let (node, store, _) = setup_node("local:///mnt/sda").await?;
        let valid = OpContext::new(write_req(9, b"after")).encode()?;
        let result = node
            .on_apply(vec![
                CommittedEntry {
                    index: 1,
                    data: Bytes::from_static(&[0x7f, 0x00]),
                    closure: None,
                },
                CommittedEntry {
                    index: 2,
                    data: valid,
                    closure: None,
                },
            ])
            .await;
        assert!(result.is_err());
        // entry after the corrupted one was never applied
        assert!(store.trace.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn oversized_write_rejected_locally() -> Result<(), CopysetError> {
        let store = Arc::new(MemChunkStore::new());
        let mut node = CopysetNode::new(
            CopysetIdentity::new(1, 10001),
            vec![own_peer()],
            store as Arc<dyn ChunkStore>,
        );
        let mut options = test_options("local:///mnt/sda");
        options.max_chunk_size = 8;
        node.init(&options).await?;
        let node = Arc::new(node);
        let engine = Arc::new(MockEngine::new());
        node.run(engine.clone() as Arc<dyn RaftEngine>).await?;
        engine.set_leader(Some(own_peer()));
        node.on_leader_start(1);

        let rx = node.write_chunk(write_req(1, b"way too large payload"))?;
        assert_eq!(rx.await?.status, ChunkStatus::InvalidRequest);
        assert_eq!(engine.apply_count(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn leader_term_transitions() -> Result<(), CopysetError> {
        let (node, _, _) = setup_node("local:///mnt/sda").await?;
        assert_eq!(node.leader_term(), -1);
        node.on_leader_start(5);
        assert_eq!(node.leader_term(), 5);
        node.on_leader_stop(CopysetError::msg("lost quorum"));
        assert_eq!(node.leader_term(), -1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn snapshot_save_missing_dir_reports_error(
    ) -> Result<(), CopysetError> {
        let (node, _, _) = setup_node("local:///tmp/test-copyset-missing")
            .await?;
        // MemChunkStore never created the data dir on disk
        let mut writer = SnapshotWriter::new();
        assert!(node.on_snapshot_save(&mut writer).await.is_err());
        assert!(writer.files().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn snapshot_save_load_round_trip() -> Result<(), CopysetError> {
        let root = "/tmp/test-copyset-snap";
        if fs::try_exists(root).await? {
            fs::remove_dir_all(root).await?;
        }

        // a real file-backed store so snapshot files exist on disk
        let store = Arc::new(FsChunkStore::new());
        let mut node = CopysetNode::new(
            CopysetIdentity::new(1, 10001),
            vec![own_peer()],
            store.clone() as Arc<dyn ChunkStore>,
        );
        node.init(&test_options(&format!("local://{}", root))).await?;
        let node = Arc::new(node);
        let engine = Arc::new(MockEngine::new());
        node.run(engine.clone() as Arc<dyn RaftEngine>).await?;

        store
            .write_chunk(100001, Bytes::from_static(b"first chunk bytes"))
            .await?;
        store
            .write_chunk(100002, Bytes::from_static(b"second chunk bytes"))
            .await?;

        // save: register the point-in-time file set
        let mut writer = SnapshotWriter::new();
        node.on_snapshot_save(&mut writer).await?;
        assert_eq!(writer.files().len(), 2);

        // emulate the engine persisting a snapshot instance from the
        // registered absolute -> relative mapping
        let snap_dir =
            PathBuf::from(root).join("1-10001/raft_snapshot/snapshot_0001");
        for (src, rel) in writer.files() {
            let dst = snap_dir.join(rel);
            fs::create_dir_all(dst.parent().unwrap()).await?;
            fs::copy(src, &dst).await?;
        }

        // wipe the live data dir, then load the snapshot back in
        for name in ["100001.chunk", "100002.chunk"] {
            fs::remove_file(node.chunk_data_apath().join(name)).await?;
        }
        node.on_snapshot_load(&SnapshotReader::new(&snap_dir)).await?;

        assert_eq!(
            store.read_chunk(100001).await?,
            Bytes::from_static(b"first chunk bytes")
        );
        assert_eq!(
            store.read_chunk(100002).await?,
            Bytes::from_static(b"second chunk bytes")
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn snapshot_load_missing_subdir_fails() -> Result<(), CopysetError> {
        let (node, _, _) = setup_node("local:///mnt/sda").await?;
        let reader =
            SnapshotReader::new("/tmp/test-copyset-snap-nonexist/snapshot_01");
        assert!(node.on_snapshot_load(&reader).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn fini_closes_store() -> Result<(), CopysetError> {
        let (node, store, engine) = setup_node("local:///mnt/sda").await?;
        node.fini().await;
        assert!(*engine.joined.lock().unwrap());
        assert!(store.dir.lock().unwrap().is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn fini_cleans_up_despite_shutdown_error() -> Result<(), CopysetError>
    {
        let store = Arc::new(MemChunkStore::new());
        let mut node = CopysetNode::new(
            CopysetIdentity::new(1, 10001),
            vec![own_peer()],
            store.clone() as Arc<dyn ChunkStore>,
        );
        node.init(&test_options("local:///mnt/sda")).await?;
        let node = Arc::new(node);
        let engine = Arc::new(MockEngine {
            fail_shutdown: true,
            ..Default::default()
        });
        node.run(engine.clone() as Arc<dyn RaftEngine>).await?;

        node.fini().await;
        // still drained the engine and closed the store
        assert!(*engine.joined.lock().unwrap());
        assert!(store.dir.lock().unwrap().is_none());
        Ok(())
    }
}
