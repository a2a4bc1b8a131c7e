//! Operation context & completion closure.
//!
//! An `OpContext` carries one client chunk operation from request arrival,
//! through log-entry encoding, to its apply against the chunk store. The
//! same context type serves both live apply (in-memory, via the attached
//! closure) and recovery replay (decoded back from raw log-entry bytes).

use crate::node::request::{ChunkOp, ChunkRequest, ChunkResponse, ChunkStatus};
use crate::store::ChunkStore;
use crate::utils::CopysetError;

use bytes::{BufMut, Bytes, BytesMut};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::sync::oneshot;

/// Leading type tag of every replicated log entry. Decoded via exhaustive
/// match; an unrecognized byte is a fatal corruption signal.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum LogEntryKind {
    ChunkOp = 0,
}

impl LogEntryKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(LogEntryKind::ChunkOp),
            _ => None,
        }
    }
}

/// One client chunk operation in flight through the replication pipeline.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OpContext {
    request: ChunkRequest,
}

impl OpContext {
    pub fn new(request: ChunkRequest) -> Self {
        OpContext { request }
    }

    pub fn request(&self) -> &ChunkRequest {
        &self.request
    }

    /// Serializes this operation into a log-entry payload: one leading
    /// `LogEntryKind` byte followed by the MessagePack-encoded request.
    pub fn encode(&self) -> Result<Bytes, CopysetError> {
        let body = encode_to_vec(&self.request)?;
        let mut buf = BytesMut::with_capacity(1 + body.len());
        buf.put_u8(LogEntryKind::ChunkOp as u8);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Deserializes an operation from a log-entry body (tag byte already
    /// split off by the caller).
    pub fn decode(body: &[u8]) -> Result<Self, CopysetError> {
        Ok(OpContext {
            request: decode_from_slice(body)?,
        })
    }

    /// Applies this operation against the chunk store, producing the
    /// response. Called only for committed log entries.
    pub async fn apply(
        &self,
        store: &dyn ChunkStore,
    ) -> Result<ChunkResponse, CopysetError> {
        let mut response = ChunkResponse::with_status(ChunkStatus::Success);
        match &self.request.op {
            ChunkOp::Read { chunk_id } => {
                response.data = Some(store.read_chunk(*chunk_id).await?);
            }
            ChunkOp::Write { chunk_id, data } => {
                store.write_chunk(*chunk_id, data.clone()).await?;
            }
            ChunkOp::Delete { chunk_id, version } => {
                store.delete_chunk(*chunk_id, *version).await?;
            }
        }
        Ok(response)
    }
}

/// Pairs an operation context with its one-shot completion channel. The
/// engine releases a submitted task's closure exactly once, either through
/// the apply path after commit or through the failure path; either way the
/// original request sees exactly one response.
pub struct OpClosure {
    ctx: OpContext,
    done: oneshot::Sender<ChunkResponse>,
}

impl OpClosure {
    pub fn new(ctx: OpContext, done: oneshot::Sender<ChunkResponse>) -> Self {
        OpClosure { ctx, done }
    }

    pub fn op_context(&self) -> &OpContext {
        &self.ctx
    }

    /// Completes the original request with the given response.
    pub fn complete(self, response: ChunkResponse) {
        // receiver may have been dropped by a departed client; fine
        let _ = self.done.send(response);
    }

    /// Engine-side failure path: the task was not (and will not be)
    /// committed.
    pub fn fail(self, status: ChunkStatus) {
        self.complete(ChunkResponse::with_status(status));
    }
}
