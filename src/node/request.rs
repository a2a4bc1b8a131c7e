//! Wire-level chunk request/response shapes.
//!
//! Only the fields relevant to the copyset core are modeled here; the RPC
//! transport carrying them is out of scope.

use crate::store::{ChunkId, ChunkVersion};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Logical storage pool ID type.
pub type LogicPoolId = u32;

/// Copyset ID type (unique within a logical pool).
pub type CopysetId = u32;

/// One client chunk operation.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ChunkOp {
    /// Read the full contents of a chunk.
    Read { chunk_id: ChunkId },

    /// Write (overwrite) the full contents of a chunk.
    Write { chunk_id: ChunkId, data: Bytes },

    /// Delete a chunk, or one versioned chunk snapshot if `version` given.
    Delete {
        chunk_id: ChunkId,
        version: Option<ChunkVersion>,
    },
}

/// Request received for a chunk operation on one copyset.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub logic_pool_id: LogicPoolId,
    pub copyset_id: CopysetId,
    pub op: ChunkOp,
}

impl ChunkRequest {
    /// Target chunk of this request.
    pub fn chunk_id(&self) -> ChunkId {
        match self.op {
            ChunkOp::Read { chunk_id } => chunk_id,
            ChunkOp::Write { chunk_id, .. } => chunk_id,
            ChunkOp::Delete { chunk_id, .. } => chunk_id,
        }
    }
}

/// Status code carried in every chunk response.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ChunkStatus {
    /// Operation committed and applied.
    Success,

    /// This node is not the leader; retry at `redirect` if present.
    Redirected,

    /// Request rejected before submission (e.g. oversized write).
    InvalidRequest,

    /// Operation context could not be serialized; nothing was submitted.
    EncodeError,

    /// The chunk store failed the operation during apply.
    StoreError,

    /// The replicated log engine failed the submitted task.
    EngineError,
}

/// Reply to a chunk request.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub status: ChunkStatus,

    /// Believed-current leader address, set on `Redirected` (best-effort;
    /// absent if no leader is known).
    pub redirect: Option<String>,

    /// Chunk contents, set on successful reads.
    pub data: Option<Bytes>,
}

impl ChunkResponse {
    pub fn with_status(status: ChunkStatus) -> Self {
        ChunkResponse {
            status,
            redirect: None,
            data: None,
        }
    }
}
