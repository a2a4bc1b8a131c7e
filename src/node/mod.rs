//! Copyset node functionality modules.

mod copyset;
pub mod operation;
mod options;
mod request;

pub use copyset::CopysetNode;
pub use options::{parse_uri, CopysetIdentity, CopysetNodeOptions};
pub use request::{
    ChunkOp, ChunkRequest, ChunkResponse, ChunkStatus, CopysetId, LogicPoolId,
};

pub use operation::{LogEntryKind, OpClosure, OpContext};
