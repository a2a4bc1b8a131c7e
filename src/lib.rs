//! Copyset replica node library.
//!
//! A copyset is one logical shard of chunk data replicated across a fixed
//! set of peer nodes by a consensus engine. This crate implements the
//! replica-side state machine that binds an on-disk chunk store to a
//! replicated log: leadership-checked request submission, ordered apply of
//! committed log entries, and snapshot save/load for log compaction and
//! peer bootstrap. The consensus engine itself and the chunk store's
//! on-disk format are consumed through trait seams.

#[macro_use]
mod utils;

pub mod engine;
pub mod fsadaptor;
pub mod node;
pub mod store;

pub use crate::utils::CopysetError;

// referenced as `$crate::..` from the logging macros
pub use crate::utils::logger_init;
pub use crate::utils::ME;
