//! Lock-disciplined slot buffers mediating between ingesting writers and
//! pipeline readers.
//!
//! Each configured data type owns one [`DataBuffer`]: a fixed pool of byte
//! slots allocated once at construction and reused indefinitely. Writers
//! obtain a [`WriteHandle`] (at most one outstanding per buffer), readers
//! obtain shared [`ReadHandle`]s onto the current committed chunk, and every
//! successful commit stamps a strictly increasing [`VersionId`] so remote
//! consumers can revalidate cached service data without transferring it.
//!
//! The two retention policies differ only in what happens after a read:
//! stream chunks are consumed (the slot recycles once its readers release),
//! service values stay current until superseded by a newer commit.

mod data_buffer;
pub mod registry;

pub use data_buffer::{DataBuffer, ReadHandle, WriteHandle};
pub use registry::BufferRegistry;

use crate::config::BufferKind;

/// Per-buffer commit counter exposed to remote consumers for change
/// detection. Strictly increases with every successful commit.
pub type VersionId = u64;

/// Retention policy selected at buffer construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Ring of slots; a chunk is transient and eligible for reuse once all
    /// readers that saw it have released.
    Stream,
    /// Single current value, retained until superseded and revalidated by
    /// version comparison.
    Service,
}

impl From<BufferKind> for RetentionPolicy {
    fn from(kind: BufferKind) -> Self {
        match kind {
            BufferKind::Stream => RetentionPolicy::Stream,
            BufferKind::Service => RetentionPolicy::Service,
        }
    }
}
