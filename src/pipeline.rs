//! Pipeline contract and the per-cycle delivered-data map.

use crate::buffer::{ReadHandle, VersionId};
use crate::driver::DriverControl;
use crate::error::PipelineResult;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};

/// The set of named data types a pipeline declares it needs before it may
/// run, split by retention class. Immutable once registered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataRequirements {
    stream: BTreeSet<String>,
    service: BTreeSet<String>,
}

impl DataRequirements {
    /// An empty requirement set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required stream data type.
    pub fn with_stream(mut self, name: impl Into<String>) -> Self {
        self.stream.insert(name.into());
        self
    }

    /// Adds a required service data type.
    pub fn with_service(mut self, name: impl Into<String>) -> Self {
        self.service.insert(name.into());
        self
    }

    /// Required stream data type names.
    pub fn stream(&self) -> &BTreeSet<String> {
        &self.stream
    }

    /// Required service data type names.
    pub fn service(&self) -> &BTreeSet<String> {
        &self.service
    }

    /// Iterates over all required names, stream first.
    pub fn all_names(&self) -> impl Iterator<Item = &str> {
        self.stream
            .iter()
            .chain(self.service.iter())
            .map(String::as_str)
    }

    /// Whether no data is required at all.
    pub fn is_empty(&self) -> bool {
        self.stream.is_empty() && self.service.is_empty()
    }

    /// Whether two requirement sets share any stream data type. Stream data
    /// is never copied, so sharing would let two pipelines race on one slot.
    pub fn intersects_stream(&self, other: &Self) -> bool {
        self.stream.intersection(&other.stream).next().is_some()
    }

    /// Whether every required name is present in the delivered map.
    pub fn is_satisfied_by(&self, delivered: &DeliveredData) -> bool {
        self.all_names().all(|name| delivered.contains(name))
    }
}

/// One delivered chunk: either a local read handle (released when the map is
/// dropped at the end of the cycle) or bytes fetched over the network.
pub enum DeliveredChunk {
    /// Handle onto a local buffer slot.
    Local(ReadHandle),
    /// Chunk fetched through the data-client bridge.
    Remote {
        /// Payload bytes.
        bytes: Bytes,
        /// Version reported by the serving buffer.
        version: VersionId,
    },
}

impl DeliveredChunk {
    /// The chunk contents.
    pub fn data(&self) -> &[u8] {
        match self {
            DeliveredChunk::Local(handle) => handle.data(),
            DeliveredChunk::Remote { bytes, .. } => bytes,
        }
    }

    /// Version stamped by the owning buffer at commit time.
    pub fn version(&self) -> VersionId {
        match self {
            DeliveredChunk::Local(handle) => handle.version(),
            DeliveredChunk::Remote { version, .. } => *version,
        }
    }

    /// Chunk length in bytes.
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Whether the chunk is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }
}

/// The per-cycle map of data type name to delivered chunk. Built fresh by the
/// data client each dispatch cycle; dropping it releases all consumed read
/// handles.
#[derive(Default)]
pub struct DeliveredData {
    chunks: HashMap<String, DeliveredChunk>,
}

impl DeliveredData {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a chunk under its data type name.
    pub fn insert(&mut self, name: impl Into<String>, chunk: DeliveredChunk) {
        self.chunks.insert(name.into(), chunk);
    }

    /// Looks up a delivered chunk.
    pub fn get(&self, name: &str) -> Option<&DeliveredChunk> {
        self.chunks.get(name)
    }

    /// Whether a chunk was delivered for this name.
    pub fn contains(&self, name: &str) -> bool {
        self.chunks.contains_key(name)
    }

    /// Names delivered this cycle.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.chunks.keys().map(String::as_str)
    }

    /// Number of delivered chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether nothing was delivered this cycle.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// A processing pipeline registered with the driver.
///
/// Pipelines run to completion on the driver thread, one at a time; `run` is
/// invoked exactly when every name in [`required_data`](Self::required_data)
/// is present in the cycle's delivered map.
pub trait Pipeline: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// One-time setup, called at registration.
    fn init(&mut self) -> PipelineResult<()> {
        Ok(())
    }

    /// The data types this pipeline needs before it may run.
    fn required_data(&self) -> DataRequirements;

    /// Processes one cycle's data. Call [`DriverControl::stop`] to request a
    /// driver stop at the end of the current iteration.
    fn run(&mut self, data: &DeliveredData, control: &DriverControl) -> PipelineResult<()>;
}
