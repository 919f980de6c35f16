//! Name-keyed registry of data buffers.
//!
//! Built once from [`Settings`] and passed by reference into the components
//! that need lookups (receivers, data clients, the data server); never a
//! process-wide global.

use crate::buffer::DataBuffer;
use crate::config::Settings;
use crate::error::{PipelineError, PipelineResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps a data type name to its owning buffer. The single point of lookup for
/// both ingestion and dispatch.
pub struct BufferRegistry {
    buffers: HashMap<String, Arc<DataBuffer>>,
}

impl BufferRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
        }
    }

    /// Creates one buffer per configured data type.
    pub fn from_settings(settings: &Settings) -> Self {
        let mut registry = Self::new();
        for (name, cfg) in &settings.buffers {
            registry.insert(DataBuffer::new(
                name.clone(),
                cfg.kind.into(),
                cfg.slots,
                cfg.slot_capacity,
            ));
        }
        registry
    }

    /// Registers a buffer under its data type name. Replaces any previous
    /// buffer for the same name.
    pub fn insert(&mut self, buffer: Arc<DataBuffer>) {
        self.buffers.insert(buffer.name().to_string(), buffer);
    }

    /// Looks up the buffer for a data type name.
    pub fn get(&self, name: &str) -> Option<&Arc<DataBuffer>> {
        self.buffers.get(name)
    }

    /// Like [`get`](Self::get), but an unknown name is a configuration-class
    /// error.
    pub fn require(&self, name: &str) -> PipelineResult<&Arc<DataBuffer>> {
        self.buffers
            .get(name)
            .ok_or_else(|| PipelineError::UnknownDataType(name.to_string()))
    }

    /// Iterates over the registered data type names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.buffers.keys().map(String::as_str)
    }

    /// Number of registered buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}
