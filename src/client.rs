//! Data-client contract and the in-process client.
//!
//! A data client is the driver's single source of data: once per cycle the
//! driver calls [`DataClient::get_data`] and matches the returned map against
//! each registration. [`DirectDataClient`] serves single-host deployments
//! straight from a [`BufferRegistry`]; `network::client::RemoteDataClient`
//! implements the same contract over the wire.

use crate::buffer::BufferRegistry;
use crate::error::PipelineResult;
use crate::pipeline::{DataRequirements, DeliveredChunk, DeliveredData};
use std::sync::Arc;
use std::time::Duration;

/// Source of one cycle's delivered data. Safe to call once per cycle from the
/// driver thread.
pub trait DataClient {
    /// The requirement sets this client was built to satisfy, one per
    /// registered pipeline.
    fn data_requirements(&self) -> &[DataRequirements];

    /// Gathers whatever data is currently available for the requirement
    /// sets. Transient transport and protocol failures are logged and yield
    /// an incomplete map; only configuration-class problems are errors.
    fn get_data(&mut self) -> PipelineResult<DeliveredData>;
}

/// Client that reads local buffers directly, bypassing the network bridge.
/// Suitable when the data rates can be handled inside a single process.
pub struct DirectDataClient {
    registry: Arc<BufferRegistry>,
    requirements: Vec<DataRequirements>,
    stream_wait: Duration,
}

impl DirectDataClient {
    /// Creates a client over `registry` for the given requirement sets.
    /// `stream_wait` bounds how long one cycle blocks for fresh stream data
    /// before yielding an incomplete map.
    pub fn new(
        registry: Arc<BufferRegistry>,
        requirements: Vec<DataRequirements>,
        stream_wait: Duration,
    ) -> Self {
        Self {
            registry,
            requirements,
            stream_wait,
        }
    }
}

impl DataClient for DirectDataClient {
    fn data_requirements(&self) -> &[DataRequirements] {
        &self.requirements
    }

    fn get_data(&mut self) -> PipelineResult<DeliveredData> {
        let mut delivered = DeliveredData::new();

        for requirements in &self.requirements {
            for name in requirements.stream() {
                if delivered.contains(name) {
                    continue;
                }
                let buffer = self.registry.require(name)?;
                if let Some(handle) = buffer.wait_current(self.stream_wait) {
                    delivered.insert(name.clone(), DeliveredChunk::Local(handle));
                }
            }
            for name in requirements.service() {
                if delivered.contains(name) {
                    continue;
                }
                let buffer = self.registry.require(name)?;
                if let Some(handle) = buffer.acquire_current() {
                    delivered.insert(name.clone(), DeliveredChunk::Local(handle));
                }
            }
        }

        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{DataBuffer, RetentionPolicy};
    use crate::error::PipelineError;

    fn commit(buffer: &Arc<DataBuffer>, payload: &[u8]) {
        let mut handle = buffer.acquire_writable(payload.len()).expect("writable");
        handle.bytes_mut().copy_from_slice(payload);
        handle.commit();
    }

    #[test]
    fn delivers_stream_and_service_data() {
        let mut registry = BufferRegistry::new();
        registry.insert(DataBuffer::new(
            "visibilities",
            RetentionPolicy::Stream,
            2,
            64,
        ));
        registry.insert(DataBuffer::new("antennas", RetentionPolicy::Service, 1, 64));
        let registry = Arc::new(registry);

        commit(registry.require("visibilities").expect("buffer"), b"vis-0");
        commit(registry.require("antennas").expect("buffer"), b"ant-0");

        let requirements = vec![DataRequirements::new()
            .with_stream("visibilities")
            .with_service("antennas")];
        let mut client =
            DirectDataClient::new(Arc::clone(&registry), requirements, Duration::from_millis(10));

        let delivered = client.get_data().expect("cycle");
        assert_eq!(delivered.get("visibilities").map(DeliveredChunk::data), Some(&b"vis-0"[..]));
        assert_eq!(delivered.get("antennas").map(DeliveredChunk::data), Some(&b"ant-0"[..]));
        drop(delivered);

        // Stream data is consumed; service data is retained.
        let delivered = client.get_data().expect("cycle");
        assert!(!delivered.contains("visibilities"));
        assert!(delivered.contains("antennas"));
    }

    #[test]
    fn unknown_type_is_fatal() {
        let registry = Arc::new(BufferRegistry::new());
        let requirements = vec![DataRequirements::new().with_stream("wibble")];
        let mut client = DirectDataClient::new(registry, requirements, Duration::from_millis(1));

        assert!(matches!(
            client.get_data(),
            Err(PipelineError::UnknownDataType(name)) if name == "wibble"
        ));
    }
}
