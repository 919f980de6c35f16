//! # Pipeline Data Framework
//!
//! Core library for the `rust_pipeline` server. It provides concurrent data
//! buffering, asynchronous ingestion from instrument streams, and a
//! requirement-matching dispatch loop that feeds processing pipelines, locally
//! or across a TCP boundary.
//!
//! ## Crate Structure
//!
//! - **`buffer`**: Fixed slot pools with stream/service retention policies,
//!   the write/read handle protocol, and the named [`buffer::BufferRegistry`].
//! - **`client`**: The [`client::DataClient`] trait the dispatch loop pulls
//!   data through, plus the in-process [`client::DirectDataClient`].
//! - **`config`**: TOML-backed settings for buffers, receivers, the network
//!   endpoint and dispatch policy. See [`config::Settings`].
//! - **`driver`**: The [`driver::PipelineDriver`] dispatch loop and its
//!   cooperative stop flag.
//! - **`error`**: The [`error::PipelineError`] taxonomy used across the crate.
//! - **`network`**: Wire protocol, the serving side
//!   ([`network::server::DataServer`]) and the remote
//!   [`network::client::RemoteDataClient`].
//! - **`pipeline`**: The [`pipeline::Pipeline`] trait, data requirements and
//!   the per-cycle delivered-data map.
//! - **`receiver`**: Ingestion tasks committing framed chunks from byte
//!   sources into buffers.

pub mod buffer;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod receiver;
