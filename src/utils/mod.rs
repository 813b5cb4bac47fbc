//! # Utility Modules
//!
//! Supporting utilities shared by the connection core and the transports.
//!
//! ## Components
//! - **Compression**: zlib, gzip, LZ4 and Zstd with output size limits and thresholds
//! - **Logging**: subscriber setup and the line sink contract
//! - **Metrics**: per-runtime atomic counters

pub mod compression;
pub mod logging;
pub mod metrics;

pub use logging::{init_logging, ConsoleSink, LogSink, SinkMakeWriter};
pub use metrics::{Metrics, MetricsSnapshot};
