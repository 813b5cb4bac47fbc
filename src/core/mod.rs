//! # Core Protocol Components
//!
//! Message envelope, stream framing and payload serialization.
//!
//! ## Components
//! - **Message**: head + payload envelope, flags, tag helpers
//! - **Codec**: Tokio codec for framed and line-delimited streams
//! - **Serialization**: serde payload formats
//!
//! ## Wire Format
//! ```text
//! [Len(4)] [Error(2)] [Cmd(1)] [Act(1)] [Index(2)] [Flags(2)] [Payload(Len)]
//! ```
//!
//! ## Security
//! - Maximum payload size is configurable (default 1 MiB)
//! - Length validation before allocation

pub mod codec;
pub mod message;
pub mod serialization;
