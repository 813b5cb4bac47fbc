//! # Timers
//!
//! Millisecond scheduler used for idle checks, delayed reconnects and
//! application callbacks. Driven by the [`Runtime`](crate::runtime::Runtime).

pub mod wheel;

pub use wheel::{FiredTimer, TimerCallback, TimingWheel};
