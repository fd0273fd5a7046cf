//! Detection dispatch
//!
//! Best-effort, low-latency publishing of per-frame object detections over UDP.
//!
//! # Architecture
//!
//! A perception loop owns one [`DetectionChannel`] and calls
//! [`DetectionChannel::send`] once per processed frame. Each call becomes one
//! self-contained JSON datagram:
//!
//! ```text
//! {"timestamp": 1700000000.12, "frame_id": 42,
//!  "objects": [{"label": "duck", "score": 0.87, "bbox": [0.2, 0.3, 0.5, 0.6]}]}
//! ```
//!
//! The channel favours freshness over completeness:
//!
//! 1. **Never blocks**: the socket is non-blocking and each frame gets exactly one send attempt.
//! 2. **Never retries**: a datagram the kernel will not take right now is dropped.
//! 3. **Never raises on transport failure**: drops are counted, reported through an
//!    optional hook, and logged at most once per `drop_log_interval` drops.
//!
//! # Module Structure
//!
//! - `detection`: `DetectionObject` and the `DetectionBatch` wire message
//! - `channel`: `DetectionChannel`, drop accounting, the `DatagramSink` seam
//! - `config`: `ChannelConfig` (file + environment layering)
//! - `socket`: UDP socket setup and send buffer sizing
//! - `synthetic`: fake detections for demos and tests

pub mod channel;
pub mod config;
pub mod detection;
pub mod socket;
pub mod synthetic;

pub use channel::{
    ChannelStats, DatagramSink, DetectionChannel, DropEvent, DropHook, DropReason,
};
pub use config::{ChannelConfig, DEFAULT_HOST, DEFAULT_PORT};
pub use detection::{unix_timestamp, DetectionBatch, DetectionObject};
pub use synthetic::SyntheticDetector;
