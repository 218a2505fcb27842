//! Streaming between pipeline stages.
//!
//! Three pieces, layered bottom-up:
//!
//! - [`sync`]-internal stop-aware semaphores, the one blocking primitive
//!   everything else is built on
//! - [`DataPort`], a policy-driven producer/consumer queue connecting two
//!   stages; `ProcessAllFrames` gives bounded lossless back-pressure,
//!   `NewestFrameOnly` gives lossy latest-value semantics, `StoreAllFrames`
//!   records everything for replay
//! - [`DynamicSeries`], a frame-number-keyed container with independent
//!   per-consumer cursors, used when several consumers read one stream
//! - [`streamer`], a background-thread producer harness that feeds either of
//!   the above through the [`FrameSink`] seam
//!
//! All blocking waits are released by `stop()`, which raises
//! `ThreadStopped` in every blocked caller; worker threads treat that as a
//! teardown signal, not a failure.

pub mod mode;
pub mod port;
pub mod series;
pub mod streamer;
mod sync;

pub use mode::StreamingMode;
pub use port::{DataPort, PortConfig};
pub use series::{ConsumerId, DynamicSeries, SeriesConfig};
pub use streamer::{spawn_streamer, FrameSink, FrameSource, StreamerHandle};
