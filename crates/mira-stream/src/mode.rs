//! Streaming policy selection.

use serde::{Deserialize, Serialize};

/// How a port or series balances latency, memory and losslessness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamingMode {
    /// Keep only the most recent frame; producers never block, consumers may
    /// miss frames. For live display paths.
    #[default]
    NewestFrameOnly,
    /// Bounded queue, every frame processed exactly once, producer blocks
    /// when the consumer falls behind. For lossless processing.
    ProcessAllFrames,
    /// Retain every frame for replay and multi-pass access.
    StoreAllFrames,
}

impl std::fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamingMode::NewestFrameOnly => "newest-frame-only",
            StreamingMode::ProcessAllFrames => "process-all-frames",
            StreamingMode::StoreAllFrames => "store-all-frames",
        };
        f.write_str(name)
    }
}
