//! Frame series with independent consumers.
//!
//! A `DynamicSeries` keys every produced frame by a monotonically increasing
//! frame number and gives each registered consumer its own cursor. Under
//! `ProcessAllFrames` a frame is evicted once every consumer has moved past
//! it; under `StoreAllFrames` frames are retained up to the configured bound
//! (oldest dropped on overflow); under `NewestFrameOnly` only the latest
//! frame is kept and reads do not consume it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use mira_core::{MiraError, Result};
use serde::{Deserialize, Serialize};

use crate::mode::StreamingMode;
use crate::sync::Semaphore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesConfig {
    pub mode: StreamingMode,
    /// Maximum retained frames; 0 means unbounded. Under `ProcessAllFrames`
    /// a full series blocks the producer, under `StoreAllFrames` the oldest
    /// frame is dropped.
    pub max_frames: usize,
}

/// Ticket identifying one registered consumer. Only obtainable from
/// [`DynamicSeries::register_consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

pub struct DynamicSeries<T> {
    config: SeriesConfig,
    state: Mutex<SeriesState<T>>,
    /// Semaphore pair, present only for bounded ProcessAllFrames.
    empty: Option<Semaphore>,
    filled: Option<Semaphore>,
    timestamp: AtomicU64,
}

struct SeriesState<T> {
    /// Frame number to frame, ordered so the oldest retained frame is first.
    frames: BTreeMap<u64, T>,
    next_frame_number: u64,
    cursors: HashMap<ConsumerId, u64>,
    next_consumer_id: u64,
    ended: bool,
    stopped: bool,
}

impl<T: Clone> DynamicSeries<T> {
    pub fn new(config: SeriesConfig) -> Self {
        let bounded_queue =
            config.mode == StreamingMode::ProcessAllFrames && config.max_frames > 0;
        Self {
            config,
            state: Mutex::new(SeriesState {
                frames: BTreeMap::new(),
                next_frame_number: 0,
                cursors: HashMap::new(),
                next_consumer_id: 0,
                ended: false,
                stopped: false,
            }),
            empty: bounded_queue.then(|| Semaphore::new(config.max_frames)),
            filled: bounded_queue.then(|| Semaphore::new(0)),
            timestamp: AtomicU64::new(0),
        }
    }

    pub fn with_mode(mode: StreamingMode) -> Self {
        Self::new(SeriesConfig { mode, max_frames: 0 })
    }

    pub fn config(&self) -> SeriesConfig {
        self.config
    }

    /// Register a consumer. Its cursor starts at the oldest retained frame,
    /// so late registration replays deterministically from whatever is still
    /// held (`NewestFrameOnly` consumers always see the current frame).
    pub fn register_consumer(&self) -> ConsumerId {
        let mut state = self.lock();
        let id = ConsumerId(state.next_consumer_id);
        state.next_consumer_id += 1;
        let start = match self.config.mode {
            StreamingMode::NewestFrameOnly => state.next_frame_number,
            _ => state.frames.keys().next().copied().unwrap_or(state.next_frame_number),
        };
        state.cursors.insert(id, start);
        id
    }

    /// Remove a consumer so it no longer holds back eviction.
    pub fn unregister_consumer(&self, consumer: ConsumerId) {
        let evicted = {
            let mut state = self.lock();
            if state.cursors.remove(&consumer).is_none() {
                return;
            }
            self.evict_consumed(&mut state)
        };
        self.post_empty(evicted);
    }

    /// Append one frame. Blocks only for bounded `ProcessAllFrames` when the
    /// series is full.
    pub fn add_frame(&self, frame: T) -> Result<()> {
        if let Some(empty) = &self.empty {
            empty.acquire(None)?;
        }
        {
            let mut state = self.lock();
            if state.stopped {
                return Err(MiraError::ThreadStopped);
            }
            match self.config.mode {
                StreamingMode::NewestFrameOnly => {
                    state.frames.clear();
                }
                StreamingMode::StoreAllFrames => {
                    if self.config.max_frames > 0 && state.frames.len() >= self.config.max_frames {
                        if let Some((&oldest, _)) = state.frames.iter().next() {
                            state.frames.remove(&oldest);
                            tracing::warn!(
                                frame = oldest,
                                max_frames = self.config.max_frames,
                                "series at capacity, dropping oldest stored frame"
                            );
                        }
                    }
                }
                StreamingMode::ProcessAllFrames => {}
            }
            let number = state.next_frame_number;
            state.frames.insert(number, frame);
            state.next_frame_number += 1;
        }
        self.bump_timestamp();
        if let Some(filled) = &self.filled {
            filled.post();
        }
        Ok(())
    }

    /// The frame at this consumer's cursor, advancing the cursor (except
    /// under `NewestFrameOnly`, which returns the current frame without
    /// consuming it).
    pub fn next_frame(&self, consumer: ConsumerId) -> Result<T> {
        if let Some(filled) = &self.filled {
            // Only the uniquely slowest consumer evicts, so only it waits
            // for production.
            if self.would_evict(consumer) {
                filled.acquire(None)?;
            }
        }
        let (frame, evicted) = {
            let mut state = self.lock();
            if state.stopped {
                return Err(MiraError::ThreadStopped);
            }
            if self.config.mode == StreamingMode::NewestFrameOnly {
                return match state.frames.values().next_back() {
                    Some(frame) => Ok(frame.clone()),
                    None => Err(if state.ended {
                        MiraError::EndOfStream
                    } else {
                        MiraError::NoFramesAvailable(0)
                    }),
                };
            }
            let cursor = match state.cursors.get(&consumer) {
                Some(&cursor) => cursor,
                None => return Err(MiraError::NoFramesAvailable(0)),
            };
            let Some(frame) = state.frames.get(&cursor).cloned() else {
                if state.ended && cursor >= state.next_frame_number {
                    if let Some(filled) = &self.filled {
                        filled.post();
                    }
                    return Err(MiraError::EndOfStream);
                }
                // Either not produced yet, or already evicted/dropped.
                return Err(MiraError::NoFramesAvailable(cursor));
            };
            state.cursors.insert(consumer, cursor + 1);
            let evicted = match self.config.mode {
                StreamingMode::ProcessAllFrames => self.evict_consumed(&mut state),
                _ => 0,
            };
            // Signal remaining content so pollers fetch the next frame.
            let more_remaining = match self.config.mode {
                StreamingMode::ProcessAllFrames => !state.frames.is_empty(),
                StreamingMode::StoreAllFrames => cursor + 1 < state.next_frame_number,
                StreamingMode::NewestFrameOnly => false,
            };
            if more_remaining {
                self.bump_timestamp();
            }
            (frame, evicted)
        };
        self.post_empty(evicted);
        Ok(frame)
    }

    /// Producer-side end-of-stream marker.
    pub fn mark_ended(&self) {
        {
            let mut state = self.lock();
            state.ended = true;
        }
        if let Some(filled) = &self.filled {
            filled.post();
        }
    }

    /// Whether this consumer has seen everything it ever will.
    pub fn has_reached_end(&self, consumer: ConsumerId) -> bool {
        let state = self.lock();
        if !state.ended {
            return false;
        }
        match self.config.mode {
            StreamingMode::NewestFrameOnly => true,
            StreamingMode::ProcessAllFrames | StreamingMode::StoreAllFrames => state
                .cursors
                .get(&consumer)
                .map_or(state.next_frame_number == 0, |&c| c >= state.next_frame_number),
        }
    }

    /// Release every blocked producer and consumer with `ThreadStopped`.
    pub fn stop(&self) {
        {
            let mut state = self.lock();
            state.stopped = true;
        }
        if let Some(empty) = &self.empty {
            empty.stop();
        }
        if let Some(filled) = &self.filled {
            filled.stop();
        }
    }

    /// Frames currently retained.
    pub fn size(&self) -> usize {
        self.lock().frames.len()
    }

    /// Total frames ever produced into this series.
    pub fn frame_count(&self) -> u64 {
        self.lock().next_frame_number
    }

    /// Monotonic modification counter for change detection.
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    fn would_evict(&self, consumer: ConsumerId) -> bool {
        let state = self.lock();
        let Some(&mine) = state.cursors.get(&consumer) else {
            return false;
        };
        !state.cursors.iter().any(|(id, &cursor)| *id != consumer && cursor <= mine)
    }

    /// Drop frames every consumer has moved past. Returns how many.
    fn evict_consumed(&self, state: &mut SeriesState<T>) -> usize {
        let Some(&min_cursor) = state.cursors.values().min() else {
            return 0;
        };
        let before = state.frames.len();
        state.frames.retain(|&number, _| number >= min_cursor);
        before - state.frames.len()
    }

    fn post_empty(&self, evicted: usize) {
        if let Some(empty) = &self.empty {
            for _ in 0..evicted {
                empty.post();
            }
        }
    }

    fn bump_timestamp(&self) {
        self.timestamp.fetch_add(1, Ordering::AcqRel);
    }

    fn lock(&self) -> MutexGuard<'_, SeriesState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_frame_only_keeps_latest_without_consuming() {
        let series = DynamicSeries::with_mode(StreamingMode::NewestFrameOnly);
        let consumer = series.register_consumer();
        assert!(matches!(
            series.next_frame(consumer),
            Err(MiraError::NoFramesAvailable(_))
        ));
        series.add_frame("f1").unwrap();
        series.add_frame("f2").unwrap();
        series.add_frame("f3").unwrap();
        assert_eq!(series.size(), 1);
        assert_eq!(series.next_frame(consumer).unwrap(), "f3");
        // Non-consuming: the same frame is still current.
        assert_eq!(series.next_frame(consumer).unwrap(), "f3");
    }

    #[test]
    fn process_all_evicts_consumed_frames() {
        let series = DynamicSeries::with_mode(StreamingMode::ProcessAllFrames);
        let consumer = series.register_consumer();
        series.add_frame("f1").unwrap();
        series.add_frame("f2").unwrap();
        series.add_frame("f3").unwrap();
        assert_eq!(series.size(), 3);
        assert_eq!(series.next_frame(consumer).unwrap(), "f1");
        assert_eq!(series.size(), 2);
        assert_eq!(series.next_frame(consumer).unwrap(), "f2");
        assert_eq!(series.next_frame(consumer).unwrap(), "f3");
        assert_eq!(series.size(), 0);
        assert!(matches!(
            series.next_frame(consumer),
            Err(MiraError::NoFramesAvailable(3))
        ));
    }

    #[test]
    fn store_all_size_is_stable_across_reads() {
        let series = DynamicSeries::with_mode(StreamingMode::StoreAllFrames);
        let consumer = series.register_consumer();
        for name in ["f1", "f2", "f3"] {
            series.add_frame(name).unwrap();
        }
        assert_eq!(series.next_frame(consumer).unwrap(), "f1");
        assert_eq!(series.next_frame(consumer).unwrap(), "f2");
        assert_eq!(series.next_frame(consumer).unwrap(), "f3");
        assert_eq!(series.size(), 3);
    }

    #[test]
    fn timestamp_signals_remaining_frames() {
        let series = DynamicSeries::with_mode(StreamingMode::StoreAllFrames);
        let consumer = series.register_consumer();
        series.add_frame(1).unwrap();
        series.add_frame(2).unwrap();
        let before = series.timestamp();
        series.next_frame(consumer).unwrap();
        // One frame still unread: pollers must be re-triggered.
        assert!(series.timestamp() > before);
        let before = series.timestamp();
        series.next_frame(consumer).unwrap();
        assert_eq!(series.timestamp(), before);
    }

    #[test]
    fn store_all_overflow_drops_oldest() {
        let series = DynamicSeries::new(SeriesConfig {
            mode: StreamingMode::StoreAllFrames,
            max_frames: 2,
        });
        let consumer = series.register_consumer();
        series.add_frame("f1").unwrap();
        series.add_frame("f2").unwrap();
        series.add_frame("f3").unwrap();
        assert_eq!(series.size(), 2);
        // f1 was dropped; the cursor still points at it.
        assert!(matches!(
            series.next_frame(consumer),
            Err(MiraError::NoFramesAvailable(0))
        ));
    }

    #[test]
    fn late_consumer_starts_at_oldest_retained_frame() {
        let series = DynamicSeries::with_mode(StreamingMode::StoreAllFrames);
        series.add_frame("f1").unwrap();
        series.add_frame("f2").unwrap();
        let consumer = series.register_consumer();
        assert_eq!(series.next_frame(consumer).unwrap(), "f1");
    }

    #[test]
    fn process_all_end_is_per_consumer() {
        let series = DynamicSeries::with_mode(StreamingMode::ProcessAllFrames);
        let fast = series.register_consumer();
        let slow = series.register_consumer();
        series.add_frame(1).unwrap();
        series.add_frame(2).unwrap();
        series.mark_ended();

        series.next_frame(fast).unwrap();
        series.next_frame(fast).unwrap();
        // The slow consumer still pins both frames, yet fast is done.
        assert_eq!(series.size(), 2);
        assert!(series.has_reached_end(fast));
        assert!(!series.has_reached_end(slow));

        series.next_frame(slow).unwrap();
        series.next_frame(slow).unwrap();
        assert!(series.has_reached_end(slow));
        assert_eq!(series.size(), 0);
    }

    #[test]
    fn end_of_stream_per_consumer() {
        let series = DynamicSeries::with_mode(StreamingMode::StoreAllFrames);
        let fast = series.register_consumer();
        let slow = series.register_consumer();
        series.add_frame(1).unwrap();
        series.add_frame(2).unwrap();
        series.mark_ended();

        series.next_frame(fast).unwrap();
        series.next_frame(fast).unwrap();
        assert!(series.has_reached_end(fast));
        assert!(matches!(series.next_frame(fast), Err(MiraError::EndOfStream)));

        assert!(!series.has_reached_end(slow));
        series.next_frame(slow).unwrap();
        series.next_frame(slow).unwrap();
        assert!(series.has_reached_end(slow));
    }
}
