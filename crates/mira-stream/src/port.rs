//! The `DataPort`: a policy-driven queue between a producer and a consumer
//! stage.
//!
//! `ProcessAllFrames` is the classic bounded producer/consumer queue built
//! on an empty-slots/filled-slots semaphore pair. `NewestFrameOnly` holds a
//! single replaceable slot. `StoreAllFrames` appends forever and hands
//! frames out by an internal cursor, retaining everything.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mira_core::{MiraError, Result};
use serde::{Deserialize, Serialize};

use crate::mode::StreamingMode;
use crate::sync::{self, Semaphore};

pub const DEFAULT_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortConfig {
    pub mode: StreamingMode,
    /// Maximum in-flight frames under `ProcessAllFrames`.
    pub capacity: usize,
    /// Optional deadline for every blocking push/pop. `None` waits forever
    /// (until `stop()`).
    pub timeout: Option<Duration>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self { mode: StreamingMode::default(), capacity: DEFAULT_CAPACITY, timeout: None }
    }
}

pub struct DataPort<T> {
    config: PortConfig,
    state: Mutex<PortState<T>>,
    cvar: Condvar,
    /// Free queue slots (ProcessAllFrames only).
    empty: Semaphore,
    /// Occupied queue slots (ProcessAllFrames only).
    filled: Semaphore,
    frames_added: AtomicU64,
    wiring_warned: AtomicBool,
}

struct PortState<T> {
    queue: VecDeque<T>,
    newest: Option<T>,
    /// Next frame index to hand out under StoreAllFrames.
    cursor: usize,
    stopped: bool,
    ended: bool,
    ever_popped: bool,
}

impl<T: Clone> DataPort<T> {
    pub fn new(mut config: PortConfig) -> Self {
        if config.capacity == 0 {
            tracing::warn!("port capacity 0 is not usable, falling back to {DEFAULT_CAPACITY}");
            config.capacity = DEFAULT_CAPACITY;
        }
        Self {
            config,
            state: Mutex::new(PortState {
                queue: VecDeque::new(),
                newest: None,
                cursor: 0,
                stopped: false,
                ended: false,
                ever_popped: false,
            }),
            cvar: Condvar::new(),
            empty: Semaphore::new(config.capacity),
            filled: Semaphore::new(0),
            frames_added: AtomicU64::new(0),
            wiring_warned: AtomicBool::new(false),
        }
    }

    pub fn with_mode(mode: StreamingMode) -> Self {
        Self::new(PortConfig { mode, ..PortConfig::default() })
    }

    pub fn config(&self) -> PortConfig {
        self.config
    }

    /// Push one frame. Under `ProcessAllFrames` this blocks while the queue
    /// is full; the other policies never block.
    pub fn add_frame(&self, frame: T) -> Result<()> {
        match self.config.mode {
            StreamingMode::ProcessAllFrames => {
                if !self.empty.try_acquire() {
                    self.warn_if_never_consumed();
                    self.empty.acquire(self.config.timeout)?;
                }
                {
                    let mut state = self.lock();
                    if state.stopped {
                        return Err(MiraError::ThreadStopped);
                    }
                    state.queue.push_back(frame);
                }
                self.filled.post();
            }
            StreamingMode::NewestFrameOnly => {
                let mut state = self.lock();
                if state.stopped {
                    return Err(MiraError::ThreadStopped);
                }
                state.newest = Some(frame);
                self.cvar.notify_all();
            }
            StreamingMode::StoreAllFrames => {
                let mut state = self.lock();
                if state.stopped {
                    return Err(MiraError::ThreadStopped);
                }
                state.queue.push_back(frame);
                self.cvar.notify_all();
            }
        }
        self.frames_added.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Pop the next frame per the configured policy. Blocks until a frame is
    /// available, `stop()` is called, the stream ends, or the configured
    /// timeout expires.
    pub fn next_frame(&self) -> Result<T> {
        match self.config.mode {
            StreamingMode::ProcessAllFrames => {
                self.filled.acquire(self.config.timeout)?;
                let frame = {
                    let mut state = self.lock();
                    state.ever_popped = true;
                    state.queue.pop_front()
                };
                match frame {
                    Some(frame) => {
                        self.empty.post();
                        Ok(frame)
                    }
                    None => {
                        // Drained and ended: keep the wakeup token moving so
                        // every other blocked consumer also sees the end.
                        self.filled.post();
                        Err(MiraError::EndOfStream)
                    }
                }
            }
            StreamingMode::NewestFrameOnly => {
                let deadline = self.config.timeout.map(|d| (Instant::now() + d, d));
                let mut state = self.lock();
                loop {
                    // A stopped port is terminal: no frames leave it, even
                    // ones that were retained when stop() hit.
                    if state.stopped {
                        return Err(MiraError::ThreadStopped);
                    }
                    if let Some(frame) = state.newest.take() {
                        state.ever_popped = true;
                        return Ok(frame);
                    }
                    if state.ended {
                        return Err(MiraError::EndOfStream);
                    }
                    state = sync::wait(&self.cvar, state, deadline)?;
                }
            }
            StreamingMode::StoreAllFrames => {
                let deadline = self.config.timeout.map(|d| (Instant::now() + d, d));
                let mut state = self.lock();
                loop {
                    if state.stopped {
                        return Err(MiraError::ThreadStopped);
                    }
                    if state.cursor < state.queue.len() {
                        let frame = state.queue[state.cursor].clone();
                        state.cursor += 1;
                        state.ever_popped = true;
                        return Ok(frame);
                    }
                    if state.ended {
                        return Err(MiraError::EndOfStream);
                    }
                    state = sync::wait(&self.cvar, state, deadline)?;
                }
            }
        }
    }

    /// Mark the producer side finished. Blocked and future consumers drain
    /// whatever remains, then see `EndOfStream`.
    pub fn signal_end_of_stream(&self) {
        {
            let mut state = self.lock();
            state.ended = true;
        }
        self.cvar.notify_all();
        if self.config.mode == StreamingMode::ProcessAllFrames {
            // One circulating wakeup token, see next_frame.
            self.filled.post();
        }
    }

    /// Tear the port down: every blocked producer and consumer, now or
    /// later, gets `ThreadStopped`.
    pub fn stop(&self) {
        {
            let mut state = self.lock();
            state.stopped = true;
        }
        self.cvar.notify_all();
        self.empty.stop();
        self.filled.stop();
    }

    /// Frames currently retained.
    pub fn size(&self) -> usize {
        let state = self.lock();
        match self.config.mode {
            StreamingMode::NewestFrameOnly => usize::from(state.newest.is_some()),
            _ => state.queue.len(),
        }
    }

    /// Total frames ever pushed through this port.
    pub fn frame_count(&self) -> u64 {
        self.frames_added.load(Ordering::Relaxed)
    }

    fn warn_if_never_consumed(&self) {
        let never_popped = !self.lock().ever_popped;
        if never_popped && !self.wiring_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                capacity = self.config.capacity,
                "producer blocked on a full port that no consumer has ever read; \
                 likely a missing or mis-wired consumer"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, PortState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_frame_only_retains_one() {
        let port = DataPort::with_mode(StreamingMode::NewestFrameOnly);
        for i in 0..10 {
            port.add_frame(i).unwrap();
        }
        assert_eq!(port.size(), 1);
        assert_eq!(port.next_frame().unwrap(), 9);
        assert_eq!(port.size(), 0);
        assert_eq!(port.frame_count(), 10);
    }

    #[test]
    fn process_all_is_fifo() {
        let port = DataPort::with_mode(StreamingMode::ProcessAllFrames);
        port.add_frame("f1").unwrap();
        port.add_frame("f2").unwrap();
        port.add_frame("f3").unwrap();
        assert_eq!(port.size(), 3);
        assert_eq!(port.next_frame().unwrap(), "f1");
        assert_eq!(port.next_frame().unwrap(), "f2");
        assert_eq!(port.next_frame().unwrap(), "f3");
        assert_eq!(port.size(), 0);
    }

    #[test]
    fn store_all_retains_after_reads() {
        let port = DataPort::with_mode(StreamingMode::StoreAllFrames);
        port.add_frame(1).unwrap();
        port.add_frame(2).unwrap();
        assert_eq!(port.next_frame().unwrap(), 1);
        assert_eq!(port.next_frame().unwrap(), 2);
        assert_eq!(port.size(), 2);
    }

    #[test]
    fn end_of_stream_after_drain() {
        let port = DataPort::with_mode(StreamingMode::ProcessAllFrames);
        port.add_frame(1).unwrap();
        port.signal_end_of_stream();
        assert_eq!(port.next_frame().unwrap(), 1);
        assert!(matches!(port.next_frame(), Err(MiraError::EndOfStream)));
        // The end signal keeps circulating.
        assert!(matches!(port.next_frame(), Err(MiraError::EndOfStream)));
    }

    #[test]
    fn pop_times_out_on_empty_port() {
        let port: DataPort<u32> = DataPort::new(PortConfig {
            mode: StreamingMode::ProcessAllFrames,
            capacity: 4,
            timeout: Some(Duration::from_millis(25)),
        });
        assert!(matches!(port.next_frame(), Err(MiraError::Timeout(_))));
    }

    #[test]
    fn stopped_port_rejects_traffic() {
        let port = DataPort::with_mode(StreamingMode::StoreAllFrames);
        port.add_frame(1).unwrap();
        port.stop();
        assert!(matches!(port.add_frame(2), Err(MiraError::ThreadStopped)));
        assert!(matches!(port.next_frame(), Err(MiraError::ThreadStopped)));
    }

    #[test]
    fn stop_withholds_retained_frames() {
        // Frames sitting in the port when stop() lands must not leak out.
        let newest = DataPort::with_mode(StreamingMode::NewestFrameOnly);
        newest.add_frame(7).unwrap();
        newest.stop();
        assert!(matches!(newest.next_frame(), Err(MiraError::ThreadStopped)));

        let replay = DataPort::with_mode(StreamingMode::StoreAllFrames);
        replay.add_frame(7).unwrap();
        replay.signal_end_of_stream();
        replay.stop();
        assert!(matches!(replay.next_frame(), Err(MiraError::ThreadStopped)));
    }
}
