//! Background producer harness.
//!
//! A streamer runs a [`FrameSource`] on its own thread and pushes every
//! produced frame into a [`FrameSink`] (a port or a series). The first
//! successfully inserted frame is signaled through a condvar so callers can
//! park until data exists instead of polling. `stop()` is cooperative: it
//! flags the worker and tears the sink's blocking waits down, so a producer
//! stuck in a full queue exits promptly with a clean status.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mira_core::{MiraError, Result};

use crate::port::DataPort;
use crate::series::DynamicSeries;
use crate::sync;

/// Receiving end of a streamer: something frames can be pushed into.
pub trait FrameSink<T>: Send + Sync {
    fn add_frame(&self, frame: T) -> Result<()>;
    fn mark_ended(&self);
    fn stop(&self);
}

impl<T: Clone + Send + Sync> FrameSink<T> for DataPort<T> {
    fn add_frame(&self, frame: T) -> Result<()> {
        DataPort::add_frame(self, frame)
    }

    fn mark_ended(&self) {
        self.signal_end_of_stream();
    }

    fn stop(&self) {
        DataPort::stop(self);
    }
}

impl<T: Clone + Send + Sync> FrameSink<T> for DynamicSeries<T> {
    fn add_frame(&self, frame: T) -> Result<()> {
        DynamicSeries::add_frame(self, frame)
    }

    fn mark_ended(&self) {
        DynamicSeries::mark_ended(self);
    }

    fn stop(&self) {
        DynamicSeries::stop(self);
    }
}

/// A pull-based frame producer. `Ok(None)` means the source is exhausted.
pub trait FrameSource: Send + 'static {
    type Frame: Clone + Send + Sync + 'static;

    fn next_frame(&mut self) -> Result<Option<Self::Frame>>;
}

struct Shared {
    progress: Mutex<Progress>,
    cvar: Condvar,
    stop: AtomicBool,
}

#[derive(Default)]
struct Progress {
    first_frame: bool,
    finished: bool,
}

/// Handle to a running streamer thread.
pub struct StreamerHandle<T> {
    shared: Arc<Shared>,
    sink: Arc<dyn FrameSink<T>>,
    worker: Option<JoinHandle<Result<()>>>,
}

/// Spawn a streamer feeding `sink` from `source` until the source is
/// exhausted or the handle is stopped.
pub fn spawn_streamer<S: FrameSource>(
    sink: Arc<dyn FrameSink<S::Frame>>,
    mut source: S,
) -> StreamerHandle<S::Frame> {
    let shared = Arc::new(Shared {
        progress: Mutex::new(Progress::default()),
        cvar: Condvar::new(),
        stop: AtomicBool::new(false),
    });
    let worker = {
        let shared = Arc::clone(&shared);
        let sink = Arc::clone(&sink);
        thread::Builder::new()
            .name("mira-streamer".into())
            .spawn(move || run(&shared, sink.as_ref(), &mut source))
            // Thread spawning only fails on resource exhaustion; nothing
            // sensible to degrade to here.
            .expect("failed to spawn streamer thread")
    };
    StreamerHandle { shared, sink, worker: Some(worker) }
}

fn run<S: FrameSource>(
    shared: &Shared,
    sink: &dyn FrameSink<S::Frame>,
    source: &mut S,
) -> Result<()> {
    let result = stream_loop(shared, sink, source);
    let mut progress = shared.progress.lock().unwrap_or_else(|e| e.into_inner());
    progress.finished = true;
    drop(progress);
    shared.cvar.notify_all();
    result
}

fn stream_loop<S: FrameSource>(
    shared: &Shared,
    sink: &dyn FrameSink<S::Frame>,
    source: &mut S,
) -> Result<()> {
    loop {
        if shared.stop.load(Ordering::Acquire) {
            tracing::info!("streamer stopped by request");
            return Ok(());
        }
        match source.next_frame() {
            Ok(Some(frame)) => match sink.add_frame(frame) {
                Ok(()) => signal_first_frame(shared),
                Err(MiraError::ThreadStopped) => {
                    tracing::info!("streamer released from a stopped sink");
                    return Ok(());
                }
                Err(e) => {
                    sink.mark_ended();
                    return Err(e);
                }
            },
            Ok(None) => {
                tracing::info!("streamer reached end of source");
                sink.mark_ended();
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(error = %e, code = e.error_code(), "streamer source failed");
                sink.mark_ended();
                return Err(e);
            }
        }
    }
}

fn signal_first_frame(shared: &Shared) {
    let mut progress = shared.progress.lock().unwrap_or_else(|e| e.into_inner());
    if !progress.first_frame {
        progress.first_frame = true;
        shared.cvar.notify_all();
    }
}

impl<T> StreamerHandle<T> {
    /// Park until the first frame has been inserted into the sink. Returns
    /// `EndOfStream` if the source finished without producing anything.
    pub fn wait_for_first_frame(&self) -> Result<()> {
        self.wait_for_first_frame_with(None)
    }

    pub fn wait_for_first_frame_with(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|d| (std::time::Instant::now() + d, d));
        let mut progress = self.shared.progress.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if progress.first_frame {
                return Ok(());
            }
            if progress.finished {
                return Err(MiraError::EndOfStream);
            }
            progress = sync::wait(&self.shared.cvar, progress, deadline)?;
        }
    }

    /// Request cooperative shutdown. The sink's blocking waits are torn down
    /// so a producer stuck on back-pressure exits too.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.sink.stop();
    }

    /// Wait for the worker to exit and return its final status.
    pub fn join(mut self) -> Result<()> {
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| MiraError::Device("streamer worker panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl<T> Drop for StreamerHandle<T> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let finished =
                self.shared.progress.lock().unwrap_or_else(|e| e.into_inner()).finished;
            if !finished {
                // Abandoned mid-stream: tear the worker down rather than
                // leak a blocked thread. A finished worker leaves the sink
                // alone so consumers can keep draining.
                self.shared.stop.store(true, Ordering::Release);
                self.sink.stop();
            }
            let _ = worker.join();
        }
    }
}
