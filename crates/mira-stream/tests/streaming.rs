//! Cross-thread streaming behavior: back-pressure, cancellation liveness,
//! multi-consumer independence, and the streamer harness end to end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mira_core::{DataType, MiraError, Result};
use mira_image::Image;
use mira_stream::{
    spawn_streamer, ConsumerId, DataPort, DynamicSeries, FrameSource, PortConfig, SeriesConfig,
    StreamingMode,
};

const NUDGE: Duration = Duration::from_millis(40);

#[test]
fn bounded_port_blocks_producer_until_consumed() {
    let port = Arc::new(DataPort::new(PortConfig {
        mode: StreamingMode::ProcessAllFrames,
        capacity: 2,
        timeout: None,
    }));
    let pushed = Arc::new(AtomicU64::new(0));

    let producer = {
        let port = Arc::clone(&port);
        let pushed = Arc::clone(&pushed);
        thread::spawn(move || -> Result<()> {
            for i in 0..5u64 {
                port.add_frame(i)?;
                pushed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    };

    // Capacity is 2: the producer must stall at two in-flight frames.
    thread::sleep(NUDGE);
    assert_eq!(pushed.load(Ordering::SeqCst), 2);

    assert_eq!(port.next_frame().unwrap(), 0);
    thread::sleep(NUDGE);
    assert_eq!(pushed.load(Ordering::SeqCst), 3);

    for expected in 1..5 {
        assert_eq!(port.next_frame().unwrap(), expected);
    }
    producer.join().unwrap().unwrap();
    assert_eq!(pushed.load(Ordering::SeqCst), 5);
}

#[test]
fn stop_releases_blocked_consumer_promptly() {
    let port: Arc<DataPort<u32>> =
        Arc::new(DataPort::with_mode(StreamingMode::ProcessAllFrames));
    let consumer = {
        let port = Arc::clone(&port);
        thread::spawn(move || port.next_frame())
    };
    thread::sleep(NUDGE);
    port.stop();
    assert!(matches!(consumer.join().unwrap(), Err(MiraError::ThreadStopped)));
}

#[test]
fn stop_releases_blocked_producer_promptly() {
    let port = Arc::new(DataPort::new(PortConfig {
        mode: StreamingMode::ProcessAllFrames,
        capacity: 1,
        timeout: None,
    }));
    port.add_frame(0u32).unwrap();
    let producer = {
        let port = Arc::clone(&port);
        thread::spawn(move || port.add_frame(1))
    };
    thread::sleep(NUDGE);
    port.stop();
    assert!(matches!(producer.join().unwrap(), Err(MiraError::ThreadStopped)));
}

#[test]
fn consumers_progress_independently() {
    let series = DynamicSeries::with_mode(StreamingMode::StoreAllFrames);
    let a = series.register_consumer();
    let b = series.register_consumer();

    for i in 0..4 {
        series.add_frame(i).unwrap();
    }

    assert_eq!(series.next_frame(a).unwrap(), 0);
    assert_eq!(series.next_frame(a).unwrap(), 1);
    assert_eq!(series.next_frame(a).unwrap(), 2);
    // b is untouched by a's progress.
    assert_eq!(series.next_frame(b).unwrap(), 0);
    assert_eq!(series.next_frame(a).unwrap(), 3);
    assert_eq!(series.next_frame(b).unwrap(), 1);
}

#[test]
fn eviction_waits_for_the_slowest_consumer() {
    let series = DynamicSeries::with_mode(StreamingMode::ProcessAllFrames);
    let fast = series.register_consumer();
    let slow = series.register_consumer();

    for i in 0..3 {
        series.add_frame(i).unwrap();
    }

    assert_eq!(series.next_frame(fast).unwrap(), 0);
    assert_eq!(series.next_frame(fast).unwrap(), 1);
    // The slow consumer still holds frames 0..3 in place.
    assert_eq!(series.size(), 3);

    assert_eq!(series.next_frame(slow).unwrap(), 0);
    // Frame 0 is now behind everyone and gets evicted.
    assert_eq!(series.size(), 2);
}

#[test]
fn bounded_series_backpressure_round_trips() {
    let series = Arc::new(DynamicSeries::new(SeriesConfig {
        mode: StreamingMode::ProcessAllFrames,
        max_frames: 2,
    }));
    let consumer = series.register_consumer();

    let producer = {
        let series = Arc::clone(&series);
        thread::spawn(move || -> Result<()> {
            for i in 0..6u64 {
                series.add_frame(i)?;
            }
            Ok(())
        })
    };

    let mut seen = Vec::new();
    for _ in 0..6 {
        seen.push(series.next_frame(consumer).unwrap());
    }
    producer.join().unwrap().unwrap();
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
}

// ── Streamer harness ──

struct CountingSource {
    produced: u32,
    limit: Option<u32>,
}

impl FrameSource for CountingSource {
    type Frame = Arc<Image>;

    fn next_frame(&mut self) -> Result<Option<Arc<Image>>> {
        if let Some(limit) = self.limit {
            if self.produced >= limit {
                return Ok(None);
            }
        }
        let image = Image::new_2d(2, 2, DataType::Uint8, 1)?;
        image.write_host()?.fill(self.produced as u8);
        self.produced += 1;
        Ok(Some(image))
    }
}

#[test]
fn streamer_feeds_a_series_to_completion() {
    let series: Arc<DynamicSeries<Arc<Image>>> =
        Arc::new(DynamicSeries::with_mode(StreamingMode::StoreAllFrames));
    let consumer = series.register_consumer();

    let handle = spawn_streamer(
        series.clone() as Arc<dyn mira_stream::FrameSink<Arc<Image>>>,
        CountingSource { produced: 0, limit: Some(5) },
    );

    handle.wait_for_first_frame().unwrap();
    handle.join().unwrap();

    assert_eq!(series.frame_count(), 5);
    for expected in 0..5u8 {
        let frame = series.next_frame(consumer).unwrap();
        assert_eq!(frame.read_host().unwrap()[0], expected);
    }
    assert!(series.has_reached_end(consumer));
    assert!(matches!(series.next_frame(consumer), Err(MiraError::EndOfStream)));
}

#[test]
fn streamer_stop_unblocks_a_full_bounded_sink() {
    // Unlimited source into a tiny bounded series nobody consumes: the
    // worker must end up blocked, and stop() must free it cleanly.
    let series: Arc<DynamicSeries<Arc<Image>>> = Arc::new(DynamicSeries::new(SeriesConfig {
        mode: StreamingMode::ProcessAllFrames,
        max_frames: 2,
    }));
    let _consumer: ConsumerId = series.register_consumer();

    let handle = spawn_streamer(
        series.clone() as Arc<dyn mira_stream::FrameSink<Arc<Image>>>,
        CountingSource { produced: 0, limit: None },
    );
    handle.wait_for_first_frame().unwrap();
    thread::sleep(NUDGE);

    handle.stop();
    // A clean cooperative shutdown, not an error.
    handle.join().unwrap();
    assert_eq!(series.size(), 2);
}

#[test]
fn empty_source_reports_end_of_stream() {
    let port: Arc<DataPort<Arc<Image>>> =
        Arc::new(DataPort::with_mode(StreamingMode::ProcessAllFrames));
    let handle = spawn_streamer(
        port.clone() as Arc<dyn mira_stream::FrameSink<Arc<Image>>>,
        CountingSource { produced: 0, limit: Some(0) },
    );
    assert!(matches!(
        handle.wait_for_first_frame(),
        Err(MiraError::EndOfStream)
    ));
    handle.join().unwrap();
    assert!(matches!(port.next_frame(), Err(MiraError::EndOfStream)));
}
