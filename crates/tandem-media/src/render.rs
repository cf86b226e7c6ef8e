//! Clock-driven consumers of the frame bridges.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bridge::{FrameBridge, Sample};
use crate::stream::{PipelineHost, StreamFormat};
use crate::StreamKind;

/// Where pulled samples end up. Called only from the render thread.
pub trait RenderSink: Send {
    fn present(&mut self, sample: Sample);

    /// The bridge had nothing on this tick. The sink may keep showing its last frame.
    fn repeat(&mut self) {}

    fn finish(&mut self) {}
}

/// Pulls one sample per frame interval from a bridge and hands it to a sink.
pub struct RenderLoop {
    kind: StreamKind,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<RenderTotals>>,
}

/// Tick counts of a finished render loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderTotals {
    pub presented: u64,
    pub repeated: u64,
}

impl RenderLoop {
    pub fn start(
        kind: StreamKind,
        format: StreamFormat,
        bridge: Arc<FrameBridge>,
        mut sink: Box<dyn RenderSink>,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let interval_ns = 1_000_000_000 / u64::from(format.framerate.max(1));
        let interval = Duration::from_nanos(interval_ns);

        let join = thread::Builder::new()
            .name(format!("tandem-render-{kind}"))
            .spawn(move || {
                let mut totals = RenderTotals::default();
                let start = Instant::now();
                let mut tick: u64 = 0;
                while !stop_flag.load(Ordering::Acquire) {
                    match bridge.pull(interval) {
                        Some(sample) => {
                            totals.presented += 1;
                            sink.present(sample);
                        }
                        None => {
                            totals.repeated += 1;
                            sink.repeat();
                        }
                    }
                    tick += 1;
                    let target = start + Duration::from_nanos(interval_ns.saturating_mul(tick));
                    if let Some(wait) = target.checked_duration_since(Instant::now()) {
                        thread::sleep(wait);
                    }
                }
                sink.finish();
                debug!(
                    "{} render loop stopped: presented={} repeated={}",
                    kind, totals.presented, totals.repeated
                );
                totals
            })?;

        info!(
            "{} render loop started at {} ({} fps)",
            kind,
            format.resolution(),
            format.framerate
        );
        Ok(Self {
            kind,
            stop,
            join: Some(join),
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Ask the loop to end after its current tick without waiting for it.
    pub fn cancel(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop the loop and wait for the current tick to finish.
    pub fn stop(&mut self) -> RenderTotals {
        self.cancel();
        let Some(join) = self.join.take() else {
            return RenderTotals::default();
        };
        join.join().unwrap_or_else(|_| {
            warn!("{} render loop panicked", self.kind);
            RenderTotals::default()
        })
    }
}

impl Drop for RenderLoop {
    fn drop(&mut self) {
        self.cancel();
    }
}

type SinkFactory = Box<dyn FnMut(StreamKind, StreamFormat) -> Box<dyn RenderSink> + Send>;

/// [`PipelineHost`] that runs one [`RenderLoop`] per ready stream. Loops are
/// cancelled, never joined, so the host can be driven from an async task.
pub struct RenderLoopHost {
    make_sink: SinkFactory,
    loops: HashMap<StreamKind, RenderLoop>,
}

impl RenderLoopHost {
    pub fn new<F>(make_sink: F) -> Self
    where
        F: FnMut(StreamKind, StreamFormat) -> Box<dyn RenderSink> + Send + 'static,
    {
        Self {
            make_sink: Box::new(make_sink),
            loops: HashMap::new(),
        }
    }

    pub fn is_running(&self, kind: StreamKind) -> bool {
        self.loops.contains_key(&kind)
    }
}

impl PipelineHost for RenderLoopHost {
    fn stream_ready(&mut self, kind: StreamKind, format: StreamFormat, bridge: Arc<FrameBridge>) {
        if let Some(previous) = self.loops.remove(&kind) {
            previous.cancel();
        }
        let sink = (self.make_sink)(kind, format);
        match RenderLoop::start(kind, format, bridge, sink) {
            Ok(render) => {
                self.loops.insert(kind, render);
            }
            Err(err) => warn!("failed to start {} render loop: {}", kind, err),
        }
    }

    fn stream_detached(&mut self, kind: StreamKind) {
        if let Some(render) = self.loops.remove(&kind) {
            render.cancel();
        }
    }
}

/// Sink that only counts frames and logs a summary every `interval`.
pub struct StatsSink {
    kind: StreamKind,
    interval: Duration,
    window_start: Instant,
    presented: u64,
    repeated: u64,
    bytes: u64,
}

impl StatsSink {
    pub fn new(kind: StreamKind, interval: Duration) -> Self {
        Self {
            kind,
            interval,
            window_start: Instant::now(),
            presented: 0,
            repeated: 0,
            bytes: 0,
        }
    }

    fn maybe_report(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed < self.interval {
            return;
        }
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        info!(
            stream = %self.kind,
            fps = self.presented as f64 / secs,
            repeated = self.repeated,
            kib = self.bytes / 1024,
            "render stats"
        );
        self.window_start = Instant::now();
        self.presented = 0;
        self.repeated = 0;
        self.bytes = 0;
    }
}

impl RenderSink for StatsSink {
    fn present(&mut self, sample: Sample) {
        self.presented += 1;
        self.bytes += sample.frame.data.len() as u64;
        self.maybe_report();
    }

    fn repeat(&mut self) {
        self.repeated += 1;
        self.maybe_report();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Frame;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        presented: Arc<Mutex<Vec<Duration>>>,
        finished: Arc<AtomicBool>,
    }

    impl RenderSink for Recorder {
        fn present(&mut self, sample: Sample) {
            self.presented.lock().unwrap().push(sample.presentation_time);
        }

        fn finish(&mut self) {
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_render_loop_drains_bridge_in_order() {
        let bridge = Arc::new(FrameBridge::new(StreamKind::Remote));
        for seq in 0..3 {
            bridge.push(Frame::i420(2, 2, vec![0u8; 6]).with_timestamp(seq));
        }
        let recorder = Recorder::default();
        let format = StreamFormat::new(2, 2, 100).unwrap();
        let sink = Box::new(recorder.clone());
        let mut render = RenderLoop::start(StreamKind::Remote, format, bridge, sink).unwrap();

        wait_for(|| recorder.presented.lock().unwrap().len() == 3);
        let totals = render.stop();
        assert_eq!(totals.presented, 3);
        assert!(recorder.finished.load(Ordering::SeqCst));

        let times = recorder.presented.lock().unwrap().clone();
        assert_eq!(
            times,
            vec![
                Duration::ZERO,
                Duration::from_millis(10),
                Duration::from_millis(20)
            ]
        );
    }

    #[test]
    fn test_host_restarts_and_detaches_loops() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let log = created.clone();
        let mut host = RenderLoopHost::new(move |kind, format| {
            log.lock().unwrap().push((kind, format.width));
            Box::new(Recorder::default()) as Box<dyn RenderSink>
        });
        let bridge = Arc::new(FrameBridge::new(StreamKind::Local));

        host.stream_ready(
            StreamKind::Local,
            StreamFormat::new(320, 240, 30).unwrap(),
            bridge.clone(),
        );
        host.stream_ready(
            StreamKind::Local,
            StreamFormat::new(640, 480, 30).unwrap(),
            bridge,
        );
        assert!(host.is_running(StreamKind::Local));
        assert_eq!(
            *created.lock().unwrap(),
            vec![(StreamKind::Local, 320), (StreamKind::Local, 640)]
        );

        host.stream_detached(StreamKind::Local);
        host.stream_detached(StreamKind::Local);
        assert!(!host.is_running(StreamKind::Local));
    }

    #[test]
    fn test_detach_does_not_wait_for_render_thread() {
        let recorder = Recorder::default();
        let sink = recorder.clone();
        let mut host =
            RenderLoopHost::new(move |_, _| Box::new(sink.clone()) as Box<dyn RenderSink>);
        let bridge = Arc::new(FrameBridge::new(StreamKind::Remote));
        bridge.push(Frame::i420(2, 2, vec![0u8; 6]));

        // One frame per second: after the first tick the thread sleeps ~1s.
        host.stream_ready(StreamKind::Remote, StreamFormat::new(2, 2, 1).unwrap(), bridge);
        wait_for(|| recorder.presented.lock().unwrap().len() == 1);

        let started = Instant::now();
        host.stream_detached(StreamKind::Remote);
        assert!(started.elapsed() < Duration::from_millis(500));
        wait_for(|| recorder.finished.load(Ordering::SeqCst));
    }
}
