//! Capture loop: device read → split → deliver / record / snapshot.
//!
//! Two drivers share one [`CaptureSession`]:
//!
//! - **Worker thread**: [`CaptureWorker::spawn`] loops on a bounded
//!   readiness wait and polls a shared stop flag between iterations.
//! - **Cooperative**: an external readiness loop calls
//!   [`CaptureSession::on_readable`] once per readable event.
//!
//! ## Read failures
//!
//! | Result | Handling |
//! |--------|----------|
//! | `WouldBlock` / `Interrupted` | retried, not counted |
//! | other error | counted, logged, loop continues |
//! | zero bytes | counted, logged, loop continues |
//!
//! Nothing returned from a step is an error: failures are logged and
//! counted in [`CaptureStats`], and capture carries on.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::CaptureConfig;
use crate::device::Device;
use crate::error::{MediaError, Result};
use crate::media::FrameSplitter;
use crate::mp4::MuxerRegistry;
use crate::queue::FrameSink;
use crate::recorder::{Recorder, TrackShape};
use crate::snapshot::{SnapshotConfig, SnapshotGenerator};
use crate::source::{DeviceSource, FrameSource};

/// Counters for one capture session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Buffers read and processed.
    pub frames: u64,
    pub keyframes: u64,
    pub bytes: u64,
    /// Units handed to the sink.
    pub units_posted: u64,
    /// Failed reads other than `WouldBlock` / `Interrupted`.
    pub read_errors: u64,
    pub empty_reads: u64,
}

/// Outcome of one capture step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A buffer of this many bytes was processed.
    Frame(usize),
    /// Device was not ready within the poll timeout.
    Idle,
    /// Transient condition; try again.
    Retry,
    Empty,
    Failed,
    /// The device will produce nothing more.
    Finished,
}

/// Per-device capture state shared by both drivers.
pub struct CaptureSession<D: Device> {
    device: D,
    splitter: Option<FrameSplitter>,
    sink: Arc<dyn FrameSink>,
    source: Arc<DeviceSource>,
    snapshot: Option<Arc<SnapshotGenerator>>,
    recorder: Recorder,
    buf: Vec<u8>,
    started: Instant,
    stats: CaptureStats,
}

impl<D: Device> CaptureSession<D> {
    /// Build a session recording through the process-wide muxer registry.
    pub fn new(device: D, config: CaptureConfig, sink: Arc<dyn FrameSink>) -> Self {
        Self::with_registry(device, config, sink, MuxerRegistry::global().clone())
    }

    pub fn with_registry(
        device: D,
        config: CaptureConfig,
        sink: Arc<dyn FrameSink>,
        registry: MuxerRegistry,
    ) -> Self {
        let format = device.format();

        let snapshot = config.snapshot.map(|snapshot| {
            Arc::new(SnapshotGenerator::new(SnapshotConfig {
                width: format.width,
                height: format.height,
                fps: format.fps,
                ..snapshot
            }))
        });

        let splitter = format.pixel_format.codec().map(|codec| {
            let splitter = FrameSplitter::new(codec, config.splitter.clone());
            match &snapshot {
                Some(generator) => splitter.with_snapshot(generator.clone()),
                None => splitter,
            }
        });

        let buffer_size = device.buffer_size().max(1);
        tracing::info!(
            format = format.pixel_format.name(),
            width = format.width,
            height = format.height,
            fps = format.fps,
            buffer_size,
            recording = config.recording.is_some(),
            snapshot = snapshot.is_some(),
            "capture session created"
        );

        Self {
            device,
            splitter,
            sink,
            source: Arc::new(DeviceSource::new(format)),
            snapshot,
            recorder: Recorder::new(config.recording, registry),
            buf: vec![0u8; buffer_size],
            started: Instant::now(),
            stats: CaptureStats::default(),
        }
    }

    /// The capability handed to the delivery layer.
    pub fn source(&self) -> Arc<DeviceSource> {
        self.source.clone()
    }

    pub fn snapshot(&self) -> Option<Arc<SnapshotGenerator>> {
        self.snapshot.clone()
    }

    pub fn splitter(&self) -> Option<&FrameSplitter> {
        self.splitter.as_ref()
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.device.is_finished()
    }

    /// Wait up to `timeout` for the device, then run one step if it is ready.
    pub fn poll(&mut self, timeout: Duration) -> Step {
        if self.device.is_finished() {
            return Step::Finished;
        }
        match self.device.wait_readable(timeout) {
            Ok(true) => self.on_readable(),
            Ok(false) if self.device.is_finished() => Step::Finished,
            Ok(false) => Step::Idle,
            Err(e) if is_transient(&e) => Step::Retry,
            Err(e) => {
                self.stats.read_errors += 1;
                tracing::warn!(error = %e, errors = self.stats.read_errors, "device wait failed");
                Step::Failed
            }
        }
    }

    /// Perform exactly one read and process the buffer.
    pub fn on_readable(&mut self) -> Step {
        match self.device.read(&mut self.buf) {
            Ok(0) => {
                if self.device.is_finished() {
                    return Step::Finished;
                }
                self.stats.empty_reads += 1;
                tracing::debug!(empty_reads = self.stats.empty_reads, "device returned no data");
                Step::Empty
            }
            Ok(n) => {
                self.process(n);
                Step::Frame(n)
            }
            Err(e) if is_transient(&e) => {
                tracing::trace!(error = %e, "device read retry");
                Step::Retry
            }
            Err(e) => {
                self.stats.read_errors += 1;
                tracing::warn!(error = %e, errors = self.stats.read_errors, "device read failed");
                Step::Failed
            }
        }
    }

    fn process(&mut self, len: usize) {
        let timestamp = self.started.elapsed();
        let data = &self.buf[..len];
        self.stats.frames += 1;
        self.stats.bytes += len as u64;

        match &mut self.splitter {
            Some(splitter) => {
                let split = splitter.process_frame(data);
                if split.parameter_sets_changed {
                    self.source.publish_aux_line(splitter.aux_line());
                }
                if split.access_unit.is_keyframe() {
                    self.stats.keyframes += 1;
                    if let Some(keyframe) = splitter.last_keyframe() {
                        self.source.publish_keyframe(keyframe.clone());
                    }
                }

                let format = self.source.format();
                let shape = TrackShape {
                    width: format.width,
                    height: format.height,
                    fps: format.fps,
                };
                self.recorder.record_frame(
                    splitter.codec(),
                    splitter.parameter_sets(),
                    shape,
                    &split,
                    data,
                );

                self.stats.units_posted += split.units.len() as u64;
                for unit in split.units {
                    self.sink.post_frame(unit, timestamp);
                }
            }
            None => {
                self.stats.keyframes += 1;
                if let Some(snapshot) = &self.snapshot {
                    snapshot.update_jpeg(data);
                }
                self.recorder.record_jpeg(data);
                self.stats.units_posted += 1;
                self.sink.post_frame(Bytes::copy_from_slice(data), timestamp);
            }
        }

        if let Some(snapshot) = &self.snapshot {
            if let Err(e) = snapshot.save_if_due() {
                tracing::warn!(error = %e, "snapshot save failed");
            }
        }
    }

    /// Close recording and return the final counters.
    pub fn finish(&mut self) -> CaptureStats {
        if let Err(e) = self.recorder.finish() {
            tracing::error!(error = %e, "closing recording failed");
        }
        tracing::info!(
            frames = self.stats.frames,
            keyframes = self.stats.keyframes,
            bytes = self.stats.bytes,
            read_errors = self.stats.read_errors,
            empty_reads = self.stats.empty_reads,
            "capture session finished"
        );
        self.stats
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Dedicated capture thread.
///
/// The thread exits when the stop flag is set (observed within one poll
/// timeout) or when the device is finished. Dropping the worker stops and
/// joins it.
pub struct CaptureWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<CaptureStats>>,
    source: Arc<DeviceSource>,
    snapshot: Option<Arc<SnapshotGenerator>>,
}

impl CaptureWorker {
    pub fn spawn<D: Device + 'static>(
        mut session: CaptureSession<D>,
        poll_timeout: Duration,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let source = session.source();
        let snapshot = session.snapshot();

        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                tracing::debug!("capture thread started");
                while !flag.load(Ordering::SeqCst) {
                    if session.poll(poll_timeout) == Step::Finished {
                        tracing::info!("device finished");
                        break;
                    }
                }
                session.finish()
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
            source,
            snapshot,
        })
    }

    /// Flag that stops the worker when set; share it with signal handlers.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// The thread has exited (device finished or stop observed).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    pub fn source(&self) -> Arc<DeviceSource> {
        self.source.clone()
    }

    pub fn snapshot(&self) -> Option<Arc<SnapshotGenerator>> {
        self.snapshot.clone()
    }

    /// Wait for the thread to exit on its own and return its counters.
    pub fn join(mut self) -> Result<CaptureStats> {
        self.join_inner()
    }

    /// Stop the thread and wait for it.
    pub fn stop_and_join(mut self) -> Result<CaptureStats> {
        self.stop();
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<CaptureStats> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| MediaError::Device("capture thread already joined".into()))?;
        handle
            .join()
            .map_err(|_| MediaError::Device("capture thread panicked".into()))
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
            if let Err(e) = self.join_inner() {
                tracing::error!(error = %e, "capture worker shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::config::RecordingConfig;
    use crate::device::{PixelFormat, VideoFormat};
    use crate::media::nal::push_annex_b;
    use crate::queue::FrameQueue;

    /// Device scripted with a fixed sequence of read results.
    struct ScriptedDevice {
        reads: VecDeque<io::Result<Vec<u8>>>,
        format: VideoFormat,
    }

    impl ScriptedDevice {
        fn new(pixel_format: PixelFormat, reads: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                reads: reads.into(),
                format: VideoFormat {
                    width: 320,
                    height: 240,
                    fps: 30,
                    pixel_format,
                },
            }
        }
    }

    impl Device for ScriptedDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }

        fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
            Ok(!self.reads.is_empty())
        }

        fn buffer_size(&self) -> usize {
            4096
        }

        fn format(&self) -> VideoFormat {
            self.format
        }

        fn is_finished(&self) -> bool {
            self.reads.is_empty()
        }
    }

    const SPS: &[u8] = &[0x67, 0x64, 0x00, 0x28, 0xAC];
    const PPS: &[u8] = &[0x68, 0xEE, 0x3C, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x21];
    const P: &[u8] = &[0x41, 0x9A, 0x02];

    fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            push_annex_b(&mut out, nal);
        }
        out
    }

    #[test]
    fn read_failures_are_classified() {
        let device = ScriptedDevice::new(
            PixelFormat::H264,
            vec![
                Err(io::ErrorKind::WouldBlock.into()),
                Err(io::ErrorKind::Interrupted.into()),
                Err(io::Error::other("dqbuf failed")),
                Ok(Vec::new()),
                Ok(annex_b(&[SPS, PPS, IDR])),
            ],
        );
        let queue = Arc::new(FrameQueue::new(16));
        let mut session = CaptureSession::new(device, CaptureConfig::default(), queue.clone());

        assert_eq!(session.on_readable(), Step::Retry);
        assert_eq!(session.on_readable(), Step::Retry);
        assert_eq!(session.on_readable(), Step::Failed);
        assert_eq!(session.on_readable(), Step::Empty);
        assert!(matches!(session.on_readable(), Step::Frame(_)));

        let stats = session.stats();
        assert_eq!(stats.read_errors, 1);
        assert_eq!(stats.empty_reads, 1);
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.keyframes, 1);
        assert_eq!(queue.len(), 3);
        assert_eq!(session.on_readable(), Step::Finished);
    }

    #[test]
    fn aux_line_published_on_parameter_sets() {
        let device = ScriptedDevice::new(PixelFormat::H264, vec![Ok(annex_b(&[SPS, PPS, IDR]))]);
        let queue = Arc::new(FrameQueue::new(4));
        let mut session = CaptureSession::new(device, CaptureConfig::default(), queue);
        let source = session.source();
        assert!(source.aux_line().is_none());

        session.on_readable();
        assert_eq!(
            source.aux_line().as_deref(),
            Some("profile-level-id=640028;sprop-parameter-sets=Z2QAKKw=,aO48gA==")
        );
    }

    #[test]
    fn last_keyframe_published_to_source() {
        let device = ScriptedDevice::new(
            PixelFormat::H264,
            vec![Ok(annex_b(&[SPS, PPS, IDR])), Ok(annex_b(&[P]))],
        );
        let queue = Arc::new(FrameQueue::new(8));
        let mut session = CaptureSession::new(device, CaptureConfig::default(), queue);
        let source = session.source();
        assert!(source.last_keyframe().is_none());

        session.on_readable();
        session.on_readable();
        let expected = annex_b(&[SPS, PPS, IDR]);
        assert_eq!(source.last_keyframe().as_deref(), Some(expected.as_slice()));
    }

    #[test]
    fn mjpeg_frames_pass_through() {
        let jpeg = vec![0xFF, 0xD8, 0x10, 0xFF, 0xD9];
        let device = ScriptedDevice::new(PixelFormat::Mjpeg, vec![Ok(jpeg.clone())]);
        let queue = Arc::new(FrameQueue::new(4));
        let config = CaptureConfig {
            snapshot: Some(SnapshotConfig::default()),
            ..Default::default()
        };
        let mut session = CaptureSession::new(device, config, queue.clone());
        session.on_readable();

        assert_eq!(queue.pop().unwrap().data, Bytes::from(jpeg.clone()));
        assert_eq!(&session.snapshot().unwrap().latest().unwrap().data[..], &jpeg[..]);
    }

    #[test]
    fn worker_records_until_device_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let device = ScriptedDevice::new(
            PixelFormat::H264,
            vec![Ok(annex_b(&[SPS, PPS, IDR])), Ok(annex_b(&[P])), Ok(annex_b(&[P]))],
        );
        let registry = MuxerRegistry::new();
        let config = CaptureConfig {
            recording: Some(RecordingConfig::new(dir.path().join("w.mp4"))),
            ..Default::default()
        };
        let queue = Arc::new(FrameQueue::new(16));
        let session =
            CaptureSession::with_registry(device, config, queue.clone(), registry.clone());

        let worker = CaptureWorker::spawn(session, Duration::from_millis(10)).unwrap();
        let stats = worker.join().unwrap();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.units_posted, 5);
        assert!(registry.is_empty(), "muxer released after finish");

        let data = std::fs::read(dir.path().join("w.mp4")).unwrap();
        assert_eq!(&data[36..40], b"moov");
    }

    #[test]
    fn stop_flag_ends_worker() {
        struct Idle(VideoFormat);
        impl Device for Idle {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
                thread::sleep(timeout);
                Ok(false)
            }
            fn buffer_size(&self) -> usize {
                16
            }
            fn format(&self) -> VideoFormat {
                self.0
            }
        }

        let device = Idle(VideoFormat {
            width: 320,
            height: 240,
            fps: 30,
            pixel_format: PixelFormat::H264,
        });
        let queue = Arc::new(FrameQueue::new(1));
        let session = CaptureSession::new(device, CaptureConfig::default(), queue);
        let worker = CaptureWorker::spawn(session, Duration::from_millis(5)).unwrap();
        assert!(!worker.is_finished());

        let stats = worker.stop_and_join().unwrap();
        assert_eq!(stats.frames, 0);
    }
}
