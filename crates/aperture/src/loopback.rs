//! In-process device session that completes every accepted request from
//! its own worker thread. Useful for tests, examples, and driving the
//! pipeline without real hardware.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
    mpsc::{Sender, channel},
};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use aperture_core::prelude::BufferStatus;

use crate::device::{
    BufferResult, DeviceEvents, DeviceSession, DriverRequest, StreamDescriptor, SubmitStatus,
};

struct LoopInner {
    events: Mutex<Option<Arc<dyn DeviceEvents>>>,
    descriptors: Mutex<Vec<StreamDescriptor>>,
    delay: Duration,
    timestamp: AtomicU64,
}

/// Device session that echoes every request back as a successful
/// completion, with monotonically increasing timestamps.
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use aperture::prelude::*;
///
/// let device = Arc::new(LoopbackDevice::new());
/// let (session, events) = CaptureSession::new(device);
/// ```
pub struct LoopbackDevice {
    inner: Arc<LoopInner>,
    jobs: Mutex<Option<Sender<DriverRequest>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LoopbackDevice {
    /// Loopback completing requests as fast as they arrive.
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    /// Loopback holding each request for `delay` before completing it, to
    /// simulate a frame cadence.
    pub fn with_delay(delay: Duration) -> Self {
        let inner = Arc::new(LoopInner {
            events: Mutex::new(None),
            descriptors: Mutex::new(Vec::new()),
            delay,
            timestamp: AtomicU64::new(0),
        });
        let (tx, rx) = channel::<DriverRequest>();
        let worker = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("aperture-loopback".into())
                .spawn(move || {
                    info!("loopback device started");
                    while let Ok(request) = rx.recv() {
                        if !inner.delay.is_zero() {
                            thread::sleep(inner.delay);
                        }
                        let Some(events) = inner.events.lock().clone() else {
                            debug!(
                                sequence = request.sequence,
                                "no event sink attached, dropping completion"
                            );
                            continue;
                        };
                        let timestamp =
                            inner.timestamp.fetch_add(33_333_333, Ordering::Relaxed) + 1;
                        let buffers: Vec<BufferResult> = request
                            .buffers
                            .iter()
                            .map(|buffer| BufferResult {
                                stream_id: buffer.stream_id,
                                status: BufferStatus::Ok,
                                timestamp,
                            })
                            .collect();
                        events.on_request_result(request.sequence, request.settings, &buffers);
                    }
                    info!("loopback device stopped");
                })
                .expect("spawn loopback worker")
        };
        Self {
            inner,
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Descriptors from the most recent configuration.
    pub fn configured_streams(&self) -> Vec<StreamDescriptor> {
        self.inner.descriptors.lock().clone()
    }

    /// Stop the completion worker. Requests submitted afterwards are
    /// rejected.
    pub fn stop(&self) {
        self.jobs.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSession for LoopbackDevice {
    fn attach_events(&self, events: Arc<dyn DeviceEvents>) {
        *self.inner.events.lock() = Some(events);
    }

    fn configure(&self, streams: &[StreamDescriptor]) -> Result<(), String> {
        if streams.is_empty() {
            return Err("at least one stream is required".into());
        }
        *self.inner.descriptors.lock() = streams.to_vec();
        Ok(())
    }

    fn submit_batch(&self, batch: &[DriverRequest]) -> Vec<SubmitStatus> {
        let jobs = self.jobs.lock();
        batch
            .iter()
            .map(|request| match jobs.as_ref() {
                Some(tx) if tx.send(request.clone()).is_ok() => SubmitStatus::Accepted,
                _ => SubmitStatus::Rejected("loopback device is stopped".into()),
            })
            .collect()
    }

    fn flush(&self) {
        // Completions are already delivered in submission order as fast as
        // the worker drains them; there is nothing extra to recall.
        debug!("flush: loopback completions are immediate");
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        self.stop();
    }
}
