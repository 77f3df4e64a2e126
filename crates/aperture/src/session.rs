//! The capture session facade: owns the streams, the buffer records, and
//! the request engine, and implements the driver callback surface.

use std::collections::HashSet;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI32, Ordering},
    mpsc::{Receiver, Sender, channel},
};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use aperture_core::prelude::{
    BufferHandle, BufferStatus, Settings, StreamBuffer, Trigger,
};
use aperture_core::status::StatusTracker;

use crate::device::{BufferResult, DeviceErrorKind, DeviceEvents, DeviceSession};
use crate::endpoint::BufferEndpoint;
use crate::engine::{EngineConfig, EngineShared, LatestRequest, RequestEngine};
use crate::error::{EngineError, SessionError, StreamError, TrackerError};
use crate::request::{CaptureRequest, SessionEvent};
use crate::stream::{Stream, StreamCaps, StreamConfig, StreamDirection, StreamRegistry};
use crate::tracker::{BufferId, BufferRecords};

struct SessionShared {
    streams: Arc<StreamRegistry>,
    records: Arc<BufferRecords>,
    status: Arc<StatusTracker>,
    engine: Arc<EngineShared>,
    events: Sender<SessionEvent>,
    fatal: AtomicBool,
    next_stream_id: AtomicI32,
}

/// One capture session: streams, buffer records, and the submission
/// engine wired to a device session.
///
/// All state is scoped to the session object, so multiple sessions (and
/// test harnesses) never interfere.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use aperture::prelude::*;
///
/// let device = Arc::new(LoopbackDevice::new());
/// let (session, events) = CaptureSession::new(device);
///
/// let endpoint = Arc::new(FifoEndpoint::new(8));
/// let config = StreamConfig::output(
///     Resolution::new(640, 480).unwrap(),
///     FourCc::new(*b"NV12"),
/// );
/// let stream_id = session.add_stream(config, endpoint).unwrap();
/// session.configure().unwrap();
///
/// let sequence = session
///     .submit(CaptureRequest::new().target(stream_id))
///     .unwrap();
/// assert!(session.wait_until_submitted(sequence, Duration::from_secs(5)));
/// let _ = events;
/// ```
pub struct CaptureSession {
    shared: Arc<SessionShared>,
    engine: RequestEngine,
}

impl CaptureSession {
    /// Create a session over `device` with default engine tunables.
    ///
    /// Returns the session and the receiver for its notification events.
    pub fn new(device: Arc<dyn DeviceSession>) -> (Self, Receiver<SessionEvent>) {
        Self::with_config(device, EngineConfig::default())
    }

    /// Create a session with explicit engine tunables.
    pub fn with_config(
        device: Arc<dyn DeviceSession>,
        config: EngineConfig,
    ) -> (Self, Receiver<SessionEvent>) {
        let streams = Arc::new(StreamRegistry::new());
        let records = Arc::new(BufferRecords::new());
        let status = Arc::new(StatusTracker::new());
        let (events_tx, events_rx) = channel();
        let engine = RequestEngine::with_config(
            device.clone(),
            streams.clone(),
            records.clone(),
            events_tx.clone(),
            config,
        );
        let shared = Arc::new(SessionShared {
            streams,
            records,
            status,
            engine: engine.shared(),
            events: events_tx,
            fatal: AtomicBool::new(false),
            next_stream_id: AtomicI32::new(0),
        });
        device.attach_events(shared.clone());
        info!("capture session created");
        (Self { shared, engine }, events_rx)
    }

    /// Add a stream over `endpoint`, deriving its capabilities from the
    /// configured direction. Returns the assigned stream id.
    pub fn add_stream(
        &self,
        config: StreamConfig,
        endpoint: Arc<dyn BufferEndpoint>,
    ) -> Result<i32, SessionError> {
        let caps = match config.direction {
            StreamDirection::Output => StreamCaps::output(),
            StreamDirection::Input => StreamCaps::input(),
        };
        self.add_stream_with_caps(config, caps, endpoint)
    }

    /// Add a stream with explicit capability flags.
    pub fn add_stream_with_caps(
        &self,
        config: StreamConfig,
        caps: StreamCaps,
        endpoint: Arc<dyn BufferEndpoint>,
    ) -> Result<i32, SessionError> {
        if self.is_fatal() {
            return Err(SessionError::Fatal);
        }
        let id = self.shared.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let stream = Stream::new(id, config, caps, endpoint);
        stream.set_status_tracker(&self.shared.status);
        self.shared.streams.insert(stream);
        debug!(stream = id, "stream added");
        Ok(id)
    }

    /// Look up a stream by id.
    pub fn stream(&self, id: i32) -> Option<Arc<Stream>> {
        self.shared.streams.get(id)
    }

    /// Ids of all registered streams.
    pub fn stream_ids(&self) -> Vec<i32> {
        let mut ids = self.shared.streams.ids();
        ids.sort_unstable();
        ids
    }

    /// Remove a stream, returning the buffer ids its cache held so the
    /// driver-side cache can be invalidated.
    pub fn remove_stream(&self, id: i32) -> Result<Vec<BufferId>, SessionError> {
        let Some(stream) = self.shared.streams.get(id) else {
            return Ok(Vec::new());
        };
        if stream.has_outstanding() {
            return Err(SessionError::Stream(StreamError::OutstandingBuffers {
                stream: id,
            }));
        }
        self.shared.streams.remove(id);
        let ids = if self.shared.records.is_cached(id) {
            self.shared.records.clear_caches(id)
        } else {
            Vec::new()
        };
        stream.disconnect();
        Ok(ids)
    }

    /// Run a configuration round over every registered stream and hand the
    /// resulting descriptors to the device.
    ///
    /// Streams whose consumer endpoint disappeared are dropped (non-fatal,
    /// logged); everything else configures or the round fails.
    pub fn configure(&self) -> Result<(), SessionError> {
        if self.is_fatal() {
            return Err(SessionError::Fatal);
        }
        let mut streams = self.shared.streams.all();
        streams.sort_by_key(|stream| stream.id());

        for stream in &streams {
            stream.start_configuration().map_err(SessionError::Stream)?;
        }

        let mut abandoned = Vec::new();
        for stream in &streams {
            match stream.finish_configuration() {
                Ok(_) => {}
                Err(StreamError::Abandoned { stream: id }) => {
                    warn!(stream = id, "dropping abandoned stream");
                    abandoned.push(id);
                }
                Err(err) => return Err(SessionError::Stream(err)),
            }
        }
        for id in &abandoned {
            self.shared.streams.remove(*id);
        }

        let active: HashSet<i32> = self.shared.streams.ids().into_iter().collect();
        for id in &active {
            self.shared.records.try_create_cache(*id);
        }
        self.shared.records.remove_inactive_caches(&active);

        let descriptors: Vec<_> = {
            let mut streams = self.shared.streams.all();
            streams.sort_by_key(|stream| stream.id());
            streams.iter().map(|stream| stream.descriptor()).collect()
        };
        let device = self.engine_device();
        device.configure(&descriptors).map_err(|reason| {
            error!(reason = %reason, "device rejected stream configuration");
            SessionError::DeviceRejected(reason)
        })?;
        info!(streams = descriptors.len(), "session configured");
        Ok(())
    }

    /// Enqueue a single request. Returns its sequence number.
    pub fn submit(&self, request: CaptureRequest) -> Result<u64, EngineError> {
        self.engine.submit(request)
    }

    /// Enqueue several requests contiguously. Returns the last sequence
    /// number.
    pub fn submit_many(&self, requests: Vec<CaptureRequest>) -> Result<u64, EngineError> {
        self.engine.submit_many(requests)
    }

    /// Install a repeating request, resubmitted whenever the explicit
    /// queue is empty.
    pub fn submit_repeating(&self, request: CaptureRequest) -> Result<u64, EngineError> {
        self.engine.submit_repeating(request)
    }

    /// Install a repeating request list.
    pub fn submit_repeating_list(
        &self,
        requests: Vec<CaptureRequest>,
    ) -> Result<u64, EngineError> {
        self.engine.submit_repeating_list(requests)
    }

    /// Stop automatic resubmission. Returns the last sequence number a
    /// repeating copy was submitted under.
    pub fn clear_repeating(&self) -> Option<u64> {
        self.engine.clear_repeating()
    }

    /// Drop all queued work (reported as cancelled) and the repeating
    /// list. Returns the last submitted sequence number.
    pub fn clear(&self) -> Option<u64> {
        self.engine.clear()
    }

    /// Clear locally, then ask the driver to drain its in-flight work.
    pub fn flush(&self) -> Option<u64> {
        self.engine.flush()
    }

    /// Queue one-shot triggers for the next outgoing request.
    pub fn queue_triggers(&self, triggers: &[Trigger]) {
        self.engine.queue_triggers(triggers);
    }

    /// Pause submission once the queue drains. Use
    /// [`CaptureSession::wait_until_paused`] to confirm quiescence.
    pub fn pause(&self) {
        self.engine.pause();
    }

    /// Resume a paused engine.
    pub fn resume(&self) {
        self.engine.resume();
    }

    /// Block until the engine is parked.
    pub fn wait_until_paused(&self, timeout: Duration) -> bool {
        self.engine.wait_until_paused(timeout)
    }

    /// Block until the explicit queue is empty and the engine is between
    /// iterations.
    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        self.engine.wait_until_drained(timeout)
    }

    /// Block until the given sequence number has been submitted.
    pub fn wait_until_submitted(&self, sequence: u64, timeout: Duration) -> bool {
        self.engine.wait_until_submitted(sequence, timeout)
    }

    /// Block until every stream and the engine are idle.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        self.shared.status.wait_idle(timeout)
    }

    /// Snapshot of the most recently submitted request.
    pub fn latest_request(&self) -> Option<LatestRequest> {
        self.engine.latest_request()
    }

    /// Accepted requests past their completion deadline.
    pub fn stale_requests(&self) -> Vec<u64> {
        self.engine.stale_requests()
    }

    /// The session's buffer records, for cache invalidation bookkeeping
    /// and session-replacement moves.
    pub fn records(&self) -> &Arc<BufferRecords> {
        &self.shared.records
    }

    /// The session's idle/active registry.
    pub fn status(&self) -> &Arc<StatusTracker> {
        &self.shared.status
    }

    /// Submission counters.
    pub fn metrics(&self) -> aperture_core::metrics::EngineMetrics {
        self.engine.metrics()
    }

    /// Compare a stream's id cache against the ids the driver claims to
    /// hold. A mismatch means buffer identity can no longer be guaranteed:
    /// the session goes fatal rather than silently diverging.
    pub fn verify_device_cache(
        &self,
        stream: i32,
        claimed: &[BufferId],
    ) -> Result<(), SessionError> {
        if self.shared.records.verify_ids(stream, claimed) {
            return Ok(());
        }
        error!(stream, "buffer cache desynchronized, session is fatal");
        self.shared.fatal.store(true, Ordering::Release);
        self.shared.engine.set_fatal();
        Err(SessionError::Tracker(TrackerError::CacheDesync(stream)))
    }

    /// Swap the backing device session. Buffer ids and in-flight records
    /// stay valid; the new device receives the callback surface.
    pub fn replace_device(&self, device: Arc<dyn DeviceSession>) {
        device.attach_events(self.shared.clone());
        self.engine.set_device(device);
        info!("device session replaced");
    }

    /// Whether a fatal error stopped the session.
    pub fn is_fatal(&self) -> bool {
        self.shared.fatal.load(Ordering::Acquire)
    }

    /// Shut down the engine (queued requests are cancelled) and disconnect
    /// every stream.
    pub fn close(&mut self) {
        self.engine.shutdown();
        for stream in self.shared.streams.all() {
            stream.disconnect();
        }
    }

    fn engine_device(&self) -> Arc<dyn DeviceSession> {
        self.shared.engine.device_handle()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl SessionShared {
    fn return_completed_buffer(
        &self,
        sequence: u64,
        result: &BufferResult,
    ) {
        let Some(handle) = self.records.pop_inflight(sequence, result.stream_id) else {
            warn!(
                sequence,
                stream = result.stream_id,
                "completion for a buffer that is not in flight"
            );
            return;
        };
        let Some(stream) = self.streams.get(result.stream_id) else {
            warn!(stream = result.stream_id, "completion for a removed stream");
            return;
        };
        let transform = stream.config().rotation;
        let buffer = StreamBuffer {
            handle,
            status: result.status,
        };
        if let Err(err) = stream.return_buffer(buffer, result.timestamp, transform, true) {
            warn!(sequence, stream = result.stream_id, %err, "buffer return failed");
        }
    }

    fn send_event(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

impl DeviceEvents for SessionShared {
    fn on_request_result(&self, sequence: u64, metadata: Settings, buffers: &[BufferResult]) {
        for result in buffers {
            self.return_completed_buffer(sequence, result);
        }
        self.engine.complete(sequence);
        self.send_event(SessionEvent::ResultReady { sequence, metadata });
    }

    fn on_error(&self, sequence: Option<u64>, kind: DeviceErrorKind) {
        match kind {
            DeviceErrorKind::Fatal => {
                error!("driver reported a fatal error");
                self.fatal.store(true, Ordering::Release);
                self.engine.set_fatal();
            }
            DeviceErrorKind::Request => {
                // The whole request died; unwind whatever it had in
                // flight so no buffer leaks as permanently outstanding.
                if let Some(sequence) = sequence {
                    warn!(sequence, "driver failed a request, unwinding its buffers");
                    for (seq, stream_id) in self.records.inflight_keys() {
                        if seq != sequence {
                            continue;
                        }
                        self.return_completed_buffer(
                            seq,
                            &BufferResult {
                                stream_id,
                                status: BufferStatus::Error,
                                timestamp: 0,
                            },
                        );
                    }
                    self.engine.complete(sequence);
                }
            }
            DeviceErrorKind::Result | DeviceErrorKind::Buffer => {
                warn!(?sequence, ?kind, "driver reported a partial loss");
            }
        }
        self.send_event(SessionEvent::DeviceError { sequence, kind });
    }

    fn on_buffer_returned(&self, buffer_id: BufferId, status: BufferStatus) {
        let Some((stream_id, handle)) = self.records.pop_inflight_request(buffer_id) else {
            return;
        };
        let Some(stream) = self.streams.get(stream_id) else {
            warn!(stream = stream_id, "driver returned a buffer for a removed stream");
            return;
        };
        let transform = stream.config().rotation;
        if let Err(err) = stream.return_buffer(StreamBuffer { handle, status }, 0, transform, false)
        {
            warn!(stream = stream_id, %err, "driver-returned buffer rejected");
        }
    }

    fn on_buffers_requested(&self, stream_id: i32, count: usize) -> Vec<(BufferId, BufferHandle)> {
        let Some(stream) = self.streams.get(stream_id) else {
            warn!(stream = stream_id, "driver requested buffers for an unknown stream");
            return Vec::new();
        };
        let mut acquired = Vec::with_capacity(count);
        for _ in 0..count {
            let buffer = match stream.get_buffer(Duration::ZERO) {
                Ok(buffer) => buffer,
                Err(err) => {
                    debug!(stream = stream_id, %err, "driver buffer request cut short");
                    break;
                }
            };
            let handle = buffer.handle;
            let id = match self.records.get_or_assign_id(&handle, stream_id) {
                Ok((_, id)) => id,
                Err(err) => {
                    warn!(stream = stream_id, %err, "no id cache for driver buffer request");
                    let _ = stream.return_buffer(
                        StreamBuffer::error(handle),
                        0,
                        stream.config().rotation,
                        false,
                    );
                    break;
                }
            };
            if let Err(err) = self
                .records
                .push_inflight_request(id, handle.clone(), stream_id)
            {
                warn!(stream = stream_id, %err, "driver buffer request rejected");
                let _ = stream.return_buffer(
                    StreamBuffer::error(handle),
                    0,
                    stream.config().rotation,
                    false,
                );
                break;
            }
            acquired.push((id, handle));
        }
        acquired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DriverRequest, StreamDescriptor, SubmitStatus};
    use crate::endpoint::{ConsumerRecv, FifoEndpoint};
    use crate::loopback::LoopbackDevice;
    use aperture_core::prelude::{FourCc, Resolution};
    use parking_lot::Mutex;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    fn output_config() -> StreamConfig {
        StreamConfig::output(Resolution::new(64, 64).unwrap(), FourCc::new(*b"NV12"))
            .with_max_buffers(4)
            .with_wait_floor(Duration::from_millis(20))
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            buffer_wait: Duration::from_millis(100),
            expected_duration: Duration::from_secs(5),
        }
    }

    /// Device that accepts everything, never completes, and exposes the
    /// callback surface it was handed.
    #[derive(Default)]
    struct SinkDevice {
        events: Mutex<Option<Arc<dyn DeviceEvents>>>,
        submitted: Mutex<Vec<DriverRequest>>,
    }

    impl SinkDevice {
        fn callbacks(&self) -> Arc<dyn DeviceEvents> {
            self.events.lock().clone().expect("events attached")
        }
    }

    impl DeviceSession for SinkDevice {
        fn attach_events(&self, events: Arc<dyn DeviceEvents>) {
            *self.events.lock() = Some(events);
        }
        fn configure(&self, _streams: &[StreamDescriptor]) -> Result<(), String> {
            Ok(())
        }
        fn submit_batch(&self, batch: &[DriverRequest]) -> Vec<SubmitStatus> {
            let mut submitted = self.submitted.lock();
            batch.iter().for_each(|request| submitted.push(request.clone()));
            vec![SubmitStatus::Accepted; batch.len()]
        }
        fn flush(&self) {}
    }

    fn wait_for_results(events: &Receiver<SessionEvent>, count: usize) -> Vec<u64> {
        let deadline = Instant::now() + WAIT;
        let mut results = Vec::new();
        while results.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = events
                .recv_timeout(remaining)
                .expect("result event before timeout");
            if let SessionEvent::ResultReady { sequence, .. } = event {
                results.push(sequence);
            }
        }
        results
    }

    #[test]
    fn loopback_capture_roundtrip() {
        let device = Arc::new(LoopbackDevice::new());
        let (session, events) = CaptureSession::with_config(device, fast_config());
        let endpoint = Arc::new(FifoEndpoint::new(8));
        let consumer = endpoint.consumer();
        let stream_id = session
            .add_stream(output_config(), endpoint)
            .expect("add stream");
        session.configure().expect("configure");

        let mut sequences = Vec::new();
        for _ in 0..3 {
            sequences.push(
                session
                    .submit(CaptureRequest::new().target(stream_id))
                    .expect("submit"),
            );
        }
        let results = wait_for_results(&events, 3);
        assert_eq!(results, sequences);

        // Completed buffers flowed on to the consumer with increasing
        // timestamps, and nothing is left on loan.
        let mut last_timestamp = 0;
        let mut frames = 0;
        while let ConsumerRecv::Frame(frame) = consumer.recv() {
            assert!(frame.timestamp > last_timestamp);
            last_timestamp = frame.timestamp;
            consumer.release(frame);
            frames += 1;
        }
        assert_eq!(frames, 3);
        let stream = session.stream(stream_id).expect("stream");
        assert_eq!(stream.outstanding_count(), 0);
        assert!(session.records().inflight_keys().is_empty());
        assert!(session.wait_until_idle(WAIT));
    }

    #[test]
    fn repeating_preview_until_cleared() {
        let device = Arc::new(LoopbackDevice::new());
        let (session, events) = CaptureSession::with_config(device, fast_config());
        let endpoint = Arc::new(FifoEndpoint::with_limits(8, 2, 0));
        let consumer = endpoint.consumer();
        let stream_id = session
            .add_stream(output_config(), endpoint)
            .expect("add stream");
        session.configure().expect("configure");

        let predicted = session
            .submit_repeating(CaptureRequest::new().target(stream_id))
            .expect("repeating");
        let results = wait_for_results(&events, 5);
        assert!(results.iter().all(|sequence| *sequence >= predicted));

        let last = session.clear_repeating().expect("was repeating");
        assert!(last >= predicted);
        assert!(session.wait_until_drained(WAIT));
        assert!(session.wait_until_idle(WAIT));

        // The consumer kept receiving only the freshest frames.
        while let ConsumerRecv::Frame(frame) = consumer.recv() {
            consumer.release(frame);
        }
        assert_eq!(
            session.stream(stream_id).expect("stream").outstanding_count(),
            0
        );
    }

    #[test]
    fn driver_initiated_buffers_roundtrip() {
        let device = Arc::new(SinkDevice::default());
        let (session, _events) = CaptureSession::with_config(device.clone(), fast_config());
        let stream_id = session
            .add_stream(output_config(), Arc::new(FifoEndpoint::new(8)))
            .expect("add stream");
        session.configure().expect("configure");

        let callbacks = device.callbacks();
        let acquired = callbacks.on_buffers_requested(stream_id, 2);
        assert_eq!(acquired.len(), 2);
        let stream = session.stream(stream_id).expect("stream");
        assert_eq!(stream.outstanding_count(), 2);
        let mut ids: Vec<BufferId> = session.records().inflight_request_keys();
        ids.sort_unstable();
        let mut expected: Vec<BufferId> = acquired.iter().map(|(id, _)| *id).collect();
        expected.sort_unstable();
        assert_eq!(ids, expected);

        for (id, _) in &acquired {
            callbacks.on_buffer_returned(*id, BufferStatus::Ok);
        }
        assert_eq!(stream.outstanding_count(), 0);
        assert!(session.records().inflight_request_keys().is_empty());

        // A stale return is a protocol violation, logged and ignored.
        callbacks.on_buffer_returned(acquired[0].0, BufferStatus::Ok);
        assert_eq!(stream.outstanding_count(), 0);
    }

    #[test]
    fn request_error_unwinds_inflight_buffers() {
        let device = Arc::new(SinkDevice::default());
        let (session, events) = CaptureSession::with_config(device.clone(), fast_config());
        let stream_id = session
            .add_stream(output_config(), Arc::new(FifoEndpoint::new(8)))
            .expect("add stream");
        session.configure().expect("configure");

        let sequence = session
            .submit(CaptureRequest::new().target(stream_id))
            .expect("submit");
        assert!(session.wait_until_submitted(sequence, WAIT));
        let stream = session.stream(stream_id).expect("stream");
        assert_eq!(stream.outstanding_count(), 1);

        device
            .callbacks()
            .on_error(Some(sequence), DeviceErrorKind::Request);
        assert_eq!(stream.outstanding_count(), 0);
        assert!(session.records().inflight_keys().is_empty());

        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining).expect("event") {
                SessionEvent::DeviceError {
                    sequence: Some(seq),
                    kind,
                } => {
                    assert_eq!(seq, sequence);
                    assert_eq!(kind, DeviceErrorKind::Request);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[test]
    fn fatal_device_error_stops_the_session() {
        let device = Arc::new(SinkDevice::default());
        let (session, _events) = CaptureSession::with_config(device.clone(), fast_config());
        let stream_id = session
            .add_stream(output_config(), Arc::new(FifoEndpoint::new(8)))
            .expect("add stream");
        session.configure().expect("configure");

        device.callbacks().on_error(None, DeviceErrorKind::Fatal);
        assert!(session.is_fatal());
        assert_eq!(
            session.submit(CaptureRequest::new().target(stream_id)),
            Err(EngineError::DeviceFatal)
        );
        assert!(matches!(session.configure(), Err(SessionError::Fatal)));
    }

    #[test]
    fn cache_desync_is_fatal() {
        let device = Arc::new(SinkDevice::default());
        let (session, _events) = CaptureSession::with_config(device, fast_config());
        let stream_id = session
            .add_stream(output_config(), Arc::new(FifoEndpoint::new(8)))
            .expect("add stream");
        session.configure().expect("configure");

        let sequence = session
            .submit(CaptureRequest::new().target(stream_id))
            .expect("submit");
        assert!(session.wait_until_submitted(sequence, WAIT));

        // The driver's claimed cache disagrees with ours.
        let err = session
            .verify_device_cache(stream_id, &[BufferId(99)])
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::Tracker(TrackerError::CacheDesync(stream_id))
        );
        assert!(session.is_fatal());
        assert_eq!(
            session.submit(CaptureRequest::new().target(stream_id)),
            Err(EngineError::DeviceFatal)
        );
    }

    #[test]
    fn verify_accepts_a_matching_cache() {
        let device = Arc::new(SinkDevice::default());
        let (session, _events) = CaptureSession::with_config(device.clone(), fast_config());
        let stream_id = session
            .add_stream(output_config(), Arc::new(FifoEndpoint::new(8)))
            .expect("add stream");
        session.configure().expect("configure");
        let sequence = session
            .submit(CaptureRequest::new().target(stream_id))
            .expect("submit");
        assert!(session.wait_until_submitted(sequence, WAIT));

        let submitted = device.submitted.lock();
        let ids: Vec<BufferId> = submitted[0].buffers.iter().map(|b| b.buffer_id).collect();
        drop(submitted);
        session
            .verify_device_cache(stream_id, &ids)
            .expect("caches agree");
        assert!(!session.is_fatal());
    }

    #[test]
    fn buffer_ids_cross_the_boundary_once() {
        let device = Arc::new(SinkDevice::default());
        let (session, events) = CaptureSession::with_config(device.clone(), fast_config());
        let stream_id = session
            .add_stream(output_config(), Arc::new(FifoEndpoint::new(8)))
            .expect("add stream");
        session.configure().expect("configure");

        let first = session
            .submit(CaptureRequest::new().target(stream_id))
            .expect("submit");
        assert!(session.wait_until_submitted(first, WAIT));
        // Complete it so the same buffer can circulate again.
        {
            let submitted = device.submitted.lock();
            let request = submitted[0].clone();
            drop(submitted);
            device.callbacks().on_request_result(
                request.sequence,
                Settings::new(),
                &[BufferResult {
                    stream_id,
                    status: BufferStatus::Ok,
                    timestamp: 1,
                }],
            );
        }
        let second = session
            .submit(CaptureRequest::new().target(stream_id))
            .expect("submit");
        assert!(session.wait_until_submitted(second, WAIT));

        let submitted = device.submitted.lock();
        let first_buffer = &submitted[0].buffers[0];
        let second_buffer = &submitted[1].buffers[0];
        // FIFO endpoint recycles LIFO, so the second request reuses the
        // same allocation: same id, and no handle retransmission.
        assert_eq!(first_buffer.buffer_id, second_buffer.buffer_id);
        assert!(first_buffer.handle.is_some());
        assert!(second_buffer.handle.is_none());
        drop(submitted);
        let _ = events;
    }

    #[test]
    fn remove_stream_reports_cached_ids() {
        let device = Arc::new(SinkDevice::default());
        let (session, _events) = CaptureSession::with_config(device.clone(), fast_config());
        let stream_id = session
            .add_stream(output_config(), Arc::new(FifoEndpoint::new(8)))
            .expect("add stream");
        session.configure().expect("configure");
        let sequence = session
            .submit(CaptureRequest::new().target(stream_id))
            .expect("submit");
        assert!(session.wait_until_submitted(sequence, WAIT));

        // Still on loan: removal is refused.
        assert!(matches!(
            session.remove_stream(stream_id),
            Err(SessionError::Stream(StreamError::OutstandingBuffers { .. }))
        ));
        let submitted = device.submitted.lock()[0].clone();
        device.callbacks().on_request_result(
            submitted.sequence,
            Settings::new(),
            &[BufferResult {
                stream_id,
                status: BufferStatus::Ok,
                timestamp: 1,
            }],
        );
        let ids = session.remove_stream(stream_id).expect("remove");
        assert_eq!(ids.len(), 1);
        assert!(session.stream(stream_id).is_none());
    }

    #[test]
    fn replace_device_redirects_submissions() {
        let first = Arc::new(SinkDevice::default());
        let (session, _events) = CaptureSession::with_config(first.clone(), fast_config());
        let stream_id = session
            .add_stream(output_config(), Arc::new(FifoEndpoint::new(8)))
            .expect("add stream");
        session.configure().expect("configure");
        let a = session
            .submit(CaptureRequest::new().target(stream_id))
            .expect("submit");
        assert!(session.wait_until_submitted(a, WAIT));

        let second = Arc::new(SinkDevice::default());
        session.replace_device(second.clone());
        let b = session
            .submit(CaptureRequest::new().target(stream_id))
            .expect("submit");
        assert!(session.wait_until_submitted(b, WAIT));

        assert_eq!(first.submitted.lock().len(), 1);
        assert_eq!(second.submitted.lock().len(), 1);
    }

    #[test]
    fn stream_ids_are_session_scoped() {
        let (session_a, _events_a) =
            CaptureSession::with_config(Arc::new(SinkDevice::default()), fast_config());
        let (session_b, _events_b) =
            CaptureSession::with_config(Arc::new(SinkDevice::default()), fast_config());
        let a = session_a
            .add_stream(output_config(), Arc::new(FifoEndpoint::new(4)))
            .expect("add");
        let b = session_b
            .add_stream(output_config(), Arc::new(FifoEndpoint::new(4)))
            .expect("add");
        assert_eq!(a, 0);
        assert_eq!(b, 0);
    }
}
