//! Stream state machine and per-stream buffer flow control.
//!
//! A stream is one directional buffer queue bound to a consumer/producer
//! endpoint. It enforces the outstanding-buffer limit, blocks acquirers
//! when the limit is reached, and owns the configure/prepare/idle
//! lifecycle.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, warn};

use aperture_core::prelude::{
    BufferHandle, BufferStatus, DataSpace, FourCc, Resolution, Rotation, StreamBuffer,
    StreamMetrics, usage,
};
use aperture_core::status::{ComponentId, StatusTracker};

use crate::device::StreamDescriptor;
use crate::endpoint::{BufferEndpoint, EndpointError};
use crate::error::StreamError;

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, endpoint not yet negotiated.
    Constructed,
    /// First configuration round in progress.
    Configuring,
    /// Ready to exchange buffers.
    Configured,
    /// Parameters being changed on an already-configured stream.
    Reconfiguring,
    /// Pre-allocating buffers ahead of first use.
    Preparing,
    /// Paused without discarding the endpoint connection.
    Idle,
    /// Consumer endpoint disappeared; drop the stream.
    Abandoned,
    /// Unrecoverable configuration failure.
    Error,
}

/// Direction of buffer flow relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StreamDirection {
    /// Device fills buffers for the consumer.
    Output,
    /// Consumer provides buffers the device reads (reprocessing).
    Input,
}

/// Capability flags describing a stream variant.
///
/// Variants (plain output, reprocessing input, surface-shared output) are
/// all driven by the same state machine; only the flags differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCaps {
    /// Device may write frames into this stream's buffers.
    pub supports_output: bool,
    /// Device may read frames out of this stream's buffers.
    pub supports_input: bool,
    /// One buffer queue feeds multiple consumer surfaces.
    pub shared_surfaces: bool,
}

impl StreamCaps {
    /// Plain output stream.
    pub fn output() -> Self {
        Self {
            supports_output: true,
            supports_input: false,
            shared_surfaces: false,
        }
    }

    /// Reprocessing input stream.
    pub fn input() -> Self {
        Self {
            supports_output: false,
            supports_input: true,
            shared_surfaces: false,
        }
    }

    /// Output stream shared across multiple surfaces.
    pub fn shared_output() -> Self {
        Self {
            shared_surfaces: true,
            ..Self::output()
        }
    }
}

/// Negotiated parameters of a stream.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use aperture::prelude::*;
///
/// let config = StreamConfig::output(
///     Resolution::new(1920, 1080).unwrap(),
///     FourCc::new(*b"NV12"),
/// )
/// .with_max_buffers(2)
/// .with_wait_floor(Duration::from_millis(100));
/// assert_eq!(config.max_buffers, 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Frame geometry.
    pub resolution: Resolution,
    /// Pixel format fourcc.
    pub format: FourCc,
    /// Color/dataspace tag.
    pub data_space: DataSpace,
    /// Presentation rotation.
    pub rotation: Rotation,
    /// Buffer flow direction.
    pub direction: StreamDirection,
    /// Maximum buffers that may be on loan simultaneously.
    pub max_buffers: usize,
    /// Negotiated usage bits (consumer bits merged in at configuration).
    pub usage: u64,
    /// Byte size for opaque formats; ignored for pixel grids.
    pub max_size: usize,
    /// Stream-group id for multi-resolution grouping.
    pub group: Option<i32>,
    /// Minimum bound applied to buffer waits, so tight limits do not turn
    /// into busy-loops.
    pub wait_floor: Duration,
}

impl StreamConfig {
    /// Output stream with defaults (4 buffers, 3 s wait floor).
    pub fn output(resolution: Resolution, format: FourCc) -> Self {
        Self {
            resolution,
            format,
            data_space: DataSpace::Unknown,
            rotation: Rotation::Deg0,
            direction: StreamDirection::Output,
            max_buffers: 4,
            usage: usage::DEVICE_OUTPUT,
            max_size: 0,
            group: None,
            wait_floor: Duration::from_secs(3),
        }
    }

    /// Input stream with defaults.
    pub fn input(resolution: Resolution, format: FourCc) -> Self {
        Self {
            direction: StreamDirection::Input,
            usage: usage::DEVICE_INPUT,
            ..Self::output(resolution, format)
        }
    }

    /// Set the outstanding-buffer limit.
    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers.max(1);
        self
    }

    /// Set the dataspace tag.
    pub fn with_data_space(mut self, data_space: DataSpace) -> Self {
        self.data_space = data_space;
        self
    }

    /// Set the presentation rotation.
    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Set the byte size for an opaque format.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Assign the stream to a multi-resolution group.
    pub fn with_group(mut self, group: i32) -> Self {
        self.group = Some(group);
        self
    }

    /// Set the minimum buffer-wait bound.
    pub fn with_wait_floor(mut self, wait_floor: Duration) -> Self {
        self.wait_floor = wait_floor;
        self
    }
}

/// Rollback snapshot taken when a configuration round starts.
#[derive(Debug, Clone, PartialEq)]
struct ConfigSnapshot {
    usage: u64,
    max_buffers: usize,
    format: FourCc,
    data_space: DataSpace,
}

impl ConfigSnapshot {
    fn of(config: &StreamConfig) -> Self {
        Self {
            usage: config.usage,
            max_buffers: config.max_buffers,
            format: config.format,
            data_space: config.data_space,
        }
    }
}

/// Notification payload for buffer listeners.
#[derive(Debug, Clone)]
pub struct BufferEvent {
    /// Stream the buffer belongs to.
    pub stream_id: i32,
    /// Whether the buffer carried error status.
    pub error: bool,
    /// Capture timestamp (0 on acquire).
    pub timestamp: u64,
    /// Whether this is an output-direction exchange.
    pub output: bool,
}

/// Observer of buffer acquire/release on a stream.
///
/// Listeners are held weakly and pruned once dropped. Callbacks run with
/// the stream lock held; they must not call back into the stream.
pub trait StreamBufferListener: Send + Sync {
    /// A buffer was handed out to the pipeline.
    fn on_buffer_acquired(&self, event: &BufferEvent);
    /// A buffer was returned toward the consumer.
    fn on_buffer_released(&self, event: &BufferEvent);
}

/// Progress of a buffer-preparation round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareProgress {
    /// All requested buffers are allocated; the stream is configured again.
    Complete,
    /// More `prepare_next_buffer` calls are needed.
    Preparing,
}

struct Inner {
    state: StreamState,
    config: StreamConfig,
    old: Option<ConfigSnapshot>,
    outstanding: Vec<BufferHandle>,
    listeners: Vec<Weak<dyn StreamBufferListener>>,
    last_timestamp: u64,
    /// Set once any buffer has been exchanged; preparation is then
    /// pointless and disallowed.
    unpreparable: bool,
    prepared: bool,
    prepare_blocks_requests: bool,
    prepared_buffers: Vec<BufferHandle>,
    prepare_target: usize,
    /// Largest buffer count a previous preparation round covered.
    last_prepare_max: usize,
    status_tracker: Weak<StatusTracker>,
    status_id: Option<ComponentId>,
}

/// One buffer queue bound to a consumer/producer endpoint.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use aperture::prelude::*;
///
/// let endpoint = Arc::new(FifoEndpoint::new(4));
/// let config = StreamConfig::output(
///     Resolution::new(640, 480).unwrap(),
///     FourCc::new(*b"NV12"),
/// )
/// .with_max_buffers(2);
/// let stream = Stream::new(0, config, StreamCaps::output(), endpoint);
/// stream.start_configuration().unwrap();
/// stream.finish_configuration().unwrap();
/// let buffer = stream.get_buffer(Duration::from_millis(10)).unwrap();
/// stream.return_buffer(buffer, 1, Rotation::Deg0, true).unwrap();
/// ```
pub struct Stream {
    id: i32,
    caps: StreamCaps,
    endpoint: Arc<dyn BufferEndpoint>,
    metrics: Arc<StreamMetrics>,
    inner: Mutex<Inner>,
    returned_cv: Condvar,
}

impl Stream {
    /// Create a stream over `endpoint`.
    ///
    /// An opaque-format configuration without a byte size puts the stream
    /// straight into the error state.
    pub fn new(
        id: i32,
        config: StreamConfig,
        caps: StreamCaps,
        endpoint: Arc<dyn BufferEndpoint>,
    ) -> Arc<Self> {
        let mut state = StreamState::Constructed;
        if config.format.is_opaque() && config.max_size == 0 {
            error!(stream = id, format = %config.format, "opaque format with zero max_size");
            state = StreamState::Error;
        }
        Arc::new(Self {
            id,
            caps,
            endpoint,
            metrics: Arc::new(StreamMetrics::default()),
            inner: Mutex::new(Inner {
                state,
                config,
                old: None,
                outstanding: Vec::new(),
                listeners: Vec::new(),
                last_timestamp: 0,
                unpreparable: false,
                prepared: false,
                prepare_blocks_requests: true,
                prepared_buffers: Vec::new(),
                prepare_target: 0,
                last_prepare_max: 0,
                status_tracker: Weak::new(),
                status_id: None,
            }),
            returned_cv: Condvar::new(),
        })
    }

    /// Stable stream id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Capability flags of this variant.
    pub fn caps(&self) -> StreamCaps {
        self.caps
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> StreamConfig {
        self.inner.lock().config.clone()
    }

    /// Multi-resolution group id, if any.
    pub fn group(&self) -> Option<i32> {
        self.inner.lock().config.group
    }

    /// Outstanding-buffer limit.
    pub fn max_buffers(&self) -> usize {
        self.inner.lock().config.max_buffers
    }

    /// Number of buffers currently on loan.
    pub fn outstanding_count(&self) -> usize {
        self.inner.lock().outstanding.len()
    }

    /// Whether any buffer is on loan.
    pub fn has_outstanding(&self) -> bool {
        !self.inner.lock().outstanding.is_empty()
    }

    /// Whether the consumer endpoint disappeared.
    pub fn is_abandoned(&self) -> bool {
        self.inner.lock().state == StreamState::Abandoned
    }

    /// Whether a configuration round is in progress.
    pub fn is_configuring(&self) -> bool {
        matches!(
            self.inner.lock().state,
            StreamState::Configuring | StreamState::Reconfiguring
        )
    }

    /// Whether an in-progress preparation should hold off request
    /// submission targeting this stream.
    pub fn is_blocked_by_prepare(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == StreamState::Preparing && inner.prepare_blocks_requests
    }

    /// Whether a preparation round has pre-allocated this stream's
    /// buffers since the last (re)configuration or teardown.
    pub fn is_prepared(&self) -> bool {
        self.inner.lock().prepared
    }

    /// Buffer traffic counters.
    pub fn metrics(&self) -> StreamMetrics {
        (*self.metrics).clone()
    }

    /// Driver-facing descriptor for this stream.
    pub fn descriptor(&self) -> StreamDescriptor {
        let inner = self.inner.lock();
        StreamDescriptor {
            stream_id: self.id,
            resolution: inner.config.resolution,
            format: inner.config.format,
            data_space: inner.config.data_space,
            rotation: inner.config.rotation,
            direction: inner.config.direction,
            max_buffers: inner.config.max_buffers,
            usage: inner.config.usage,
            group: inner.config.group,
        }
    }

    /// Attach the session's idle/active registry. Replaces any previous
    /// registration.
    pub fn set_status_tracker(&self, tracker: &Arc<StatusTracker>) {
        let mut inner = self.inner.lock();
        if let (Some(old), Some(id)) = (inner.status_tracker.upgrade(), inner.status_id) {
            old.remove_component(id);
        }
        inner.status_id = None;
        inner.status_tracker = Arc::downgrade(tracker);
    }

    /// Register a buffer listener. Duplicate registrations are ignored.
    pub fn add_buffer_listener(&self, listener: &Arc<dyn StreamBufferListener>) {
        let mut inner = self.inner.lock();
        let already = inner
            .listeners
            .iter()
            .any(|weak| weak.as_ptr() == Arc::as_ptr(listener));
        if already {
            warn!(stream = self.id, "buffer listener registered twice, ignoring");
            return;
        }
        inner.listeners.push(Arc::downgrade(listener));
    }

    /// Remove a buffer listener.
    pub fn remove_buffer_listener(&self, listener: &Arc<dyn StreamBufferListener>) {
        let mut inner = self.inner.lock();
        inner
            .listeners
            .retain(|weak| weak.as_ptr() != Arc::as_ptr(listener));
    }

    /// Begin a configuration round, recording the prior parameters for
    /// rollback.
    pub fn start_configuration(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock();
        match inner.state {
            StreamState::Error | StreamState::Preparing | StreamState::Abandoned => {
                return Err(self.invalid(&inner, "start configuration"));
            }
            // A round is already open; keep the original rollback snapshot.
            StreamState::Configuring | StreamState::Reconfiguring => return Ok(()),
            StreamState::Constructed | StreamState::Idle => {}
            StreamState::Configured => {
                if !inner.outstanding.is_empty() {
                    error!(
                        stream = self.id,
                        "cannot reconfigure with outstanding buffers"
                    );
                    return Err(StreamError::OutstandingBuffers { stream: self.id });
                }
            }
        }

        inner.old = Some(ConfigSnapshot::of(&inner.config));

        let consumer_usage = self.endpoint.usage().map_err(|err| {
            error!(stream = self.id, %err, "cannot query endpoint usage");
            StreamError::ConfigurationRejected {
                stream: self.id,
                reason: format!("endpoint usage query failed: {err}"),
            }
        })?;
        let direction_bit = match inner.config.direction {
            StreamDirection::Output => usage::DEVICE_OUTPUT,
            StreamDirection::Input => usage::DEVICE_INPUT,
        };
        inner.config.usage = direction_bit | consumer_usage;

        if inner.state == StreamState::Idle {
            // Idle streams keep their queue connection; nothing to redo.
            return Ok(());
        }

        if let (Some(tracker), Some(id)) = (inner.status_tracker.upgrade(), inner.status_id) {
            tracker.remove_component(id);
            inner.status_id = None;
        }

        inner.state = if inner.state == StreamState::Constructed {
            StreamState::Configuring
        } else {
            StreamState::Reconfiguring
        };
        Ok(())
    }

    /// Complete a configuration round, (re)allocating the endpoint queue.
    ///
    /// Returns `true` when an already-configured stream was actually
    /// reallocated; returns `false` when nothing changed and reallocation
    /// was skipped.
    pub fn finish_configuration(&self) -> Result<bool, StreamError> {
        let mut inner = self.inner.lock();
        match inner.state {
            StreamState::Configuring | StreamState::Reconfiguring => {}
            StreamState::Idle => return Ok(false),
            _ => return Err(self.invalid(&inner, "finish a configuration that was not started")),
        }

        if inner.status_id.is_none() {
            if let Some(tracker) = inner.status_tracker.upgrade() {
                inner.status_id = Some(tracker.add_component(&format!("stream {}", self.id)));
            }
        }

        // Unchanged parameters: skip the reallocation entirely.
        if inner.state == StreamState::Reconfiguring
            && inner.old.as_ref() == Some(&ConfigSnapshot::of(&inner.config))
        {
            inner.state = StreamState::Configured;
            return Ok(false);
        }

        // Existing allocations are invalid from here on.
        inner.prepared = false;
        inner.prepare_blocks_requests = true;
        inner.unpreparable = false;

        let reconfiguring = inner.state == StreamState::Reconfiguring;
        match self.endpoint.configure(&inner.config) {
            Ok(()) => {}
            Err(EndpointError::Disconnected) => {
                warn!(stream = self.id, "endpoint gone during configuration");
                inner.state = StreamState::Abandoned;
                return Err(StreamError::Abandoned { stream: self.id });
            }
            Err(err) => {
                error!(stream = self.id, %err, "endpoint rejected configuration");
                inner.state = StreamState::Error;
                return Err(StreamError::ConfigurationRejected {
                    stream: self.id,
                    reason: err.to_string(),
                });
            }
        }
        inner.state = StreamState::Configured;
        Ok(reconfiguring)
    }

    /// Abort a configuration round, restoring the recorded usage and
    /// buffer count.
    pub fn cancel_configuration(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock();
        match inner.state {
            StreamState::Configuring | StreamState::Reconfiguring | StreamState::Idle => {}
            _ => return Err(self.invalid(&inner, "cancel a configuration that was not started")),
        }
        if let Some(old) = inner.old.take() {
            inner.config.usage = old.usage;
            inner.config.max_buffers = old.max_buffers;
        }
        inner.state = if inner.state == StreamState::Configuring {
            StreamState::Constructed
        } else {
            StreamState::Configured
        };
        Ok(())
    }

    /// Pause the stream without discarding its queue connection.
    pub fn force_to_idle(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock();
        if inner.state != StreamState::Configured {
            return Err(self.invalid(&inner, "idle"));
        }
        if !inner.outstanding.is_empty() {
            if let (Some(tracker), Some(id)) = (inner.status_tracker.upgrade(), inner.status_id) {
                tracker.mark_idle(id);
            }
        }
        inner.state = StreamState::Idle;
        Ok(())
    }

    /// Undo [`Stream::force_to_idle`].
    pub fn restore_configured_state(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock();
        if inner.state != StreamState::Idle {
            return Err(self.invalid(&inner, "restore the configured state"));
        }
        if !inner.outstanding.is_empty() {
            if let (Some(tracker), Some(id)) = (inner.status_tracker.upgrade(), inner.status_id) {
                tracker.mark_active(id);
            }
        }
        inner.state = StreamState::Configured;
        Ok(())
    }

    /// Mark the stream as having exchanged buffers, permanently disallowing
    /// preparation.
    pub fn mark_unpreparable(&self) {
        self.inner.lock().unpreparable = true;
    }

    /// Begin pre-allocating up to `max_count` buffers (`None` = the
    /// endpoint's full pool) before first use.
    ///
    /// Returns [`PrepareProgress::Complete`] when a previous round already
    /// covered the requested count.
    pub fn start_prepare(
        &self,
        max_count: Option<usize>,
        blocks_requests: bool,
    ) -> Result<PrepareProgress, StreamError> {
        let mut inner = self.inner.lock();
        if inner.state != StreamState::Configured {
            return Err(self.invalid(&inner, "prepare"));
        }
        if inner.unpreparable {
            error!(stream = self.id, "cannot prepare a stream that is already in use");
            return Err(self.invalid(&inner, "prepare a stream that is already in use"));
        }
        if !inner.outstanding.is_empty() {
            return Err(StreamError::OutstandingBuffers { stream: self.id });
        }

        let pipeline_max = self.endpoint.buffer_count();
        let count = max_count.map_or(pipeline_max, |n| n.min(pipeline_max));

        if count <= inner.last_prepare_max {
            inner.prepared = true;
            inner.prepare_blocks_requests = blocks_requests;
            return Ok(PrepareProgress::Complete);
        }

        inner.last_prepare_max = count;
        inner.prepare_blocks_requests = blocks_requests;
        inner.prepared_buffers.clear();
        inner.prepare_target = count;
        inner.state = StreamState::Preparing;
        Ok(PrepareProgress::Preparing)
    }

    /// Allocate one buffer of an in-progress preparation round.
    ///
    /// Allocation may take a while for large buffers. A failed allocation
    /// is recoverable: the stream stays in `Preparing` so the caller can
    /// either retry or [`Stream::cancel_prepare`].
    pub fn prepare_next_buffer(&self) -> Result<PrepareProgress, StreamError> {
        let mut inner = self.inner.lock();
        if inner.state != StreamState::Preparing {
            return Err(self.invalid(&inner, "prepare a buffer"));
        }
        let handle = match self.endpoint.dequeue() {
            Ok(handle) => handle,
            Err(err) => {
                error!(
                    stream = self.id,
                    index = inner.prepared_buffers.len(),
                    %err,
                    "buffer allocation failed during preparation"
                );
                return Err(StreamError::Starved { stream: self.id });
            }
        };
        inner.prepared_buffers.push(handle);
        if inner.prepared_buffers.len() < inner.prepare_target {
            return Ok(PrepareProgress::Preparing);
        }
        inner.prepared = true;
        self.cancel_prepare_locked(&mut inner);
        Ok(PrepareProgress::Complete)
    }

    /// Abort preparation, returning all allocated buffers to the endpoint
    /// in error status (they were never filled).
    pub fn cancel_prepare(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock();
        if inner.state != StreamState::Preparing {
            return Err(self.invalid(&inner, "cancel a preparation that was not started"));
        }
        self.cancel_prepare_locked(&mut inner);
        Ok(())
    }

    fn cancel_prepare_locked(&self, inner: &mut Inner) {
        for handle in inner.prepared_buffers.drain(..) {
            if let Err(err) =
                self.endpoint
                    .enqueue(StreamBuffer::error(handle), 0, inner.config.rotation)
            {
                debug!(stream = self.id, %err, "prepared buffer could not be recycled");
            }
        }
        inner.prepare_target = 0;
        inner.state = StreamState::Configured;
    }

    /// Acquire a free buffer, blocking while the stream is at its
    /// outstanding limit.
    ///
    /// The effective wait bound is `max(timeout, wait_floor)`. A timeout is
    /// recoverable; fail the affected request and retry later.
    pub fn get_buffer(&self, timeout: Duration) -> Result<StreamBuffer, StreamError> {
        let mut inner = self.inner.lock();
        if inner.state != StreamState::Configured {
            return if inner.state == StreamState::Abandoned {
                Err(StreamError::Abandoned { stream: self.id })
            } else {
                Err(self.invalid(&inner, "get a buffer"))
            };
        }

        let outstanding = inner.outstanding.len();
        if outstanding == inner.config.max_buffers {
            let bound = timeout.max(inner.config.wait_floor);
            debug!(
                stream = self.id,
                max_buffers = inner.config.max_buffers,
                "at outstanding limit, waiting for a returned buffer"
            );
            self.metrics.limit_wait();
            let result = self.returned_cv.wait_for(&mut inner, bound);
            if result.timed_out() {
                warn!(
                    stream = self.id,
                    waited_ms = bound.as_millis() as u64,
                    max_buffers = inner.config.max_buffers,
                    "wait for a returned buffer timed out"
                );
                self.metrics.timeout();
                return Err(StreamError::BufferTimeout {
                    stream: self.id,
                    waited: bound,
                });
            }
            if inner.outstanding.len() >= outstanding {
                error!(
                    stream = self.id,
                    before = outstanding,
                    after = inner.outstanding.len(),
                    "outstanding count did not decrease; concurrent acquire detected"
                );
                return Err(StreamError::ConcurrentAcquire { stream: self.id });
            }
        }

        let handle = match self.endpoint.dequeue() {
            Ok(handle) => handle,
            Err(EndpointError::Disconnected) => {
                warn!(stream = self.id, "endpoint abandoned while acquiring");
                inner.state = StreamState::Abandoned;
                return Err(StreamError::Abandoned { stream: self.id });
            }
            Err(_) => return Err(StreamError::Starved { stream: self.id }),
        };

        inner.unpreparable = true;
        let became_active = inner.outstanding.is_empty();
        inner.outstanding.push(handle.clone());
        if became_active {
            if let (Some(tracker), Some(id)) = (inner.status_tracker.upgrade(), inner.status_id) {
                tracker.mark_active(id);
            }
        }
        self.metrics.acquire();
        let event = BufferEvent {
            stream_id: self.id,
            error: false,
            timestamp: 0,
            output: self.caps.supports_output,
        };
        Self::fire_listeners(&mut inner, &event, true);
        Ok(StreamBuffer::ok(handle))
    }

    /// Return a buffer toward the consumer.
    ///
    /// Only buffers currently on loan are accepted. When
    /// `timestamp_increasing` is set and the timestamp goes backwards, the
    /// buffer is forwarded in error status instead of failing the call:
    /// capture timestamps are best-effort monotonic.
    pub fn return_buffer(
        &self,
        buffer: StreamBuffer,
        timestamp: u64,
        transform: Rotation,
        timestamp_increasing: bool,
    ) -> Result<(), StreamError> {
        let mut inner = self.inner.lock();

        let position = inner
            .outstanding
            .iter()
            .position(|handle| *handle == buffer.handle);
        let Some(position) = position else {
            error!(stream = self.id, "returning an unknown buffer");
            return Err(StreamError::UnknownBuffer { stream: self.id });
        };
        inner.outstanding.swap_remove(position);

        let mut buffer = buffer;
        if timestamp_increasing
            && timestamp != 0
            && timestamp <= inner.last_timestamp
            && !buffer.status.is_error()
        {
            warn!(
                stream = self.id,
                timestamp,
                previous = inner.last_timestamp,
                "timestamp is not increasing, forwarding buffer in error status"
            );
            buffer.status = BufferStatus::Error;
        }
        inner.last_timestamp = timestamp;

        let event = BufferEvent {
            stream_id: self.id,
            error: buffer.status.is_error(),
            timestamp,
            output: self.caps.supports_output,
        };
        let result = match self.endpoint.enqueue(buffer, timestamp, transform) {
            Ok(()) => {
                Self::fire_listeners(&mut inner, &event, false);
                Ok(())
            }
            Err(err) => {
                warn!(stream = self.id, %err, "endpoint refused returned buffer");
                Err(StreamError::Abandoned { stream: self.id })
            }
        };

        if inner.outstanding.is_empty() {
            if let (Some(tracker), Some(id)) = (inner.status_tracker.upgrade(), inner.status_id) {
                tracker.mark_idle(id);
            }
        }
        self.metrics.ret();

        // Wake waiters even if the endpoint refused the buffer; the
        // outstanding count decreased either way.
        self.returned_cv.notify_all();
        result
    }

    /// Free unused endpoint buffers by disconnecting and reconnecting the
    /// queue. Buffers already delivered drain naturally.
    pub fn tear_down(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock();
        if inner.state != StreamState::Configured {
            return Err(self.invalid(&inner, "tear down"));
        }
        if !inner.outstanding.is_empty() {
            error!(stream = self.id, "cannot tear down with outstanding buffers");
            return Err(StreamError::OutstandingBuffers { stream: self.id });
        }

        if let Err(err) = self.endpoint.disconnect() {
            warn!(stream = self.id, %err, "disconnect during teardown failed");
        }
        inner.state = StreamState::Configuring;
        if let Err(err) = self.endpoint.configure(&inner.config) {
            error!(stream = self.id, %err, "reconnect during teardown failed");
            inner.state = StreamState::Error;
            return Err(StreamError::ConfigurationRejected {
                stream: self.id,
                reason: err.to_string(),
            });
        }
        inner.prepared = false;
        inner.unpreparable = false;
        inner.state = StreamState::Configured;
        Ok(())
    }

    /// Disconnect the endpoint for good (session teardown).
    pub fn disconnect(&self) {
        let _inner = self.inner.lock();
        if let Err(err) = self.endpoint.disconnect() {
            debug!(stream = self.id, %err, "disconnect failed");
        }
    }

    fn fire_listeners(inner: &mut Inner, event: &BufferEvent, acquired: bool) {
        inner.listeners.retain(|weak| {
            let Some(listener) = weak.upgrade() else {
                return false;
            };
            if acquired {
                listener.on_buffer_acquired(event);
            } else {
                listener.on_buffer_released(event);
            }
            true
        });
    }

    fn invalid(&self, inner: &Inner, op: &'static str) -> StreamError {
        error!(stream = self.id, state = ?inner.state, op, "invalid stream state");
        StreamError::InvalidState {
            stream: self.id,
            state: inner.state,
            op,
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let (Some(tracker), Some(id)) = (inner.status_tracker.upgrade(), inner.status_id) {
            tracker.remove_component(id);
        }
    }
}

/// Registry of streams keyed by stable id.
///
/// Holds `Arc`s; lookups check existence explicitly, so a stream torn down
/// concurrently simply stops resolving.
#[derive(Default)]
pub struct StreamRegistry {
    streams: RwLock<HashMap<i32, Arc<Stream>>>,
}

impl StreamRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a stream.
    pub fn insert(&self, stream: Arc<Stream>) {
        self.streams.write().insert(stream.id(), stream);
    }

    /// Remove a stream, returning it if present.
    pub fn remove(&self, id: i32) -> Option<Arc<Stream>> {
        self.streams.write().remove(&id)
    }

    /// Look up a stream by id.
    pub fn get(&self, id: i32) -> Option<Arc<Stream>> {
        self.streams.read().get(&id).cloned()
    }

    /// Ids of all registered streams.
    pub fn ids(&self) -> Vec<i32> {
        self.streams.read().keys().copied().collect()
    }

    /// All registered streams.
    pub fn all(&self) -> Vec<Arc<Stream>> {
        self.streams.read().values().cloned().collect()
    }

    /// Number of registered streams.
    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::FifoEndpoint;
    use std::thread;

    fn configured_stream(max_buffers: usize, depth: usize) -> (Arc<Stream>, Arc<FifoEndpoint>) {
        let endpoint = Arc::new(FifoEndpoint::new(depth));
        let config = StreamConfig::output(Resolution::new(64, 64).unwrap(), FourCc::new(*b"NV12"))
            .with_max_buffers(max_buffers)
            .with_wait_floor(Duration::from_millis(50));
        let stream = Stream::new(0, config, StreamCaps::output(), endpoint.clone());
        stream.start_configuration().expect("start");
        stream.finish_configuration().expect("finish");
        (stream, endpoint)
    }

    #[test]
    fn configuration_walks_the_state_machine() {
        let endpoint = Arc::new(FifoEndpoint::new(4));
        let config =
            StreamConfig::output(Resolution::new(64, 64).unwrap(), FourCc::new(*b"NV12"));
        let stream = Stream::new(1, config, StreamCaps::output(), endpoint);
        assert_eq!(stream.state(), StreamState::Constructed);
        stream.start_configuration().expect("start");
        assert_eq!(stream.state(), StreamState::Configuring);
        assert!(!stream.finish_configuration().expect("finish"));
        assert_eq!(stream.state(), StreamState::Configured);
    }

    #[test]
    fn zero_size_opaque_format_is_an_error() {
        let endpoint = Arc::new(FifoEndpoint::new(4));
        let config = StreamConfig::output(Resolution::new(64, 64).unwrap(), FourCc::BLOB);
        let stream = Stream::new(2, config, StreamCaps::output(), endpoint);
        assert_eq!(stream.state(), StreamState::Error);
        assert!(stream.start_configuration().is_err());
    }

    #[test]
    fn unchanged_reconfiguration_skips_reallocation() {
        let (stream, _endpoint) = configured_stream(2, 4);
        stream.start_configuration().expect("start");
        assert_eq!(stream.state(), StreamState::Reconfiguring);
        // Nothing changed, so finish reports "not reallocated".
        assert!(!stream.finish_configuration().expect("finish"));
        assert_eq!(stream.state(), StreamState::Configured);
    }

    #[test]
    fn reconfiguration_disallowed_with_outstanding_buffers() {
        let (stream, _endpoint) = configured_stream(2, 4);
        let buffer = stream.get_buffer(Duration::ZERO).expect("buffer");
        assert_eq!(
            stream.start_configuration(),
            Err(StreamError::OutstandingBuffers { stream: 0 })
        );
        stream
            .return_buffer(buffer, 1, Rotation::Deg0, true)
            .expect("return");
        stream.start_configuration().expect("start");
    }

    #[test]
    fn cancel_configuration_restores_snapshot() {
        let (stream, _endpoint) = configured_stream(2, 4);
        stream.start_configuration().expect("start");
        stream.cancel_configuration().expect("cancel");
        assert_eq!(stream.state(), StreamState::Configured);
        assert_eq!(stream.max_buffers(), 2);
    }

    #[test]
    fn outstanding_limit_blocks_and_unblocks() {
        // Scenario: two buffers outstanding, a third acquire blocks until a
        // return; the final outstanding count is back at the limit.
        let (stream, _endpoint) = configured_stream(2, 4);
        let first = stream.get_buffer(Duration::ZERO).expect("first");
        let _second = stream.get_buffer(Duration::ZERO).expect("second");
        assert_eq!(stream.outstanding_count(), 2);

        let blocked = {
            let stream = stream.clone();
            thread::spawn(move || stream.get_buffer(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(30));
        stream
            .return_buffer(first, 1, Rotation::Deg0, true)
            .expect("return");
        let third = blocked.join().expect("join").expect("unblocked");
        assert_eq!(stream.outstanding_count(), 2);
        stream
            .return_buffer(third, 2, Rotation::Deg0, true)
            .expect("return");
    }

    #[test]
    fn get_buffer_times_out_without_corrupting_state() {
        let (stream, _endpoint) = configured_stream(1, 4);
        let held = stream.get_buffer(Duration::ZERO).expect("buffer");
        let err = stream.get_buffer(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, StreamError::BufferTimeout { .. }));
        assert!(err.recoverable());
        assert_eq!(stream.outstanding_count(), 1);
        stream
            .return_buffer(held, 1, Rotation::Deg0, true)
            .expect("return");
        assert_eq!(stream.outstanding_count(), 0);
    }

    #[test]
    fn double_return_is_rejected() {
        let (stream, _endpoint) = configured_stream(2, 4);
        let buffer = stream.get_buffer(Duration::ZERO).expect("buffer");
        stream
            .return_buffer(buffer.clone(), 1, Rotation::Deg0, true)
            .expect("return");
        assert_eq!(
            stream.return_buffer(buffer, 2, Rotation::Deg0, true),
            Err(StreamError::UnknownBuffer { stream: 0 })
        );
    }

    #[test]
    fn unknown_buffer_is_rejected() {
        let (stream, _endpoint) = configured_stream(2, 4);
        let foreign = StreamBuffer::ok(BufferHandle::new(9, 16));
        assert_eq!(
            stream.return_buffer(foreign, 1, Rotation::Deg0, true),
            Err(StreamError::UnknownBuffer { stream: 0 })
        );
    }

    #[test]
    fn non_monotonic_timestamp_downgrades_status() {
        let (stream, endpoint) = configured_stream(2, 4);
        let consumer = endpoint.consumer();
        let first = stream.get_buffer(Duration::ZERO).expect("buffer");
        stream
            .return_buffer(first, 100, Rotation::Deg0, true)
            .expect("return");
        let second = stream.get_buffer(Duration::ZERO).expect("buffer");
        // Going backwards is not fatal, but the buffer is recycled in error
        // status and never reaches the consumer.
        stream
            .return_buffer(second, 50, Rotation::Deg0, true)
            .expect("return");
        let mut delivered = 0;
        while let crate::endpoint::ConsumerRecv::Frame(frame) = consumer.recv() {
            assert_eq!(frame.timestamp, 100);
            delivered += 1;
        }
        assert_eq!(delivered, 1);
    }

    #[test]
    fn prepare_allocates_then_recycles() {
        let (stream, _endpoint) = configured_stream(2, 3);
        assert_eq!(
            stream.start_prepare(Some(2), true).expect("start"),
            PrepareProgress::Preparing
        );
        assert_eq!(stream.state(), StreamState::Preparing);
        assert!(stream.is_blocked_by_prepare());
        assert_eq!(
            stream.prepare_next_buffer().expect("one"),
            PrepareProgress::Preparing
        );
        assert_eq!(
            stream.prepare_next_buffer().expect("two"),
            PrepareProgress::Complete
        );
        assert_eq!(stream.state(), StreamState::Configured);
        assert!(stream.is_prepared());
        // All prepared buffers were recycled, so acquiring up to the limit
        // succeeds without waiting.
        for _ in 0..2 {
            stream.get_buffer(Duration::ZERO).expect("buffer");
        }
    }

    #[test]
    fn prepare_count_clamps_to_pipeline_max() {
        let (stream, _endpoint) = configured_stream(2, 2);
        assert_eq!(
            stream.start_prepare(Some(10), true).expect("start"),
            PrepareProgress::Preparing
        );
        stream.prepare_next_buffer().expect("one");
        assert_eq!(
            stream.prepare_next_buffer().expect("two"),
            PrepareProgress::Complete
        );
    }

    #[test]
    fn repeat_prepare_with_smaller_count_is_complete() {
        let (stream, _endpoint) = configured_stream(2, 4);
        stream.start_prepare(Some(3), true).expect("start");
        while stream.prepare_next_buffer().expect("prepare") == PrepareProgress::Preparing {}
        assert_eq!(
            stream.start_prepare(Some(2), true).expect("again"),
            PrepareProgress::Complete
        );
        assert_eq!(stream.state(), StreamState::Configured);
    }

    #[test]
    fn prepare_disallowed_after_first_exchange() {
        let (stream, _endpoint) = configured_stream(2, 4);
        let buffer = stream.get_buffer(Duration::ZERO).expect("buffer");
        stream
            .return_buffer(buffer, 1, Rotation::Deg0, true)
            .expect("return");
        assert!(stream.start_prepare(Some(2), true).is_err());
    }

    #[test]
    fn cancel_prepare_returns_buffers() {
        let (stream, _endpoint) = configured_stream(2, 3);
        stream.start_prepare(Some(3), true).expect("start");
        stream.prepare_next_buffer().expect("one");
        stream.cancel_prepare().expect("cancel");
        assert_eq!(stream.state(), StreamState::Configured);
        for _ in 0..2 {
            stream.get_buffer(Duration::ZERO).expect("buffer");
        }
    }

    #[test]
    fn idle_round_trip() {
        let (stream, _endpoint) = configured_stream(2, 4);
        stream.force_to_idle().expect("idle");
        assert_eq!(stream.state(), StreamState::Idle);
        assert!(stream.get_buffer(Duration::ZERO).is_err());
        stream.restore_configured_state().expect("restore");
        assert_eq!(stream.state(), StreamState::Configured);
        stream.get_buffer(Duration::ZERO).expect("buffer");
    }

    #[test]
    fn tear_down_requires_quiescence() {
        let (stream, _endpoint) = configured_stream(2, 4);
        let buffer = stream.get_buffer(Duration::ZERO).expect("buffer");
        assert_eq!(
            stream.tear_down(),
            Err(StreamError::OutstandingBuffers { stream: 0 })
        );
        stream
            .return_buffer(buffer, 1, Rotation::Deg0, true)
            .expect("return");
        stream.tear_down().expect("tear down");
        assert_eq!(stream.state(), StreamState::Configured);
        assert!(!stream.is_prepared());
        // Teardown resets the first-use latch, so preparing works again.
        stream.start_prepare(Some(1), true).expect("prepare");
        stream.cancel_prepare().expect("cancel");
    }

    #[test]
    fn abandoned_endpoint_surfaces_during_acquire() {
        let (stream, endpoint) = configured_stream(2, 4);
        endpoint.abandon();
        assert_eq!(
            stream.get_buffer(Duration::ZERO),
            Err(StreamError::Abandoned { stream: 0 })
        );
        assert!(stream.is_abandoned());
    }

    #[test]
    fn status_tracker_follows_outstanding_buffers() {
        let tracker = Arc::new(StatusTracker::new());
        let endpoint = Arc::new(FifoEndpoint::new(4));
        let config = StreamConfig::output(Resolution::new(64, 64).unwrap(), FourCc::new(*b"NV12"))
            .with_max_buffers(2);
        let stream = Stream::new(3, config, StreamCaps::output(), endpoint);
        stream.set_status_tracker(&tracker);
        stream.start_configuration().expect("start");
        stream.finish_configuration().expect("finish");
        assert!(tracker.is_idle());

        let buffer = stream.get_buffer(Duration::ZERO).expect("buffer");
        assert!(!tracker.is_idle());
        stream
            .return_buffer(buffer, 1, Rotation::Deg0, true)
            .expect("return");
        assert!(tracker.is_idle());
    }

    #[test]
    fn listeners_observe_acquire_and_release() {
        use std::sync::atomic::{AtomicU32, Ordering};

        #[derive(Default)]
        struct Counter {
            acquired: AtomicU32,
            released: AtomicU32,
        }
        impl StreamBufferListener for Counter {
            fn on_buffer_acquired(&self, _event: &BufferEvent) {
                self.acquired.fetch_add(1, Ordering::Relaxed);
            }
            fn on_buffer_released(&self, _event: &BufferEvent) {
                self.released.fetch_add(1, Ordering::Relaxed);
            }
        }

        let (stream, _endpoint) = configured_stream(2, 4);
        let counter = Arc::new(Counter::default());
        let listener: Arc<dyn StreamBufferListener> = counter.clone();
        stream.add_buffer_listener(&listener);

        let buffer = stream.get_buffer(Duration::ZERO).expect("buffer");
        stream
            .return_buffer(buffer, 1, Rotation::Deg0, true)
            .expect("return");
        assert_eq!(counter.acquired.load(Ordering::Relaxed), 1);
        assert_eq!(counter.released.load(Ordering::Relaxed), 1);

        stream.remove_buffer_listener(&listener);
        let buffer = stream.get_buffer(Duration::ZERO).expect("buffer");
        stream
            .return_buffer(buffer, 2, Rotation::Deg0, true)
            .expect("return");
        assert_eq!(counter.acquired.load(Ordering::Relaxed), 1);
    }
}
