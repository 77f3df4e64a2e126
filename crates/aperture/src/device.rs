//! The narrow contract between the pipeline core and a device driver.
//!
//! The transport and serialization behind this boundary are someone
//! else's problem; the core only needs configure/submit/flush and the
//! asynchronous callback surface.

use std::sync::Arc;

use smallvec::SmallVec;

use aperture_core::prelude::{
    BufferHandle, BufferStatus, DataSpace, FourCc, Resolution, Rotation, Settings,
};

use crate::stream::StreamDirection;
use crate::tracker::BufferId;

/// Driver-facing description of one stream, produced at configuration
/// time.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub stream_id: i32,
    pub resolution: Resolution,
    pub format: FourCc,
    pub data_space: DataSpace,
    pub rotation: Rotation,
    pub direction: StreamDirection,
    pub max_buffers: usize,
    pub usage: u64,
    /// Multi-resolution group, if the stream belongs to one.
    pub group: Option<i32>,
}

/// One buffer attached to a driver request.
///
/// `handle` is populated only the first time a buffer crosses the
/// boundary; afterwards the compact id alone identifies it.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverBuffer {
    pub stream_id: i32,
    pub buffer_id: BufferId,
    pub handle: Option<BufferHandle>,
}

/// One fully resolved request as submitted to the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverRequest {
    /// Session-scoped, strictly increasing sequence number.
    pub sequence: u64,
    /// Settings dictionary (with any one-shot triggers already spliced
    /// in).
    pub settings: Settings,
    /// Buffers for each target stream, in request order.
    pub buffers: SmallVec<[DriverBuffer; 4]>,
}

/// Per-request verdict of a batch submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitStatus {
    /// The driver owns the request now; a completion will follow.
    Accepted,
    /// The driver declined this request; its buffers must be unwound.
    Rejected(String),
}

impl SubmitStatus {
    /// Whether the request was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitStatus::Accepted)
    }
}

/// Classification of driver-reported errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// Unrecoverable device failure; the session stops accepting work.
    Fatal,
    /// One request failed wholesale; its buffers are unwound.
    Request,
    /// A result was lost but the request's buffers still complete.
    Result,
    /// A single buffer was lost.
    Buffer,
}

/// Per-stream buffer outcome reported with a completed request.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferResult {
    pub stream_id: i32,
    pub status: BufferStatus,
    /// Capture timestamp in nanoseconds.
    pub timestamp: u64,
}

/// Callback surface the core hands to the driver.
///
/// Calls arrive on the driver's completion context and serialize against
/// streams and buffer records through their own locks.
pub trait DeviceEvents: Send + Sync {
    /// A request completed; `buffers` reports each stream's outcome.
    fn on_request_result(&self, sequence: u64, metadata: Settings, buffers: &[BufferResult]);

    /// The driver reported an error.
    fn on_error(&self, sequence: Option<u64>, kind: DeviceErrorKind);

    /// The driver returned a buffer it had acquired by id.
    fn on_buffer_returned(&self, buffer_id: BufferId, status: BufferStatus);

    /// The driver wants up to `count` fresh buffers for `stream_id`
    /// (driver-managed buffer mode). Returns the acquired buffers with
    /// their newly assigned ids; may be shorter than `count` when the
    /// stream is at its limit.
    fn on_buffers_requested(&self, stream_id: i32, count: usize) -> Vec<(BufferId, BufferHandle)>;
}

/// Driver-side session contract.
pub trait DeviceSession: Send + Sync {
    /// Give the driver its callback surface. Called once, before any
    /// submission.
    fn attach_events(&self, events: Arc<dyn DeviceEvents>) {
        let _ = events;
    }

    /// Apply a stream configuration. Rejection is fatal to the
    /// configuration round, not to the session.
    fn configure(&self, streams: &[StreamDescriptor]) -> Result<(), String>;

    /// Submit a contiguous batch. The returned vector gives one verdict
    /// per request, in order; completions for accepted requests arrive
    /// later through [`DeviceEvents`].
    fn submit_batch(&self, batch: &[DriverRequest]) -> Vec<SubmitStatus>;

    /// Best-effort: drain all in-flight requests, completing them with
    /// error-status buffers.
    fn flush(&self);
}
