//! Capture requests and the notification events flowing back to the
//! application.

use smallvec::SmallVec;

use aperture_core::prelude::{SettingValue, Settings, tags};

use crate::device::DeviceErrorKind;
use crate::error::EngineError;

/// One destination of a capture request: a stream, and the surface index
/// within it for surface-shared streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTarget {
    /// Target stream id.
    pub stream_id: i32,
    /// Surface index for shared streams; 0 otherwise.
    pub surface: usize,
}

/// A capture request: settings plus an ordered list of destination
/// streams.
///
/// # Example
/// ```rust
/// use aperture::prelude::*;
///
/// let request = CaptureRequest::new()
///     .request_id(12)
///     .target(0)
///     .target(1)
///     .batch_size(1);
/// assert_eq!(request.targets.len(), 2);
/// assert_eq!(request.settings.request_id(), Some(12));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureRequest {
    /// Settings dictionary handed to the driver (opaque to the pipeline
    /// apart from the well-known tags).
    pub settings: Settings,
    /// Destination streams, in application order.
    pub targets: SmallVec<[RequestTarget; 4]>,
    /// Number of requests to submit contiguously in one driver call; the
    /// engine pops `batch_size - 1` follow-up requests from the queue.
    pub batch_size: usize,
}

impl CaptureRequest {
    /// Empty request with batch size 1.
    pub fn new() -> Self {
        Self {
            settings: Settings::new(),
            targets: SmallVec::new(),
            batch_size: 1,
        }
    }

    /// Request carrying the given settings.
    pub fn with_settings(settings: Settings) -> Self {
        Self {
            settings,
            ..Self::new()
        }
    }

    /// Add a destination stream (surface 0).
    pub fn target(mut self, stream_id: i32) -> Self {
        self.targets.push(RequestTarget {
            stream_id,
            surface: 0,
        });
        self
    }

    /// Add a destination stream with an explicit surface index.
    pub fn target_surface(mut self, stream_id: i32, surface: usize) -> Self {
        self.targets.push(RequestTarget { stream_id, surface });
        self
    }

    /// Set the contiguous-submission batch size (minimum 1).
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Attach an application request id, echoed in notifications.
    pub fn request_id(mut self, id: i64) -> Self {
        self.settings.insert(tags::REQUEST_ID, SettingValue::Int(id));
        self
    }
}

/// Notifications delivered to the application over the session's event
/// channel.
///
/// Errors are always reported here, never thrown across the boundary
/// between the engine context and the application context.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The driver accepted a request.
    RequestSubmitted {
        /// Sequence number assigned at enqueue time.
        sequence: u64,
        /// Application request id, if the settings carried one.
        request_id: Option<i64>,
    },
    /// A request failed before or at submission; all buffers it had
    /// acquired were returned to their streams in error status.
    RequestFailed {
        sequence: u64,
        request_id: Option<i64>,
        /// What went wrong; `recoverable()` errors affect only this
        /// request.
        error: EngineError,
    },
    /// A queued request was drained without submission during shutdown or
    /// an explicit clear.
    RequestCancelled {
        sequence: u64,
        request_id: Option<i64>,
    },
    /// The driver completed a request.
    ResultReady {
        sequence: u64,
        /// Result metadata reported by the driver.
        metadata: Settings,
    },
    /// The driver reported an error outside a specific completion.
    DeviceError {
        /// Affected request, when the driver could attribute one.
        sequence: Option<u64>,
        kind: DeviceErrorKind,
    },
}
