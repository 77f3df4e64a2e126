use std::time::Duration;

use crate::stream::StreamState;
use crate::tracker::BufferId;

/// Errors raised by a single stream.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use aperture::prelude::StreamError;
///
/// let err = StreamError::BufferTimeout { stream: 0, waited: Duration::from_secs(3) };
/// assert_eq!(err.code(), "buffer_timeout");
/// assert!(err.recoverable());
/// ```
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StreamError {
    #[error("stream {stream}: cannot {op} in state {state:?}")]
    InvalidState {
        stream: i32,
        state: StreamState,
        op: &'static str,
    },
    #[error("stream {stream}: operation requires zero outstanding buffers")]
    OutstandingBuffers { stream: i32 },
    #[error("stream {stream}: consumer endpoint has been abandoned")]
    Abandoned { stream: i32 },
    #[error("stream {stream}: configuration rejected: {reason}")]
    ConfigurationRejected { stream: i32, reason: String },
    #[error("stream {stream}: wait for a returned buffer timed out after {waited:?}")]
    BufferTimeout { stream: i32, waited: Duration },
    #[error("stream {stream}: returned buffer is not outstanding")]
    UnknownBuffer { stream: i32 },
    #[error(
        "stream {stream}: outstanding count did not decrease across a wakeup; \
         concurrent acquire calls on one stream are not supported"
    )]
    ConcurrentAcquire { stream: i32 },
    #[error("stream {stream}: endpoint has no free buffer")]
    Starved { stream: i32 },
}

impl StreamError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::InvalidState { .. } => "invalid_state",
            StreamError::OutstandingBuffers { .. } => "outstanding_buffers",
            StreamError::Abandoned { .. } => "abandoned",
            StreamError::ConfigurationRejected { .. } => "configuration_rejected",
            StreamError::BufferTimeout { .. } => "buffer_timeout",
            StreamError::UnknownBuffer { .. } => "unknown_buffer",
            StreamError::ConcurrentAcquire { .. } => "concurrent_acquire",
            StreamError::Starved { .. } => "starved",
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            StreamError::BufferTimeout { .. } | StreamError::Starved { .. }
        )
    }

    /// Whether the stream is unusable and should be torn down.
    pub fn fatal_to_stream(&self) -> bool {
        matches!(
            self,
            StreamError::ConfigurationRejected { .. } | StreamError::Abandoned { .. }
        )
    }

    /// The stream the error refers to.
    pub fn stream(&self) -> i32 {
        match self {
            StreamError::InvalidState { stream, .. }
            | StreamError::OutstandingBuffers { stream }
            | StreamError::Abandoned { stream }
            | StreamError::ConfigurationRejected { stream, .. }
            | StreamError::BufferTimeout { stream, .. }
            | StreamError::UnknownBuffer { stream }
            | StreamError::ConcurrentAcquire { stream }
            | StreamError::Starved { stream } => *stream,
        }
    }
}

/// Errors raised by the buffer records layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackerError {
    #[error("no buffer cache exists for stream {0}")]
    UnknownStream(i32),
    #[error("buffer id {0} is already in flight")]
    DuplicateInflightId(BufferId),
    #[error("buffer id cache for stream {0} diverged from the driver's")]
    CacheDesync(i32),
}

impl TrackerError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            TrackerError::UnknownStream(_) => "unknown_stream",
            TrackerError::DuplicateInflightId(_) => "duplicate_inflight_id",
            TrackerError::CacheDesync(_) => "cache_desync",
        }
    }

    /// Whether buffer identity can no longer be trusted session-wide.
    pub fn fatal_to_session(&self) -> bool {
        matches!(self, TrackerError::CacheDesync(_))
    }
}

/// Errors surfaced by the request engine, per request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("driver rejected the submission: {0}")]
    SubmissionRejected(String),
    #[error("driver reported a fatal error; no further submissions are accepted")]
    DeviceFatal,
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Stream(err) => err.code(),
            EngineError::SubmissionRejected(_) => "submission_rejected",
            EngineError::DeviceFatal => "device_fatal",
            EngineError::ShuttingDown => "shutting_down",
        }
    }

    /// Whether only the affected request failed (the pipeline keeps going).
    pub fn recoverable(&self) -> bool {
        match self {
            EngineError::Stream(err) => err.recoverable(),
            EngineError::SubmissionRejected(_) => true,
            EngineError::DeviceFatal | EngineError::ShuttingDown => false,
        }
    }
}

/// Errors surfaced by the capture session facade.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("device rejected the stream configuration: {0}")]
    DeviceRejected(String),
    #[error("session is in a fatal error state")]
    Fatal,
}

impl SessionError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Stream(err) => err.code(),
            SessionError::Tracker(err) => err.code(),
            SessionError::DeviceRejected(_) => "device_rejected",
            SessionError::Fatal => "session_fatal",
        }
    }
}
