#![doc = include_str!("../README.md")]

pub mod device;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod loopback;
pub mod request;
pub mod session;
pub mod stream;
pub mod tracker;

pub mod prelude {
    pub use crate::{
        device::{
            BufferResult, DeviceErrorKind, DeviceEvents, DeviceSession, DriverBuffer,
            DriverRequest, StreamDescriptor, SubmitStatus,
        },
        endpoint::{
            BufferEndpoint, ConsumerQueue, ConsumerRecv, DeliveredBuffer, EndpointError,
            FifoEndpoint,
        },
        engine::{EngineConfig, LatestRequest, PauseState, RequestEngine},
        error::{EngineError, SessionError, StreamError, TrackerError},
        loopback::LoopbackDevice,
        request::{CaptureRequest, RequestTarget, SessionEvent},
        session::CaptureSession,
        stream::{
            BufferEvent, PrepareProgress, Stream, StreamBufferListener, StreamCaps, StreamConfig,
            StreamDirection, StreamRegistry, StreamState,
        },
        tracker::{BufferId, BufferRecords},
    };
    pub use aperture_core::prelude::*;
}
