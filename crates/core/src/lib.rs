#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod geometry;
pub mod metrics;
pub mod settings;
pub mod status;

pub mod prelude {
    pub use crate::{
        buffer::{BufferHandle, BufferStatus, StreamBuffer},
        geometry::{usage, DataSpace, FourCc, Resolution, Rotation},
        metrics::{EngineMetrics, StreamMetrics},
        settings::{SettingTag, SettingValue, Settings, Trigger, tags},
        status::{ComponentId, StatusTracker},
    };
}
