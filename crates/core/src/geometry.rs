use std::{fmt, num::NonZeroU32};

/// Four-character code describing a pixel format.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"NV12");
/// assert_eq!(fcc.to_string(), "NV12");
/// assert!(!fcc.is_opaque());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// Opaque compressed blob output (JPEG and friends); sized in bytes,
    /// not pixels.
    pub const BLOB: FourCc = FourCc::new(*b"BLOB");
    /// Opaque raw sensor dump.
    pub const RAW_OPAQUE: FourCc = FourCc::new(*b"RAWO");

    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Try to convert to a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Whether this format is an opaque byte blob rather than a pixel grid.
    ///
    /// Opaque formats must carry an explicit byte size in their stream
    /// configuration.
    pub fn is_opaque(self) -> bool {
        self == Self::BLOB || self == Self::RAW_OPAQUE
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

/// Resolution of a stream.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::Resolution;
///
/// let res = Resolution::new(1920, 1080).unwrap();
/// assert_eq!(res.width.get(), 1920);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    /// Width in pixels (non-zero).
    pub width: NonZeroU32,
    /// Height in pixels (non-zero).
    pub height: NonZeroU32,
}

impl Resolution {
    /// Create a resolution, returning `None` if width or height are zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    /// Pixel count.
    pub fn area(&self) -> u64 {
        self.width.get() as u64 * self.height.get() as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Color/dataspace tag attached to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataSpace {
    /// Standard sRGB.
    Srgb,
    /// Rec. 709.
    Bt709,
    /// Rec. 2020.
    Bt2020,
    /// JFIF-encoded compressed output.
    Jfif,
    /// Depth/point-cloud samples.
    Depth,
    /// Unspecified/unknown.
    Unknown,
}

/// Rotation applied by the consumer when presenting buffers, in 90-degree
/// steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Rotation {
    /// No rotation.
    #[default]
    Deg0,
    /// 90 degrees clockwise.
    Deg90,
    /// 180 degrees.
    Deg180,
    /// 270 degrees clockwise.
    Deg270,
}

/// Buffer usage bits negotiated between the pipeline and a stream's
/// endpoint. Stored as a plain mask so endpoint implementations can extend
/// the vocabulary.
pub mod usage {
    /// CPU reads the buffer contents.
    pub const CPU_READ: u64 = 1 << 0;
    /// CPU writes the buffer contents.
    pub const CPU_WRITE: u64 = 1 << 1;
    /// Device writes frames into the buffer.
    pub const DEVICE_OUTPUT: u64 = 1 << 2;
    /// Device reads frames out of the buffer (reprocessing input).
    pub const DEVICE_INPUT: u64 = 1 << 3;
    /// Consumer composites the buffer on screen.
    pub const COMPOSER: u64 = 1 << 4;
    /// Consumer encodes the buffer.
    pub const ENCODER: u64 = 1 << 5;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_display_roundtrip() {
        let fcc = FourCc::new(*b"YUYV");
        assert_eq!(fcc.to_string(), "YUYV");
        assert_eq!(FourCc::from(fcc.to_u32()), fcc);
    }

    #[test]
    fn opaque_formats_flagged() {
        assert!(FourCc::BLOB.is_opaque());
        assert!(FourCc::RAW_OPAQUE.is_opaque());
        assert!(!FourCc::new(*b"NV12").is_opaque());
    }

    #[test]
    fn zero_resolution_rejected() {
        assert!(Resolution::new(0, 480).is_none());
        assert!(Resolution::new(640, 0).is_none());
    }
}
