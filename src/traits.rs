//! Core traits and types for the capture device abstraction.

use std::time::Duration;

/// Pixel format representation (e.g., YUYV, MJPG, GREY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// 8-bit greyscale.
    pub const GREY: Self = Self::new(b"GREY");

    /// Bytes per pixel for packed formats, `None` for compressed ones.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match &self.0 {
            b"YUYV" => Some(2),
            b"GREY" => Some(1),
            _ => None,
        }
    }
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a new format specification.
    ///
    /// Stride and size are derived for packed formats and left at zero for
    /// compressed ones, where the driver reports them.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = match fourcc.bytes_per_pixel() {
            Some(bpp) => width * bpp,
            None => 0,
        };
        let size = stride * height;
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
}

/// A captured frame reduced to an immutable grid of 8-bit luminance samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    luma: Vec<u8>,
    metadata: FrameMetadata,
}

impl Frame {
    /// Build a frame from row-major luminance samples.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFrame` if `luma` does not hold exactly
    /// `width * height` samples.
    pub fn from_luma(width: u32, height: u32, luma: Vec<u8>) -> Result<Self> {
        let expected = (width as usize) * (height as usize);
        if luma.len() != expected {
            return Err(CameraError::InvalidFrame(format!(
                "{width}x{height} frame needs {expected} samples, got {}",
                luma.len()
            )));
        }
        Ok(Self {
            width,
            height,
            luma,
            metadata: FrameMetadata::default(),
        })
    }

    /// Build a frame whose geometry the caller already guarantees.
    pub(crate) fn from_validated(width: u32, height: u32, luma: Vec<u8>) -> Self {
        debug_assert_eq!(luma.len(), (width as usize) * (height as usize));
        Self {
            width,
            height,
            luma,
            metadata: FrameMetadata::default(),
        }
    }

    /// Build a frame from packed YUYV data, keeping only the Y samples.
    ///
    /// # Arguments
    ///
    /// * `width` - Frame width in pixels
    /// * `height` - Frame height in pixels
    /// * `data` - Raw YUYV buffer, `[Y0 U Y1 V]` repeated
    /// * `metadata` - Sequence and timestamp reported by the device
    ///
    /// # Errors
    ///
    /// Returns `InvalidFrame` if the buffer is shorter than
    /// `width * height * 2` bytes. Trailing padding is ignored.
    pub fn from_yuyv(
        width: u32,
        height: u32,
        data: &[u8],
        metadata: FrameMetadata,
    ) -> Result<Self> {
        let pixels = (width as usize) * (height as usize);
        let needed = pixels * 2;
        let packed = data.get(..needed).ok_or_else(|| {
            CameraError::InvalidFrame(format!(
                "{width}x{height} YUYV frame needs {needed} bytes, got {}",
                data.len()
            ))
        })?;

        // Y0 and Y1 sit at the even offsets of every 4-byte group.
        let luma = packed.iter().step_by(2).copied().collect();
        Ok(Self::from_luma(width, height, luma)?.with_metadata(metadata))
    }

    /// Attach device metadata to this frame.
    #[must_use]
    pub fn with_metadata(mut self, metadata: FrameMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Frame width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Row-major luminance samples.
    #[must_use]
    pub fn luma(&self) -> &[u8] {
        &self.luma
    }

    /// Device metadata for this frame.
    #[must_use]
    pub const fn metadata(&self) -> &FrameMetadata {
        &self.metadata
    }

    /// Get the luminance at the specified coordinates.
    ///
    /// Returns `None` when `(x, y)` lies outside the frame.
    #[must_use]
    pub fn luma_at(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize) * (self.width as usize) + (x as usize);
        self.luma.get(offset).copied()
    }
}

/// Error type for capture device operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// Device with given index was not found.
    #[error("Device {0} not found")]
    DeviceNotFound(u32),
    /// Failed to open device.
    #[error("Failed to open device: {0}")]
    DeviceOpenFailed(String),
    /// Requested format is not supported.
    #[error("Format not supported: {0:?}")]
    FormatNotSupported(Format),
    /// Error during streaming operation.
    #[error("Stream error: {0}")]
    StreamError(String),
    /// Operation attempted on a device that is not open.
    #[error("Device is not open")]
    NotOpen,
    /// Frame buffer does not match its declared geometry.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for capture device operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Abstraction over a capture device.
///
/// A `FrameSource` is exclusively owned by one scan loop at a time, so
/// implementations only need to be `Send`.
pub trait FrameSource: Send {
    /// Acquire the underlying device.
    ///
    /// `exclusive` asks the backend to refuse sharing the device with other
    /// processes where the platform supports it.
    fn open(&mut self, exclusive: bool) -> Result<()>;

    /// Whether the device is currently open and streaming.
    fn is_open(&self) -> bool;

    /// Read the latest frame.
    ///
    /// Returns `Ok(None)` when no new frame is ready within the backend's
    /// bounded wait. An `Err` means the device stopped responding.
    fn read_frame(&mut self) -> Result<Option<Frame>>;

    /// Release the device. Idempotent; underlying errors are swallowed.
    fn close(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn open(&mut self, exclusive: bool) -> Result<()> {
        (**self).open(exclusive)
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        (**self).read_frame()
    }

    fn close(&mut self) {
        (**self).close();
    }
}
