//! V4L2 frame source using the v4l crate.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{CameraError, FourCC, Format, Frame, FrameMetadata, FrameSource, Result};

/// Default capture buffer count.
pub const DEFAULT_BUFFER_COUNT: u32 = 4;
/// Default bound on a single frame wait.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// Path of the device node for `index`.
#[must_use]
pub fn device_path(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/video{index}"))
}

/// Whether a device node exists for `index`. Does not open it.
#[must_use]
pub fn device_available(index: u32) -> bool {
    device_path(index).exists()
}

struct OpenDevice {
    // Field order matters: the stream must be dropped before its device.
    stream: Stream<'static>,
    device: Device,
    format: Format,
    capabilities: DeviceCapabilities,
}

/// V4L2 capture device exposed as a [`FrameSource`].
///
/// Construction never touches hardware; the device node is opened by
/// [`FrameSource::open`] and released by [`FrameSource::close`].
pub struct V4L2FrameSource {
    index: u32,
    requested: Format,
    buffer_count: u32,
    read_timeout: Duration,
    open: Option<OpenDevice>,
}

impl V4L2FrameSource {
    /// Describe the device at `index` (e.g., 0 for /dev/video0).
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self {
            index,
            requested: Format::new(640, 480, FourCC::YUYV),
            buffer_count: DEFAULT_BUFFER_COUNT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            open: None,
        }
    }

    /// Format to negotiate on open. The driver may adjust it.
    #[must_use]
    pub const fn with_format(mut self, format: Format) -> Self {
        self.requested = format;
        self
    }

    /// Number of mmap buffers for the capture stream.
    #[must_use]
    pub const fn with_buffer_count(mut self, buffer_count: u32) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    /// Upper bound on one `read_frame` wait.
    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Device index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Capabilities of the open device.
    #[must_use]
    pub fn capabilities(&self) -> Option<&DeviceCapabilities> {
        self.open.as_ref().map(|open| &open.capabilities)
    }

    /// Format negotiated with the driver, once open.
    #[must_use]
    pub fn format(&self) -> Option<&Format> {
        self.open.as_ref().map(|open| &open.format)
    }

    fn open_device(&self) -> Result<OpenDevice> {
        if !device_available(self.index) {
            return Err(CameraError::DeviceNotFound(self.index));
        }

        let device = Device::new(self.index as usize)
            .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;

        let caps = device
            .query_caps()
            .map_err(|err| CameraError::DeviceOpenFailed(err.to_string()))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
        };
        if !capabilities.can_capture || !capabilities.can_stream {
            return Err(CameraError::DeviceOpenFailed(format!(
                "{} cannot stream video",
                capabilities.card
            )));
        }

        let format = negotiate_format(&device, &self.requested)?;

        let mut stream = Stream::with_buffers(&device, Type::VideoCapture, self.buffer_count)
            .map_err(|err| CameraError::StreamError(err.to_string()))?;
        stream.set_timeout(self.read_timeout);

        log::info!(
            "opened {} ({}) at {}x{} {}",
            capabilities.card,
            capabilities.driver,
            format.width,
            format.height,
            format.fourcc
        );

        Ok(OpenDevice {
            stream,
            device,
            format,
            capabilities,
        })
    }
}

fn negotiate_format(device: &Device, requested: &Format) -> Result<Format> {
    let mut fmt = device
        .format()
        .map_err(|err| CameraError::StreamError(err.to_string()))?;

    fmt.width = requested.width;
    fmt.height = requested.height;
    fmt.fourcc = requested.fourcc.into();

    let fmt = device
        .set_format(&fmt)
        .map_err(|err| CameraError::StreamError(err.to_string()))?;

    let actual = Format {
        width: fmt.width,
        height: fmt.height,
        fourcc: FourCC::from(fmt.fourcc),
        stride: fmt.stride,
        size: fmt.size,
    };
    if ![FourCC::YUYV, FourCC::GREY, FourCC::MJPG].contains(&actual.fourcc) {
        return Err(CameraError::FormatNotSupported(actual));
    }
    Ok(actual)
}

impl FrameSource for V4L2FrameSource {
    fn open(&mut self, exclusive: bool) -> Result<()> {
        if self.open.is_some() {
            return Ok(());
        }
        // V4L2 has no shared-open mode to request; the flag is advisory.
        log::debug!("opening {} (exclusive={exclusive})", device_path(self.index).display());
        self.open = Some(self.open_device()?);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.is_some()
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let open = self.open.as_mut().ok_or(CameraError::NotOpen)?;

        let (buf, meta) = match open.stream.next() {
            Ok(next) => next,
            Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                return Ok(None);
            }
            Err(err) => return Err(CameraError::StreamError(err.to_string())),
        };

        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);
        let metadata = FrameMetadata {
            sequence: meta.sequence,
            timestamp: Duration::new(secs, nanos),
        };

        let used = buf
            .get(..meta.bytesused as usize)
            .filter(|used| !used.is_empty())
            .unwrap_or(buf);
        let format = &open.format;
        let frame = match &format.fourcc.0 {
            b"YUYV" => Frame::from_yuyv(format.width, format.height, used, metadata)?,
            b"GREY" => {
                let pixels = (format.width as usize) * (format.height as usize);
                let luma = used
                    .get(..pixels)
                    .ok_or_else(|| CameraError::InvalidFrame("short GREY buffer".to_owned()))?;
                Frame::from_luma(format.width, format.height, luma.to_vec())?.with_metadata(metadata)
            }
            _ => match image::load_from_memory_with_format(used, image::ImageFormat::Jpeg) {
                Ok(decoded) => {
                    let luma = decoded.into_luma8();
                    let (width, height) = luma.dimensions();
                    Frame::from_luma(width, height, luma.into_raw())?.with_metadata(metadata)
                }
                Err(err) => {
                    // Partial MJPEG frames happen during warm-up; wait for the next one.
                    log::debug!("dropping undecodable MJPEG frame {}: {err}", meta.sequence);
                    return Ok(None);
                }
            },
        };
        Ok(Some(frame))
    }

    fn close(&mut self) {
        if let Some(open) = self.open.take() {
            let OpenDevice { stream, device, .. } = open;
            drop(stream);
            drop(device);
            log::info!("closed {}", device_path(self.index).display());
        }
    }
}

impl Drop for V4L2FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}
