//! qr-cam-scan: QR code generation and scanning for still images and V4L2
//! cameras.
//!
//! Text is rendered to a square black-on-white grid with [`encode()`], and
//! frames are searched for a code with a [`DecodeEngine`]. A
//! [`ScanSession`] runs that engine continuously over any [`FrameSource`],
//! either a real camera ([`V4L2FrameSource`]) or a test double.

pub mod config;
pub mod decode;
pub mod device;
pub mod encode;
pub mod imageio;
pub mod logging;
pub mod session;
pub mod signal;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use config::ScanConfig;
pub use decode::{decode, DecodeEngine, DecodeOutcome, RqrrEngine};
pub use device::{DeviceCapabilities, V4L2FrameSource};
pub use encode::{encode, parse_size, EcLevel, EncodeError, PixelGrid};
pub use session::{
    ScanSession, ScanTiming, SessionObserver, SessionState, StartError, StatusEvent,
};
pub use traits::{CameraError, FourCC, Format, Frame, FrameMetadata, FrameSource};
