//! Scanner configuration.
//!
//! Settings come from built-in defaults, optionally overlaid by a TOML file;
//! the CLI applies its own flags on top. Every field is optional in the
//! file.
//!
//! ```toml
//! device = 0
//! width = 1280
//! height = 720
//! pixel_format = "MJPG"
//!
//! [timing]
//! retry_delay_ms = 40
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::{V4L2FrameSource, DEFAULT_BUFFER_COUNT, DEFAULT_READ_TIMEOUT};
use crate::session::{ScanTiming, DEBOUNCE_DELAY, POLL_EMPTY_DELAY, RETRY_DELAY};
use crate::traits::{FourCC, Format};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// Offending path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is syntactically valid but unusable.
    #[error("Invalid config value for {field}: {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Loop pacing in milliseconds, mirroring [`ScanTiming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    /// Pause after a read with no frame.
    pub poll_empty_delay_ms: u64,
    /// Pause after a frame without a code.
    pub retry_delay_ms: u64,
    /// Pause after a decoded result.
    pub debounce_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let ms = |d: Duration| d.as_millis() as u64;
        Self {
            poll_empty_delay_ms: ms(POLL_EMPTY_DELAY),
            retry_delay_ms: ms(RETRY_DELAY),
            debounce_delay_ms: ms(DEBOUNCE_DELAY),
        }
    }
}

impl From<TimingConfig> for ScanTiming {
    fn from(config: TimingConfig) -> Self {
        Self {
            poll_empty_delay: Duration::from_millis(config.poll_empty_delay_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            debounce_delay: Duration::from_millis(config.debounce_delay_ms),
        }
    }
}

/// Camera scan settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// V4L2 device index (`/dev/videoN`).
    pub device: u32,
    /// Requested capture width.
    pub width: u32,
    /// Requested capture height.
    pub height: u32,
    /// Requested pixel format: `YUYV`, `GREY` or `MJPG`.
    pub pixel_format: String,
    /// mmap buffers for the capture stream.
    pub buffer_count: u32,
    /// Upper bound on a single frame wait.
    pub read_timeout_ms: u64,
    /// Ask for exclusive access to the device.
    pub exclusive: bool,
    /// Loop pacing.
    pub timing: TimingConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let read_timeout_ms = DEFAULT_READ_TIMEOUT.as_millis() as u64;
        Self {
            device: 0,
            width: 640,
            height: 480,
            pixel_format: "YUYV".to_owned(),
            buffer_count: DEFAULT_BUFFER_COUNT,
            read_timeout_ms,
            exclusive: true,
            timing: TimingConfig::default(),
        }
    }
}

impl ScanConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&text)?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Load `path` if given, otherwise return the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    /// Check value ranges the type system does not capture.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.fourcc()?;
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid {
                field: "width/height",
                reason: format!("{}x{} has no pixels", self.width, self.height),
            });
        }
        if self.buffer_count == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer_count",
                reason: "at least one buffer is required".to_owned(),
            });
        }
        Ok(())
    }

    /// The configured pixel format.
    pub fn fourcc(&self) -> Result<FourCC, ConfigError> {
        let code: [u8; 4] = self
            .pixel_format
            .to_ascii_uppercase()
            .as_bytes()
            .try_into()
            .map_err(|_| ConfigError::Invalid {
                field: "pixel_format",
                reason: format!("{:?} is not a four-character code", self.pixel_format),
            })?;
        let fourcc = FourCC(code);
        if ![FourCC::YUYV, FourCC::GREY, FourCC::MJPG].contains(&fourcc) {
            return Err(ConfigError::Invalid {
                field: "pixel_format",
                reason: format!("{fourcc} is not supported"),
            });
        }
        Ok(fourcc)
    }

    /// Loop pacing as durations.
    pub fn scan_timing(&self) -> ScanTiming {
        self.timing.into()
    }

    /// Build the V4L2 source this configuration describes.
    pub fn frame_source(&self) -> Result<V4L2FrameSource, ConfigError> {
        let format = Format::new(self.width, self.height, self.fourcc()?);
        Ok(V4L2FrameSource::new(self.device)
            .with_format(format)
            .with_buffer_count(self.buffer_count)
            .with_read_timeout(Duration::from_millis(self.read_timeout_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_session_policy() {
        let config = ScanConfig::default();
        assert_eq!(config.scan_timing(), ScanTiming::default());
        assert_eq!(config.fourcc().expect("fourcc"), FourCC::YUYV);
        assert!(config.exclusive);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = ScanConfig::from_toml(
            r#"
            device = 2
            pixel_format = "mjpg"

            [timing]
            retry_delay_ms = 40
            "#,
        )
        .expect("valid config");

        assert_eq!(config.device, 2);
        assert_eq!(config.fourcc().expect("fourcc"), FourCC::MJPG);
        assert_eq!(config.width, 640);
        assert_eq!(config.timing.retry_delay_ms, 40);
        assert_eq!(config.timing.debounce_delay_ms, 1200);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = ScanConfig::from_toml("devcie = 1");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unsupported_pixel_format() {
        let result = ScanConfig::from_toml(r#"pixel_format = "H264""#);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "pixel_format",
                ..
            })
        ));
        let result = ScanConfig::from_toml(r#"pixel_format = "RGB""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_buffers_rejected() {
        assert!(ScanConfig::from_toml("buffer_count = 0").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "width = 1280\nheight = 720").expect("write");

        let config = ScanConfig::load(file.path()).expect("load");
        assert_eq!((config.width, config.height), (1280, 720));

        let source = config.frame_source().expect("source");
        assert_eq!(source.index(), 0);
    }

    #[test]
    fn test_load_missing_file() {
        let result = ScanConfig::load("/nonexistent/qr-cam-scan.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_load_or_default_without_path() {
        let config = ScanConfig::load_or_default(None::<&Path>).expect("defaults");
        assert_eq!(config, ScanConfig::default());
    }
}
