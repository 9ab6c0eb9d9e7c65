//! QR encoding into a black/white pixel grid, plus the size-input clamp
//! used by every front end.

use crate::traits::Frame;

/// Smallest accepted output edge in pixels.
pub const MIN_SIZE: u32 = 80;
/// Largest accepted output edge in pixels.
pub const MAX_SIZE: u32 = 2000;
/// Edge used when size input cannot be parsed.
pub const DEFAULT_SIZE: u32 = 300;
/// Light modules around the symbol on every side.
pub const MARGIN_MODULES: usize = 1;

/// Error-correction level of the generated symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EcLevel {
    /// ~7% recovery.
    L,
    /// ~15% recovery.
    #[default]
    M,
    /// ~25% recovery.
    Q,
    /// ~30% recovery.
    H,
}

impl From<EcLevel> for qrcode::EcLevel {
    fn from(level: EcLevel) -> Self {
        match level {
            EcLevel::L => Self::L,
            EcLevel::M => Self::M,
            EcLevel::Q => Self::Q,
            EcLevel::H => Self::H,
        }
    }
}

/// Error returned by [`encode`]. No partial output is ever produced.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodeError {
    /// Nothing to encode.
    #[error("Enter text to encode first.")]
    EmptyText,
    /// Requested dimensions fall outside `[MIN_SIZE, MAX_SIZE]`.
    #[error("Size {width}x{height} is outside {MIN_SIZE}..={MAX_SIZE} pixels")]
    SizeOutOfRange {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },
    /// The encoding engine rejected the payload (e.g. too long).
    #[error("Failed to generate QR: {0}")]
    Capacity(String),
}

/// A rendered symbol: one byte per pixel, `0` black and `255` white.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelGrid {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl PixelGrid {
    /// Grid width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Grid height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Row-major pixel values.
    #[must_use]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Whether the pixel at `(x, y)` is black. Out of bounds reads as white.
    #[must_use]
    pub fn is_dark(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let offset = (y as usize) * (self.width as usize) + (x as usize);
        self.pixels.get(offset).is_some_and(|&p| p == 0)
    }

    /// View the grid as a luminance frame, e.g. to feed it to a decoder.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame::from_validated(self.width, self.height, self.pixels.clone())
    }
}

/// Encode `text` as a QR symbol rendered to at least `width` x `height`
/// pixels.
///
/// The payload is UTF-8 bytes. The symbol plus a one-module margin is scaled
/// by the largest whole multiple that fits and centered. If the symbol does
/// not fit at all, the grid grows to the symbol's natural size.
///
/// # Errors
///
/// `EmptyText` for empty input, `SizeOutOfRange` for dimensions outside
/// `[MIN_SIZE, MAX_SIZE]`, `Capacity` when the engine rejects the payload.
pub fn encode(text: &str, width: u32, height: u32, level: EcLevel) -> Result<PixelGrid, EncodeError> {
    if text.is_empty() {
        return Err(EncodeError::EmptyText);
    }
    let range = MIN_SIZE..=MAX_SIZE;
    if !range.contains(&width) || !range.contains(&height) {
        return Err(EncodeError::SizeOutOfRange { width, height });
    }

    let code = qrcode::QrCode::with_error_correction_level(text.as_bytes(), level.into())
        .map_err(|err| EncodeError::Capacity(err.to_string()))?;
    let modules = code.width();
    let colors = code.to_colors();
    log::debug!(
        "encoded {} bytes into {modules}x{modules} modules at level {level:?}",
        text.len()
    );

    Ok(render(&colors, modules, width as usize, height as usize))
}

#[allow(clippy::cast_possible_truncation)]
fn render(colors: &[qrcode::Color], modules: usize, width: usize, height: usize) -> PixelGrid {
    let padded = modules + MARGIN_MODULES * 2;
    let out_w = width.max(padded);
    let out_h = height.max(padded);
    let multiple = (out_w / padded).min(out_h / padded);
    let left = (out_w - modules * multiple) / 2;
    let top = (out_h - modules * multiple) / 2;

    let mut pixels = vec![u8::MAX; out_w * out_h];
    for (index, color) in colors.iter().enumerate() {
        if *color != qrcode::Color::Dark {
            continue;
        }
        let (mx, my) = (index % modules, index / modules);
        for dy in 0..multiple {
            let row = (top + my * multiple + dy) * out_w;
            let start = row + left + mx * multiple;
            if let Some(span) = pixels.get_mut(start..start + multiple) {
                span.fill(0);
            }
        }
    }

    PixelGrid {
        width: out_w as u32,
        height: out_h as u32,
        pixels,
    }
}

/// Parse a size field, clamping to `[min, max]` and falling back to
/// `fallback` when the input is not a 32-bit integer.
#[must_use]
pub fn clamp_parse_size(text: &str, min: u32, max: u32, fallback: u32) -> u32 {
    text.trim().parse::<i32>().map_or(fallback, |value| {
        let value = i64::from(value).clamp(i64::from(min), i64::from(max));
        u32::try_from(value).unwrap_or(fallback)
    })
}

/// [`clamp_parse_size`] with the standard `[80, 2000]` range and a default
/// of 300.
#[must_use]
pub fn parse_size(text: &str) -> u32 {
    clamp_parse_size(text, MIN_SIZE, MAX_SIZE, DEFAULT_SIZE)
}
