//! QR decoding: the `DecodeEngine` seam and its default `rqrr` backend.
//!
//! Every decode call is total. Whatever happens inside the engine, the
//! caller receives one of the three `DecodeOutcome` variants.

use crate::traits::Frame;

/// Result of attempting to extract text from a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A symbol was found and its payload decoded.
    Decoded(String),
    /// No symbol was located in the frame.
    NotFound,
    /// A symbol was located but failed format or error-correction checks.
    Malformed,
}

impl DecodeOutcome {
    /// The decoded text, if it carries any non-whitespace content.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Decoded(text) if !text.trim().is_empty() => Some(text),
            _ => None,
        }
    }
}

/// Anything that can turn a luminance grid into a `DecodeOutcome`.
pub trait DecodeEngine: Send + Sync {
    /// Attempt to decode a symbol from `frame`.
    fn decode(&self, frame: &Frame) -> DecodeOutcome;
}

impl<F> DecodeEngine for F
where
    F: Fn(&Frame) -> DecodeOutcome + Send + Sync,
{
    fn decode(&self, frame: &Frame) -> DecodeOutcome {
        self(frame)
    }
}

/// Default engine backed by `rqrr`.
///
/// `rqrr` runs its own adaptive thresholding over the luminance grid, so
/// frames of any size and lighting can be passed straight through.
#[derive(Debug, Clone, Copy, Default)]
pub struct RqrrEngine;

impl DecodeEngine for RqrrEngine {
    fn decode(&self, frame: &Frame) -> DecodeOutcome {
        let width = frame.width() as usize;
        let height = frame.height() as usize;
        if width == 0 || height == 0 {
            return DecodeOutcome::NotFound;
        }

        let luma = frame.luma();
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(width, height, |x, y| {
            luma.get(y * width + x).copied().unwrap_or(u8::MAX)
        });
        let grids = prepared.detect_grids();
        if grids.is_empty() {
            return DecodeOutcome::NotFound;
        }

        for grid in &grids {
            match grid.decode() {
                Ok((_meta, text)) => return DecodeOutcome::Decoded(text),
                Err(err) => log::trace!("grid rejected: {err:?}"),
            }
        }
        DecodeOutcome::Malformed
    }
}

/// One-shot decode of a frame or loaded image with the default engine.
#[must_use]
pub fn decode(frame: &Frame) -> DecodeOutcome {
    RqrrEngine.decode(frame)
}
