//! Mock frame source for testing without hardware.

use crate::encode::{encode, EcLevel};
use crate::traits::{CameraError, Frame, FrameMetadata, FrameSource, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters shared between a `MockFrameSource` and the test inspecting it.
#[derive(Debug, Default)]
pub struct MockStats {
    opens: AtomicU32,
    closes: AtomicU32,
    reads: AtomicU32,
    exclusive_opens: AtomicU32,
}

impl MockStats {
    /// Successful `open` calls.
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// `close` calls, including redundant ones.
    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Successful `open` calls that asked for exclusive access.
    pub fn exclusive_opens(&self) -> u32 {
        self.exclusive_opens.load(Ordering::SeqCst)
    }

    /// `read_frame` calls.
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

/// One scripted answer to `read_frame`.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Deliver a frame built from a pattern.
    Frame(TestPattern),
    /// No frame ready yet.
    Empty,
    /// The device errors out.
    Fail(String),
    /// The device reports itself closed.
    Disconnect,
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone)]
pub enum TestPattern {
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid luminance.
    Solid(u8),
    /// A QR symbol carrying the given text.
    Code(String),
}

/// Mock device replaying a script of `read_frame` results.
///
/// When the script runs out, the last step repeats forever.
pub struct MockFrameSource {
    width: u32,
    height: u32,
    script: VecDeque<MockStep>,
    last: Option<MockStep>,
    open: bool,
    fail_open: Option<String>,
    frame_count: u32,
    stats: Arc<MockStats>,
}

impl Default for MockFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFrameSource {
    /// Create a mock producing 320x240 gradient frames.
    #[must_use]
    pub fn new() -> Self {
        Self {
            width: 320,
            height: 240,
            script: VecDeque::new(),
            last: None,
            open: false,
            fail_open: None,
            frame_count: 0,
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Set the frame geometry.
    #[must_use]
    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Replace the script.
    #[must_use]
    pub fn with_script<I: IntoIterator<Item = MockStep>>(mut self, steps: I) -> Self {
        self.script = steps.into_iter().collect();
        self
    }

    /// Make `open` fail with the given message.
    #[must_use]
    pub fn failing_open(mut self, message: &str) -> Self {
        self.fail_open = Some(message.to_owned());
        self
    }

    /// Handle to the call counters.
    #[must_use]
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }

    fn next_step(&mut self) -> MockStep {
        if let Some(step) = self.script.pop_front() {
            self.last = Some(step.clone());
            return step;
        }
        self.last
            .clone()
            .unwrap_or(MockStep::Frame(TestPattern::Gradient))
    }
}

impl FrameSource for MockFrameSource {
    fn open(&mut self, exclusive: bool) -> Result<()> {
        if let Some(message) = &self.fail_open {
            return Err(CameraError::DeviceOpenFailed(message.clone()));
        }
        self.open = true;
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        if exclusive {
            self.stats.exclusive_opens.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        if !self.open {
            return Err(CameraError::NotOpen);
        }
        self.stats.reads.fetch_add(1, Ordering::SeqCst);

        match self.next_step() {
            MockStep::Frame(pattern) => {
                let seq = self.frame_count;
                self.frame_count += 1;
                let frame = generate_test_frame(self.width, self.height, &pattern).with_metadata(
                    FrameMetadata {
                        sequence: seq,
                        timestamp: Duration::from_millis(u64::from(seq) * 33), // ~30fps
                    },
                );
                Ok(Some(frame))
            }
            MockStep::Empty => Ok(None),
            MockStep::Fail(message) => Err(CameraError::StreamError(message)),
            MockStep::Disconnect => {
                self.open = false;
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        self.open = false;
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Generate a luminance frame for a pattern.
pub fn generate_test_frame(width: u32, height: u32, pattern: &TestPattern) -> Frame {
    match pattern {
        TestPattern::Gradient => generate_gradient(width, height),
        TestPattern::Solid(y) => {
            Frame::from_validated(width, height, vec![*y; (width * height) as usize])
        }
        TestPattern::Code(text) => {
            // Symbols need a legal encode size; the frame takes the symbol's size.
            let size = width.min(height).clamp(crate::encode::MIN_SIZE, crate::encode::MAX_SIZE);
            encode(text, size, size, EcLevel::M).map_or_else(
                |_| generate_gradient(width, height),
                |grid| grid.to_frame(),
            )
        }
    }
}

/// Generate a horizontal gradient.
fn generate_gradient(width: u32, height: u32) -> Frame {
    let mut luma = Vec::with_capacity((width * height) as usize);
    for _ in 0..height {
        for x in 0..width {
            #[allow(clippy::cast_possible_truncation)]
            let y = ((x * 255) / width.max(1)) as u8;
            luma.push(y);
        }
    }
    Frame::from_validated(width, height, luma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode, DecodeOutcome};

    #[test]
    fn test_mock_open_close_counts() {
        let mut source = MockFrameSource::new();
        let stats = source.stats();
        source.open(true).expect("open should succeed");
        assert!(source.is_open());

        source.close();
        source.close();
        assert!(!source.is_open());
        assert_eq!(stats.opens(), 1);
        assert_eq!(stats.closes(), 2);
    }

    #[test]
    fn test_mock_failing_open() {
        let mut source = MockFrameSource::new().failing_open("busy");
        assert!(matches!(
            source.open(true),
            Err(CameraError::DeviceOpenFailed(_))
        ));
        assert!(!source.is_open());
        assert_eq!(source.stats().opens(), 0);
    }

    #[test]
    fn test_mock_read_requires_open() {
        let mut source = MockFrameSource::new();
        assert!(matches!(source.read_frame(), Err(CameraError::NotOpen)));
    }

    #[test]
    fn test_mock_script_then_repeat_last() {
        let mut source = MockFrameSource::new()
            .with_script([MockStep::Frame(TestPattern::Solid(9)), MockStep::Empty]);
        source.open(false).expect("open should succeed");

        let frame = source.read_frame().expect("read").expect("frame");
        assert_eq!(frame.metadata().sequence, 0);
        assert_eq!(frame.luma_at(0, 0), Some(9));
        assert!(source.read_frame().expect("read").is_none());
        assert!(source.read_frame().expect("read").is_none());
    }

    #[test]
    fn test_mock_sequence_increments() {
        let mut source = MockFrameSource::new();
        source.open(false).expect("open should succeed");
        let first = source.read_frame().expect("read").expect("frame");
        let second = source.read_frame().expect("read").expect("frame");
        assert_eq!(second.metadata().sequence, first.metadata().sequence + 1);
    }

    #[test]
    fn test_mock_disconnect() {
        let mut source = MockFrameSource::new().with_script([MockStep::Disconnect]);
        source.open(false).expect("open should succeed");
        assert!(source.read_frame().expect("read").is_none());
        assert!(!source.is_open());
    }

    #[test]
    fn test_mock_with_size() {
        let mut source = MockFrameSource::new().with_size(64, 48);
        source.open(false).expect("open should succeed");
        let frame = source.read_frame().expect("read").expect("frame");
        assert_eq!((frame.width(), frame.height()), (64, 48));
        assert_eq!(frame.luma().len(), 64 * 48);
    }

    #[test]
    fn test_gradient_pattern() {
        let frame = generate_test_frame(640, 480, &TestPattern::Gradient);
        assert!(frame.luma_at(0, 240).expect("pixel") < 10);
        assert!(frame.luma_at(639, 479).expect("pixel") > 200);
    }

    #[test]
    fn test_code_pattern_decodes() {
        let frame = generate_test_frame(320, 240, &TestPattern::Code("mock".to_owned()));
        assert_eq!(decode(&frame), DecodeOutcome::Decoded("mock".to_owned()));
    }
}
