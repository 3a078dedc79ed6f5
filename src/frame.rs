//! Frame buffers and the scoped acquire/release discipline around them.

use std::fmt;
use std::ops::Deref;

use chrono::Utc;

/// One captured, compressed image.
pub struct Frame {
    pub data: Vec<u8>,
    pub timestamp_ms: i64,
}

impl Frame {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.data.len())
            .field("timestamp_ms", &self.timestamp_ms)
            .finish()
    }
}

/// Driver-level failures. "No buffer ready" is not one of them: it is `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("camera initialisation failed: {reason}")]
    Init { reason: String },

    #[error("frame driver fault: {reason}")]
    Fault { reason: String },
}

impl FrameError {
    pub fn init(reason: impl Into<String>) -> Self {
        Self::Init {
            reason: reason.into(),
        }
    }

    pub fn fault(reason: impl Into<String>) -> Self {
        Self::Fault {
            reason: reason.into(),
        }
    }
}

/// A pool of frame buffers owned by the camera driver.
///
/// Every `Ok(Some(frame))` from [`FrameSource::acquire`] must be handed back
/// through [`FrameSource::release`] exactly once. Callers should go through
/// [`FrameGuard`] instead of pairing the calls by hand.
pub trait FrameSource {
    fn acquire(&mut self) -> Result<Option<Frame>, FrameError>;

    fn release(&mut self, frame: Frame);
}

/// Owned handle to an acquired frame. Dropping it returns the frame to its source.
pub struct FrameGuard<'a> {
    source: &'a mut dyn FrameSource,
    frame: Option<Frame>,
}

impl<'a> FrameGuard<'a> {
    pub fn acquire(source: &'a mut dyn FrameSource) -> Result<Option<Self>, FrameError> {
        Ok(source.acquire()?.map(|frame| Self {
            source,
            frame: Some(frame),
        }))
    }

    pub fn bytes(&self) -> &[u8] {
        self.frame.as_ref().map(|f| f.data.as_slice()).unwrap_or_default()
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.frame.as_ref().map(|f| f.timestamp_ms).unwrap_or_default()
    }
}

impl Deref for FrameGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes()
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.source.release(frame);
        }
    }
}
