//! Frame and frame key types.

use chrono::Utc;
use std::fmt;

/// Pixel formats accepted by the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit single channel
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
        }
    }
}

/// A raw frame borrowed from the capture pipeline for one `publish` call
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Capture timestamp in microseconds, if the pipeline provides one
    pub timestamp_us: Option<i64>,
}

impl<'a> Frame<'a> {
    /// Wrap a Gray8 buffer
    pub fn gray8(data: &'a [u8], width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            format: PixelFormat::Gray8,
            timestamp_us: None,
        }
    }

    pub fn with_timestamp_us(mut self, timestamp_us: i64) -> Self {
        self.timestamp_us = Some(timestamp_us);
        self
    }

    /// Bytes a buffer of these dimensions must hold
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Key joining a cache entry to its stream record.
///
/// Decimal milliseconds since the epoch at publish time. Two frames published
/// within the same millisecond share a key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameKey(String);

impl FrameKey {
    pub fn from_millis(millis: i64) -> Self {
        Self(millis.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The milliseconds this key was derived from
    pub fn millis(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FrameKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Source of wall-clock milliseconds for key derivation
pub trait Clock: Send {
    fn now_millis(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}
