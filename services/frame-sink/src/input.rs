//! Raw frame input.
//!
//! Frames arrive back to back on a byte stream, each `frame_bytes` long. Only
//! the leading `width * height` bytes are published, which is the luma plane
//! for planar YUV layouts and the whole frame for Gray8.

use crate::config::Config;
use crate::frame::Frame;
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use thiserror::Error;
use tracing::info;

/// Errors that can occur while reading frames
#[derive(Error, Debug)]
pub enum InputError {
    #[error("Failed to read frame input: {0}")]
    Io(#[from] io::Error),

    #[error("Frame input ended mid-frame: read {actual} of {expected} bytes")]
    TruncatedFrame { expected: usize, actual: usize },

    #[error("Input frames of {frame_bytes} bytes cannot hold a {width}x{height} luma plane")]
    FrameTooSmall {
        frame_bytes: usize,
        width: u32,
        height: u32,
    },
}

/// Reads fixed-size frames from a byte stream
pub struct FrameReader<R> {
    reader: R,
    width: u32,
    height: u32,
    buffer: Vec<u8>,
    frames_read: u64,
}

impl FrameReader<Box<dyn Read + Send>> {
    /// Open the configured input file, or stdin when none is set
    pub fn open(config: &Config) -> Result<Self, InputError> {
        let reader: Box<dyn Read + Send> = match &config.input.path {
            Some(path) => {
                info!(path = %path, "Reading frames from file");
                Box::new(File::open(path)?)
            }
            None => {
                info!("Reading frames from stdin");
                Box::new(io::stdin())
            }
        };

        Self::new(
            reader,
            config.frame.width,
            config.frame.height,
            config.input_frame_bytes(),
        )
    }
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, width: u32, height: u32, frame_bytes: usize) -> Result<Self, InputError> {
        let pixels = width as usize * height as usize;
        if frame_bytes < pixels {
            return Err(InputError::FrameTooSmall {
                frame_bytes,
                width,
                height,
            });
        }

        Ok(Self {
            reader,
            width,
            height,
            buffer: vec![0; frame_bytes],
            frames_read: 0,
        })
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Next frame, or `None` once the input ends on a frame boundary
    pub fn next_frame(&mut self) -> Result<Option<Frame<'_>>, InputError> {
        let filled = fill(&mut self.reader, &mut self.buffer)?;

        if filled == 0 {
            return Ok(None);
        }
        if filled < self.buffer.len() {
            return Err(InputError::TruncatedFrame {
                expected: self.buffer.len(),
                actual: filled,
            });
        }

        self.frames_read += 1;
        let pixels = self.width as usize * self.height as usize;
        Ok(Some(Frame::gray8(
            &self.buffer[..pixels],
            self.width,
            self.height,
        )))
    }
}

/// Read until `buf` is full or the input ends
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
