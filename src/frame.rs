//! Frame container and pixel-buffer pooling.
//!
//! A `Frame` is a timestamped three-channel color buffer in fixed RGB order.
//! The grayscale view every detector consumes is derived on demand and cached
//! for the lifetime of the frame, so the conversion runs at most once per
//! frame no matter how many detectors ask for it.
//!
//! `BufferPool` is a small free-list of pixel buffers. The capture source
//! acquires from it and the pipeline releases frames back into it, so the
//! steady-state loop performs no per-frame allocation.

use anyhow::{anyhow, Result};
use std::sync::OnceLock;

/// Bytes per pixel in the color buffer (fixed RGB order).
pub const CHANNELS: usize = 3;

/// A single captured color frame.
///
/// Channel order is fixed at construction and never reinterpreted
/// downstream.
pub struct Frame {
    /// Wall-clock capture time in seconds since the Unix epoch.
    pub timestamp_s: f64,
    pub width: u32,
    pub height: u32,
    rgb: Vec<u8>,
    gray: OnceLock<Vec<u8>>,
}

impl Frame {
    pub fn new(timestamp_s: f64, width: u32, height: u32, rgb: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero"));
        }
        let expected = width as usize * height as usize * CHANNELS;
        if rgb.len() != expected {
            return Err(anyhow!(
                "frame buffer size mismatch: expected {} bytes for {}x{}, got {}",
                expected,
                width,
                height,
                rgb.len()
            ));
        }
        Ok(Self {
            timestamp_s,
            width,
            height,
            rgb,
            gray: OnceLock::new(),
        })
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn rgb(&self) -> &[u8] {
        &self.rgb
    }

    /// Mutable access to the color buffer (enhancement filters, watermark).
    /// Callers that rewrite pixels do so after every grayscale consumer has
    /// run for this frame, so the cached view is never invalidated.
    pub fn rgb_mut(&mut self) -> &mut [u8] {
        &mut self.rgb
    }

    /// Replace the color buffer wholesale (rescue/enhancement output).
    pub fn replace_rgb(&mut self, rgb: Vec<u8>) -> Result<()> {
        let expected = self.pixel_count() * CHANNELS;
        if rgb.len() != expected {
            return Err(anyhow!(
                "replacement buffer size mismatch: expected {}, got {}",
                expected,
                rgb.len()
            ));
        }
        self.rgb = rgb;
        Ok(())
    }

    /// Grayscale view using standard luminance weights, computed once.
    pub fn gray(&self) -> &[u8] {
        self.gray
            .get_or_init(|| crate::imgproc::grayscale(&self.rgb, self.width, self.height))
    }

    /// Tear the frame apart, returning the color buffer for pool reuse.
    pub fn into_buffer(self) -> Vec<u8> {
        self.rgb
    }
}

/// Free-list of pixel buffers to avoid per-frame allocation.
///
/// The pool is bounded: releases past capacity drop the buffer instead of
/// hoarding memory after a resolution change.
pub struct BufferPool {
    free: Vec<Vec<u8>>,
    max_buffers: usize,
}

impl BufferPool {
    pub fn new(max_buffers: usize) -> Self {
        Self {
            free: Vec::with_capacity(max_buffers),
            max_buffers,
        }
    }

    /// Take a buffer of exactly `len` bytes, reusing a pooled one if possible.
    pub fn acquire(&mut self, len: usize) -> Vec<u8> {
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.resize(len, 0);
                buf
            }
            None => vec![0u8; len],
        }
    }

    pub fn release(&mut self, buf: Vec<u8>) {
        if self.free.len() < self.max_buffers {
            self.free.push(buf);
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_mismatched_buffer() {
        assert!(Frame::new(0.0, 4, 4, vec![0u8; 10]).is_err());
        assert!(Frame::new(0.0, 0, 4, vec![]).is_err());
    }

    #[test]
    fn gray_is_cached_and_sized() {
        let frame = Frame::new(1.0, 2, 2, vec![255u8; 12]).unwrap();
        let first = frame.gray().as_ptr();
        let second = frame.gray().as_ptr();
        assert_eq!(first, second, "grayscale must be computed once");
        assert_eq!(frame.gray().len(), 4);
        assert_eq!(frame.gray()[0], 255);
    }

    #[test]
    fn pool_recycles_buffers() {
        let mut pool = BufferPool::new(2);
        let a = pool.acquire(16);
        pool.release(a);
        assert_eq!(pool.pooled(), 1);
        let b = pool.acquire(32);
        assert_eq!(b.len(), 32);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn pool_drops_past_capacity() {
        let mut pool = BufferPool::new(1);
        pool.release(vec![0u8; 4]);
        pool.release(vec![0u8; 4]);
        assert_eq!(pool.pooled(), 1);
    }
}
