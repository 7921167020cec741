//! Shared hard limits to prevent unbounded allocations or payload growth.

use crate::error::{AppResult, EmulatorError};

/// Maximum allowed frame payload in bytes (default: 100MB).
pub const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;
/// Default cap on an inbound request body (64KB).
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024;
/// Maximum supported width/height for frames.
pub const MAX_FRAME_DIMENSION: u32 = 16_384;
/// Most frames a single movie request may ask for.
pub const MAX_MOVIE_FRAMES: u32 = 100;

/// Validated frame sizing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    /// Pixel count.
    pub pixels: usize,
    /// Payload size at the requested dtype.
    pub bytes: usize,
}

/// Validate frame dimensions and calculate pixel/byte sizes safely.
pub fn validate_frame_size(width: u32, height: u32, bytes_per_pixel: usize) -> AppResult<FrameSize> {
    if width == 0 || height == 0 {
        return Err(EmulatorError::RenderFailure(format!(
            "frame dimensions {width}x{height} are empty"
        )));
    }
    if width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
        return Err(EmulatorError::RenderFailure(format!(
            "frame dimensions {width}x{height} exceed {MAX_FRAME_DIMENSION}"
        )));
    }

    let pixels = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| EmulatorError::RenderFailure("frame pixel count overflows".into()))?;

    let bytes = pixels
        .checked_mul(bytes_per_pixel)
        .ok_or_else(|| EmulatorError::RenderFailure("frame byte size overflows".into()))?;

    if bytes > MAX_FRAME_BYTES {
        return Err(EmulatorError::RenderFailure(format!(
            "frame of {bytes} bytes exceeds {MAX_FRAME_BYTES}"
        )));
    }

    Ok(FrameSize { pixels, bytes })
}
