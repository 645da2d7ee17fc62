//! Public entry points: input picture description, error type and the
//! encoded-frame result.

use thiserror::Error;

use super::config::EncoderConfig;
use super::frame;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EncodingError {
    /// Width or height is zero or above the 14-bit coding limit.
    #[error("invalid picture dimensions")]
    InvalidDimensions,

    /// A plane buffer is smaller than the dimensions require.
    #[error("invalid buffer size: {0}")]
    InvalidBufferSize(&'static str),

    /// An allocation failed; partial output is discarded.
    #[error("out of memory")]
    OutOfMemory,

    /// The progress hook requested cancellation.
    #[error("encoding aborted")]
    Aborted,
}

/// Widest dimension the macroblock coordinates can address.
pub const MAX_DIMENSION: u32 = 1 << 14;

/// Called with the overall progress in percent; returning `false` aborts
/// the encode.
pub type ProgressHook<'a> = dyn Fn(i32) -> bool + 'a;

/// Borrowed planar 4:2:0 input. Chroma planes are `(width+1)/2` by
/// `(height+1)/2`; rows are tightly packed.
pub struct Picture<'a> {
    y: &'a [u8],
    u: &'a [u8],
    v: &'a [u8],
    alpha: Option<&'a [u8]>,
    width: u32,
    height: u32,
}

impl<'a> Picture<'a> {
    pub fn new_yuv(
        y: &'a [u8],
        u: &'a [u8],
        v: &'a [u8],
        width: u32,
        height: u32,
    ) -> Result<Self, EncodingError> {
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(EncodingError::InvalidDimensions);
        }
        let luma = width as usize * height as usize;
        let chroma = ((width as usize + 1) / 2) * ((height as usize + 1) / 2);
        if y.len() < luma {
            return Err(EncodingError::InvalidBufferSize("luma plane too short"));
        }
        if u.len() < chroma || v.len() < chroma {
            return Err(EncodingError::InvalidBufferSize("chroma plane too short"));
        }
        Ok(Self {
            y,
            u,
            v,
            alpha: None,
            width,
            height,
        })
    }

    /// Attach a full-resolution alpha plane (`width * height` bytes).
    pub fn with_alpha(mut self, alpha: &'a [u8]) -> Result<Self, EncodingError> {
        if alpha.len() < self.width as usize * self.height as usize {
            return Err(EncodingError::InvalidBufferSize("alpha plane too short"));
        }
        self.alpha = Some(alpha);
        Ok(self)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn y_plane(&self) -> &'a [u8] {
        self.y
    }

    pub fn u_plane(&self) -> &'a [u8] {
        self.u
    }

    pub fn v_plane(&self) -> &'a [u8] {
        self.v
    }

    pub fn alpha_plane(&self) -> Option<&'a [u8]> {
        self.alpha
    }

    pub fn y_stride(&self) -> usize {
        self.width as usize
    }

    pub fn uv_stride(&self) -> usize {
        (self.width as usize + 1) / 2
    }
}

/// Per-frame coding statistics.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct EncodingStats {
    /// Macroblocks coded with 16x16 prediction.
    pub i16_count: usize,
    /// Macroblocks coded with per-4x4 prediction.
    pub i4_count: usize,
    /// Macroblocks skipped entirely.
    pub skip_count: usize,
    /// Quantizer index per segment.
    pub segment_quant: [i32; 4],
    /// Number of segments in use.
    pub segment_count: usize,
    /// Sum of squared luma reconstruction error.
    pub luma_sse: u64,
}

/// The coded partitions of one frame.
pub struct EncodedFrame {
    /// Mode partition: segment map, skip flags and intra modes.
    pub mode_partition: Vec<u8>,
    /// Residual partition: the quantized coefficient tokens.
    pub residual_partition: Vec<u8>,
    /// Losslessly compressed alpha plane, when the input carried one.
    pub alpha: Option<Vec<u8>>,
    /// Estimated loop filter level per segment.
    pub filter_levels: [i32; 4],
    pub stats: EncodingStats,
}

/// Encode one frame.
pub fn encode_frame(
    config: &EncoderConfig,
    picture: &Picture<'_>,
) -> Result<EncodedFrame, EncodingError> {
    frame::encode(config, picture, None)
}

/// Encode one frame, reporting progress through `hook`. The hook sees a
/// monotone percentage and may abort by returning `false`.
pub fn encode_frame_with_progress(
    config: &EncoderConfig,
    picture: &Picture<'_>,
    hook: &ProgressHook<'_>,
) -> Result<EncodedFrame, EncodingError> {
    frame::encode(config, picture, Some(hook))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_dimensions() {
        let buf = [0u8; 16];
        assert!(matches!(
            Picture::new_yuv(&buf, &buf, &buf, 0, 4),
            Err(EncodingError::InvalidDimensions)
        ));
    }

    #[test]
    fn rejects_short_planes() {
        let y = vec![0u8; 16 * 16];
        let small = [0u8; 4];
        assert!(matches!(
            Picture::new_yuv(&y, &small, &small, 16, 16),
            Err(EncodingError::InvalidBufferSize(_))
        ));
        let chroma = vec![0u8; 8 * 8];
        assert!(Picture::new_yuv(&y, &chroma, &chroma, 16, 16).is_ok());
    }

    #[test]
    fn odd_dimensions_round_chroma_up() {
        let y = vec![0u8; 17 * 17];
        let chroma = vec![0u8; 9 * 9];
        let pic = Picture::new_yuv(&y, &chroma, &chroma, 17, 17).unwrap();
        assert_eq!(pic.uv_stride(), 9);
    }
}
