//! Quantization matrices and segment parameter derivation.
//!
//! Each segment carries three matrices (luma-AC, luma-DC, chroma) built
//! around reciprocal fixed-point division: `level = (v * iq + bias) >> 17`
//! is the single lossy step of the encoder. The zero threshold below which
//! that division is guaranteed to produce 0 is precomputed per position.

// Many loops in this file match reference C patterns for clarity
#![allow(clippy::needless_range_loop)]

use super::tables::{FREQ_SHARPENING, MAX_LEVEL, ZIGZAG};

/// Fixed-point precision for quantization
pub const QFIX: u32 = 17;

/// Error diffusion downscale shift (stored errors are halved).
pub const DSCALE: u32 = 1;

/// Bias calculation macro equivalent
#[inline]
pub const fn quantization_bias(b: u32) -> u32 {
    ((b << QFIX) + 128) >> 8
}

/// Quantization division: (coeff * iq + bias) >> QFIX
#[inline]
pub fn quantdiv(coeff: u32, iq: u32, bias: u32) -> i32 {
    ((coeff as u64 * iq as u64 + bias as u64) >> QFIX) as i32
}

/// Matrix kind, selecting the rounding bias pair.
#[derive(Clone, Copy, Debug)]
pub enum MatrixKind {
    /// Luma AC coefficients
    Y1,
    /// Luma DC (WHT) coefficients
    Y2,
    /// Chroma coefficients
    UV,
}

/// Quantization matrix for one coefficient plane.
#[derive(Clone, Debug)]
pub struct QuantMatrix {
    /// Quantizer steps for each coefficient position
    pub q: [u16; 16],
    /// Reciprocals (1 << QFIX) / q, for fast division
    pub iq: [u32; 16],
    /// Rounding bias for quantization
    pub bias: [u32; 16],
    /// Zero threshold: coefficients at or below this quantize to 0
    pub zthresh: [u32; 16],
    /// Sharpening boost for high-frequency coefficients
    pub sharpen: [u16; 16],
}

impl QuantMatrix {
    /// Create a matrix from DC and AC quantizer steps.
    pub fn new(q_dc: u16, q_ac: u16, kind: MatrixKind) -> Self {
        let bias_values = match kind {
            MatrixKind::Y1 => (96, 110),  // luma-ac
            MatrixKind::Y2 => (96, 108),  // luma-dc
            MatrixKind::UV => (110, 115), // chroma
        };

        let mut m = Self {
            q: [0; 16],
            iq: [0; 16],
            bias: [0; 16],
            zthresh: [0; 16],
            sharpen: [0; 16],
        };

        m.q[0] = q_dc.max(1);
        m.q[1] = q_ac.max(1);

        for i in 0..2 {
            let bias = if i > 0 { bias_values.1 } else { bias_values.0 };
            m.iq[i] = ((1u64 << QFIX) / m.q[i] as u64) as u32;
            m.bias[i] = quantization_bias(bias);
            // zthresh: value such that quantdiv(coeff, iq, bias) is 0 if coeff <= zthresh
            m.zthresh[i] = ((1 << QFIX) - 1 - m.bias[i]) / m.iq[i];
        }

        for i in 2..16 {
            m.q[i] = m.q[1];
            m.iq[i] = m.iq[1];
            m.bias[i] = m.bias[1];
            m.zthresh[i] = m.zthresh[1];
        }

        if matches!(kind, MatrixKind::Y1) {
            const SHARPEN_BITS: u32 = 11;
            for (i, &freq_sharpen) in FREQ_SHARPENING.iter().enumerate() {
                m.sharpen[i] = ((freq_sharpen as u32 * m.q[i] as u32) >> SHARPEN_BITS) as u16;
            }
        }

        m
    }

    /// Average quantizer value, for lambda calculations.
    pub fn average_q(&self) -> u32 {
        let sum: u32 = self.q.iter().map(|&x| u32::from(x)).sum();
        (sum + 8) >> 4
    }

    /// Quantize a 4x4 block. `coeffs` holds transform output in scan order
    /// and is overwritten with the dequantized reconstruction; `out`
    /// receives the levels in zigzag order. Positions before `first` are
    /// left untouched. Returns whether any level is non-zero.
    pub fn quantize_block(&self, coeffs: &mut [i32; 16], out: &mut [i32; 16], first: usize) -> bool {
        let mut nz = false;
        for n in first..16 {
            let j = ZIGZAG[n];
            let sign = coeffs[j] < 0;
            let c = coeffs[j].unsigned_abs() + u32::from(self.sharpen[j]);
            if c > self.zthresh[j] {
                let mut level = quantdiv(c, self.iq[j], self.bias[j]).min(MAX_LEVEL as i32);
                if sign {
                    level = -level;
                }
                coeffs[j] = level * i32::from(self.q[j]);
                out[n] = level;
                nz |= level != 0;
            } else {
                out[n] = 0;
                coeffs[j] = 0;
            }
        }
        nz
    }

    /// Quantize one DC value in place (written back dequantized) and return
    /// the downscaled rounding error, for chroma error diffusion.
    pub fn quantize_single(&self, v: &mut i32) -> i32 {
        let sign = *v < 0;
        let abs = v.unsigned_abs();
        if abs > self.zthresh[0] {
            let qv = quantdiv(abs, self.iq[0], self.bias[0]).min(MAX_LEVEL as i32)
                * i32::from(self.q[0]);
            let err = abs as i32 - qv;
            *v = if sign { -qv } else { qv };
            (if sign { -err } else { err }) >> DSCALE
        } else {
            let err = *v;
            *v = 0;
            err >> DSCALE
        }
    }
}

//------------------------------------------------------------------------------
// Segment parameters

/// Per-segment quantization and rate-distortion parameters.
#[derive(Clone, Debug)]
pub struct SegmentInfo {
    /// Luma AC matrix.
    pub y1: QuantMatrix,
    /// Luma DC (WHT) matrix.
    pub y2: QuantMatrix,
    /// Chroma matrix.
    pub uv: QuantMatrix,
    /// Base quantizer index, 0..=127.
    pub quant: i32,
    /// Susceptibility used to modulate the quantizer (-127..=127).
    pub alpha: i32,
    /// Filter susceptibility (0..=255).
    pub beta: i32,
    /// Estimated loop-filter strength, 0..=63 (never applied here).
    pub fstrength: i32,

    // RD multipliers, all growing with the quantizer.
    pub lambda_i16: i64,
    pub lambda_i4: i64,
    pub lambda_uv: i64,
    pub lambda_mode: i64,
    pub lambda_trellis_i16: i64,
    pub lambda_trellis_i4: i64,
    pub lambda_trellis_uv: i64,
    /// Multiplier of the spectral distortion term; 0 disables it.
    pub tlambda: i64,
    /// Flat penalty discouraging 4x4 modes at low quality.
    pub i4_penalty: i64,
}

// Quantizer index to quantization step. The curves are monotone and span
// roughly the classic 4..284 (AC) and 4..157 (DC) ranges.
fn ac_step(index: i32) -> u16 {
    let i = index.clamp(0, 127);
    (4 + i + i * i / 121) as u16
}

fn dc_step(index: i32) -> u16 {
    let i = index.clamp(0, 127);
    (4 + (3 * i) / 4 + i * i / 330) as u16
}

impl SegmentInfo {
    fn new(quant: i32, alpha: i32, beta: i32, sns: u8) -> Self {
        let q = quant.clamp(0, 127);
        let dc = dc_step(q);
        let ac = ac_step(q);
        let ac2 = (u32::from(ac) * 155 / 100).max(8) as u16;

        let y1 = QuantMatrix::new(dc, ac, MatrixKind::Y1);
        let y2 = QuantMatrix::new(dc.saturating_mul(2), ac2, MatrixKind::Y2);
        let uv = QuantMatrix::new(dc, ac, MatrixKind::UV);

        let q_i4 = i64::from(y1.average_q());
        let q_i16 = q_i4;
        let q_uv = i64::from(uv.average_q());

        let mut s = Self {
            y1,
            y2,
            uv,
            quant: q,
            alpha,
            beta,
            fstrength: 0,
            lambda_i16: 3 * q_i16 * q_i16,
            lambda_i4: (3 * q_i4 * q_i4) >> 7,
            lambda_uv: (3 * q_uv * q_uv) >> 6,
            lambda_mode: (q_i4 * q_i4) >> 7,
            lambda_trellis_i16: (q_i16 * q_i16) >> 2,
            lambda_trellis_i4: (7 * q_i4 * q_i4) >> 3,
            lambda_trellis_uv: (q_uv * q_uv) << 1,
            tlambda: (i64::from(sns) * q_i4) >> 5,
            i4_penalty: 1000 * q_i4 * q_i4,
        };
        // Lambdas of zero would make the rate term vanish entirely.
        s.lambda_i4 = s.lambda_i4.max(1);
        s.lambda_mode = s.lambda_mode.max(1);
        s.lambda_trellis_i16 = s.lambda_trellis_i16.max(1);
        s.lambda_trellis_i4 = s.lambda_trellis_i4.max(1);
        s.lambda_trellis_uv = s.lambda_trellis_uv.max(1);
        s
    }
}

fn quality_to_compression(c: f64) -> f64 {
    let linear_c = if c < 0.75 { c * (2.0 / 3.0) } else { 2.0 * c - 1.0 };
    linear_c.powf(1.0 / 3.0)
}

/// Derive per-segment parameters from the global quality and each
/// segment's susceptibility. The returned quantizers are non-increasing in
/// `quality` and sorted so that a higher segment id never quantizes finer.
pub fn setup_segments(
    quality: f32,
    sns: u8,
    filter_strength: u8,
    sharpness: u8,
    segment_alphas: &[(i32, i32)],
) -> Vec<SegmentInfo> {
    const SNS_TO_DQ: f64 = 0.9;
    let amp = SNS_TO_DQ * f64::from(sns) / 100.0 / 128.0;
    let c_base = quality_to_compression(f64::from(quality.clamp(0.0, 100.0)) / 100.0);

    let mut segments: Vec<SegmentInfo> = segment_alphas
        .iter()
        .map(|&(alpha, beta)| {
            let expn = 1.0 - amp * f64::from(alpha);
            let c = c_base.powf(expn);
            let q = (127.0 * (1.0 - c)).round().clamp(0.0, 127.0) as i32;
            SegmentInfo::new(q, alpha, beta, sns)
        })
        .collect();
    // Keep the quantizer monotone in the segment id.
    segments.sort_by_key(|s| s.quant);

    // Filter strength estimate: stronger for coarse quantizers, weaker for
    // low-complexity segments. Recorded only, never applied.
    const FSTRENGTH_CUTOFF: i32 = 2;
    let level0 = 5 * i32::from(filter_strength.min(100));
    for s in segments.iter_mut() {
        let qstep = i32::from(ac_step(s.quant)) >> 2;
        let base_strength = filter_strength_from_delta(sharpness, qstep);
        let f = base_strength * level0 / (256 + s.beta);
        s.fstrength = if f < FSTRENGTH_CUTOFF {
            0
        } else {
            f.min(63)
        };
    }
    segments
}

/// Smallest filter level whose filtering reach covers an edge delta.
/// Monotone in `delta`, bounded to [0, 63], and shrinking as `sharpness`
/// grows.
pub fn filter_strength_from_delta(sharpness: u8, delta: i32) -> i32 {
    let pos = delta.clamp(0, 255);
    for level in 0..64 {
        let mut interior = level;
        if sharpness > 0 {
            interior >>= if sharpness > 4 { 2 } else { 1 };
            interior = interior.min(9 - i32::from(sharpness.min(8)));
        }
        interior = interior.max(1);
        if 2 * level + interior >= pos {
            return level;
        }
    }
    63
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconstruction_error_is_bounded_by_the_step() {
        for q in [4u16, 17, 35, 96, 157, 284] {
            let m = QuantMatrix::new(q, q, MatrixKind::UV);
            for v in (-2000i32..2000).step_by(13) {
                let mut coeffs = [0i32; 16];
                let mut out = [0i32; 16];
                coeffs[0] = v;
                m.quantize_block(&mut coeffs, &mut out, 0);
                assert!((coeffs[0] - v).abs() <= i32::from(q));
            }
        }
    }

    #[test]
    fn zthresh_marks_the_zero_boundary() {
        let m = QuantMatrix::new(35, 60, MatrixKind::Y1);
        for pos in [0usize, 1] {
            let t = m.zthresh[pos];
            assert_eq!(quantdiv(t, m.iq[pos], m.bias[pos]), 0);
            assert!(quantdiv(t + 1, m.iq[pos], m.bias[pos]) > 0);
        }
    }

    #[test]
    fn quantizers_do_not_increase_with_quality() {
        let mut prev = i32::MAX;
        for q in 0..=100 {
            let segs = setup_segments(q as f32, 50, 60, 0, &[(0, 128)]);
            assert!(segs[0].quant <= prev);
            prev = segs[0].quant;
        }
    }

    #[test]
    fn segment_quantizers_are_sorted() {
        let alphas = [(90, 200), (-60, 40), (10, 120), (-120, 10)];
        let segs = setup_segments(60.0, 80, 60, 0, &alphas);
        for pair in segs.windows(2) {
            assert!(pair[0].quant <= pair[1].quant);
        }
    }

    #[test]
    fn filter_strength_is_monotone_in_delta() {
        for sharpness in 0..8 {
            let mut prev = 0;
            for delta in 0..200 {
                let level = filter_strength_from_delta(sharpness, delta);
                assert!((0..=63).contains(&level));
                assert!(level >= prev);
                prev = level;
            }
        }
    }

    #[test]
    fn quantize_single_reports_rounding_error() {
        let m = QuantMatrix::new(20, 20, MatrixKind::UV);
        let mut v = 33;
        let err = m.quantize_single(&mut v);
        // 33 quantizes to 2 * 20 = 40; the error is (33 - 40) >> 1
        assert_eq!(v % i32::from(m.q[0]), 0);
        assert_eq!(err, (33 - v) >> DSCALE);
    }
}
