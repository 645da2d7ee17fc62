//! Alpha plane compression.
//!
//! The plane is left-filtered row by row (each sample predicted by its
//! left neighbor, rows seeded by the sample above) and the residuals are
//! coded bit by bit through the boolean encoder with one adaptive
//! probability per bit position. Smooth alpha planes, by far the common
//! case, collapse to a few bytes.

use super::arithmetic::BoolEncoder;

// Adaptation shift: larger adapts slower.
const ADAPT_SHIFT: u8 = 4;

struct AdaptiveBit {
    proba: u8,
}

impl AdaptiveBit {
    fn new() -> Self {
        Self { proba: 128 }
    }

    fn put(&mut self, enc: &mut BoolEncoder, bit: bool) {
        enc.write_bool(bit, self.proba);
        // the shift keeps the probability inside 1..=255
        if bit {
            self.proba -= self.proba >> ADAPT_SHIFT;
        } else {
            self.proba += (255 - self.proba) >> ADAPT_SHIFT;
        }
    }
}

fn left_filter(alpha: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(width * height);
    let mut above = 0u8;
    for row in 0..height {
        let line = &alpha[row * width..row * width + width];
        let mut left = above;
        for &v in line {
            out.push(v.wrapping_sub(left));
            left = v;
        }
        above = line[0];
    }
    out
}

/// Compress a `width * height` alpha plane. Deterministic.
pub fn compress_alpha(alpha: &[u8], width: usize, height: usize) -> Vec<u8> {
    debug_assert!(alpha.len() >= width * height);
    let filtered = left_filter(alpha, width, height);

    let mut enc = BoolEncoder::with_capacity(width * height / 8);
    let mut models: [AdaptiveBit; 8] = std::array::from_fn(|_| AdaptiveBit::new());
    for &byte in &filtered {
        for (i, model) in models.iter_mut().enumerate() {
            let bit = byte >> (7 - i) & 1 != 0;
            model.put(&mut enc, bit);
        }
    }
    enc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_plane_compresses_far_below_input() {
        let alpha = vec![255u8; 64 * 64];
        let out = compress_alpha(&alpha, 64, 64);
        assert!(out.len() < alpha.len() / 20, "got {} bytes", out.len());
    }

    #[test]
    fn compression_is_deterministic() {
        let mut alpha = vec![0u8; 32 * 32];
        for (i, v) in alpha.iter_mut().enumerate() {
            *v = ((i * 7) % 256) as u8;
        }
        let a = compress_alpha(&alpha, 32, 32);
        let b = compress_alpha(&alpha, 32, 32);
        assert_eq!(a, b);
    }

    #[test]
    fn gradient_rows_filter_to_small_residuals() {
        let mut alpha = vec![0u8; 16 * 16];
        for row in 0..16 {
            for col in 0..16 {
                alpha[row * 16 + col] = (col * 16) as u8;
            }
        }
        let filtered = left_filter(&alpha, 16, 16);
        // every in-row delta is the same constant
        assert!(filtered[1..16].iter().all(|&d| d == 16));
    }
}
