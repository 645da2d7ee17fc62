//! Forward/inverse 4x4 transforms and the spectral distortion metric.
//!
//! The DCT approximation and the Walsh-Hadamard transform operate on 4x4
//! blocks of `i32` coefficients in row-major order. Pixel-domain entry
//! points read from and write to the `BPS`-strided scratch buffers.

use super::{clip_u8, BPS};

/// 16 bit fixed point version of cos(PI/8) * sqrt(2) - 1
const CONST1: i64 = 20091;
/// 16 bit fixed point version of sin(PI/8) * sqrt(2)
const CONST2: i64 = 35468;

/// Forward DCT of the difference between a source and a prediction block.
/// Both inputs are `BPS`-strided; the output is in row-major scan order.
pub fn fdct(src: &[u8], pred: &[u8], out: &mut [i32; 16]) {
    for y in 0..4 {
        for x in 0..4 {
            out[y * 4 + x] = i32::from(src[y * BPS + x]) - i32::from(pred[y * BPS + x]);
        }
    }
    dct4x4(out);
}

/// Inverse DCT of `coeffs` added onto `pred`, clipped and stored to `dst`.
/// `pred` and `dst` are `BPS`-strided and may alias the same buffer region.
pub fn idct_add(pred: &[u8], coeffs: &[i32; 16], dst: &mut [u8]) {
    let mut block = *coeffs;
    idct4x4(&mut block);
    for y in 0..4 {
        for x in 0..4 {
            dst[y * BPS + x] = clip_u8(i32::from(pred[y * BPS + x]) + block[y * 4 + x]);
        }
    }
}

pub(crate) fn dct4x4(block: &mut [i32; 16]) {
    // The intermediate results may overflow the types, so we stretch the type.
    fn fetch(block: &[i32], idx: usize) -> i64 {
        i64::from(block[idx])
    }

    // vertical
    for i in 0..4 {
        let a = (fetch(block, i * 4) + fetch(block, i * 4 + 3)) * 8;
        let b = (fetch(block, i * 4 + 1) + fetch(block, i * 4 + 2)) * 8;
        let c = (fetch(block, i * 4 + 1) - fetch(block, i * 4 + 2)) * 8;
        let d = (fetch(block, i * 4) - fetch(block, i * 4 + 3)) * 8;

        block[i * 4] = (a + b) as i32;
        block[i * 4 + 2] = (a - b) as i32;
        block[i * 4 + 1] = ((c * 2217 + d * 5352 + 14500) >> 12) as i32;
        block[i * 4 + 3] = ((d * 2217 - c * 5352 + 7500) >> 12) as i32;
    }

    // horizontal
    for i in 0..4 {
        let a = fetch(block, i) + fetch(block, i + 12);
        let b = fetch(block, i + 4) + fetch(block, i + 8);
        let c = fetch(block, i + 4) - fetch(block, i + 8);
        let d = fetch(block, i) - fetch(block, i + 12);

        block[i] = ((a + b + 7) >> 4) as i32;
        block[i + 8] = ((a - b + 7) >> 4) as i32;
        block[i + 4] = (((c * 2217 + d * 5352 + 12000) >> 16) + if d != 0 { 1 } else { 0 }) as i32;
        block[i + 12] = ((d * 2217 - c * 5352 + 51000) >> 16) as i32;
    }
}

pub(crate) fn idct4x4(block: &mut [i32; 16]) {
    // The intermediate results may overflow the types, so we stretch the type.
    fn fetch(block: &[i32], idx: usize) -> i64 {
        i64::from(block[idx])
    }

    for i in 0..4 {
        let a1 = fetch(block, i) + fetch(block, 8 + i);
        let b1 = fetch(block, i) - fetch(block, 8 + i);

        let t1 = (fetch(block, 4 + i) * CONST2) >> 16;
        let t2 = fetch(block, 12 + i) + ((fetch(block, 12 + i) * CONST1) >> 16);
        let c1 = t1 - t2;

        let t1 = fetch(block, 4 + i) + ((fetch(block, 4 + i) * CONST1) >> 16);
        let t2 = (fetch(block, 12 + i) * CONST2) >> 16;
        let d1 = t1 + t2;

        block[i] = (a1 + d1) as i32;
        block[4 + i] = (b1 + c1) as i32;
        block[4 * 3 + i] = (a1 - d1) as i32;
        block[4 * 2 + i] = (b1 - c1) as i32;
    }

    for i in 0..4 {
        let a1 = fetch(block, 4 * i) + fetch(block, 4 * i + 2);
        let b1 = fetch(block, 4 * i) - fetch(block, 4 * i + 2);

        let t1 = (fetch(block, 4 * i + 1) * CONST2) >> 16;
        let t2 = fetch(block, 4 * i + 3) + ((fetch(block, 4 * i + 3) * CONST1) >> 16);
        let c1 = t1 - t2;

        let t1 = fetch(block, 4 * i + 1) + ((fetch(block, 4 * i + 1) * CONST1) >> 16);
        let t2 = (fetch(block, 4 * i + 3) * CONST2) >> 16;
        let d1 = t1 + t2;

        block[4 * i] = ((a1 + d1 + 4) >> 3) as i32;
        block[4 * i + 3] = ((a1 - d1 + 4) >> 3) as i32;
        block[4 * i + 1] = ((b1 + c1 + 4) >> 3) as i32;
        block[4 * i + 2] = ((b1 - c1 + 4) >> 3) as i32;
    }
}

/// Forward Walsh-Hadamard transform of the sixteen luma DC coefficients.
pub(crate) fn wht4x4(block: &mut [i32; 16]) {
    // The intermediate results may overflow the types, so we stretch the type.
    fn fetch(block: &[i32], idx: usize) -> i64 {
        i64::from(block[idx])
    }

    // vertical
    for i in 0..4 {
        let a = fetch(block, i * 4) + fetch(block, i * 4 + 3);
        let b = fetch(block, i * 4 + 1) + fetch(block, i * 4 + 2);
        let c = fetch(block, i * 4 + 1) - fetch(block, i * 4 + 2);
        let d = fetch(block, i * 4) - fetch(block, i * 4 + 3);

        block[i * 4] = (a + b) as i32;
        block[i * 4 + 1] = (c + d) as i32;
        block[i * 4 + 2] = (a - b) as i32;
        block[i * 4 + 3] = (d - c) as i32;
    }

    // horizontal
    for i in 0..4 {
        let a1 = fetch(block, i) + fetch(block, i + 12);
        let b1 = fetch(block, i + 4) + fetch(block, i + 8);
        let c1 = fetch(block, i + 4) - fetch(block, i + 8);
        let d1 = fetch(block, i) - fetch(block, i + 12);

        let a2 = a1 + b1;
        let b2 = c1 + d1;
        let c2 = a1 - b1;
        let d2 = d1 - c1;

        let a3 = (a2 + if a2 > 0 { 1 } else { 0 }) / 2;
        let b3 = (b2 + if b2 > 0 { 1 } else { 0 }) / 2;
        let c3 = (c2 + if c2 > 0 { 1 } else { 0 }) / 2;
        let d3 = (d2 + if d2 > 0 { 1 } else { 0 }) / 2;

        block[i] = a3 as i32;
        block[i + 4] = b3 as i32;
        block[i + 8] = c3 as i32;
        block[i + 12] = d3 as i32;
    }
}

pub(crate) fn iwht4x4(block: &mut [i32; 16]) {
    for i in 0..4 {
        let a1 = block[i] + block[12 + i];
        let b1 = block[4 + i] + block[8 + i];
        let c1 = block[4 + i] - block[8 + i];
        let d1 = block[i] - block[12 + i];

        block[i] = a1 + b1;
        block[4 + i] = c1 + d1;
        block[8 + i] = a1 - b1;
        block[12 + i] = d1 - c1;
    }

    for block in block.chunks_exact_mut(4) {
        let a1 = block[0] + block[3];
        let b1 = block[1] + block[2];
        let c1 = block[1] - block[2];
        let d1 = block[0] - block[3];

        let a2 = a1 + b1;
        let b2 = c1 + d1;
        let c2 = a1 - b1;
        let d2 = d1 - c1;

        block[0] = (a2 + 3) >> 3;
        block[1] = (b2 + 3) >> 3;
        block[2] = (c2 + 3) >> 3;
        block[3] = (d2 + 3) >> 3;
    }
}

//------------------------------------------------------------------------------
// Spectral distortion
//
// A Hadamard transform of the pixel difference, weighted per frequency band,
// approximates how visible the reconstruction error is. Low frequencies
// weigh more than high ones.

/// Per-coefficient perceptual weights for the spectral distortion metric.
pub(crate) const DISTO_WEIGHTS: [u16; 16] = [
    38, 32, 20, 9, 32, 28, 17, 7, 20, 17, 10, 4, 9, 7, 4, 2,
];

fn hadamard_weighted(input: &[u8], w: &[u16; 16]) -> i32 {
    let mut tmp = [0i32; 16];
    // horizontal pass
    for i in 0..4 {
        let row = &input[i * BPS..];
        let a0 = i32::from(row[0]) + i32::from(row[2]);
        let a1 = i32::from(row[1]) + i32::from(row[3]);
        let a2 = i32::from(row[1]) - i32::from(row[3]);
        let a3 = i32::from(row[0]) - i32::from(row[2]);
        tmp[i * 4] = a0 + a1;
        tmp[i * 4 + 1] = a3 + a2;
        tmp[i * 4 + 2] = a3 - a2;
        tmp[i * 4 + 3] = a0 - a1;
    }
    // vertical pass, accumulating the weighted sum
    let mut sum = 0i32;
    for i in 0..4 {
        let a0 = tmp[i] + tmp[8 + i];
        let a1 = tmp[4 + i] + tmp[12 + i];
        let a2 = tmp[4 + i] - tmp[12 + i];
        let a3 = tmp[i] - tmp[8 + i];
        sum += i32::from(w[i]) * (a0 + a1).abs();
        sum += i32::from(w[4 + i]) * (a3 + a2).abs();
        sum += i32::from(w[8 + i]) * (a3 - a2).abs();
        sum += i32::from(w[12 + i]) * (a0 - a1).abs();
    }
    sum
}

/// Spectral distortion between two 4x4 blocks (both `BPS`-strided).
pub(crate) fn disto_4x4(a: &[u8], b: &[u8], w: &[u16; 16]) -> i32 {
    let sum1 = hadamard_weighted(a, w);
    let sum2 = hadamard_weighted(b, w);
    (sum2 - sum1).abs() >> 5
}

/// Spectral distortion accumulated over a 16x16 block.
pub(crate) fn disto_16x16(a: &[u8], b: &[u8], w: &[u16; 16]) -> i32 {
    let mut d = 0;
    for y in (0..16).step_by(4) {
        for x in (0..16).step_by(4) {
            d += disto_4x4(&a[x + y * BPS..], &b[x + y * BPS..], w);
        }
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dct_inverse() {
        const BLOCK: [i32; 16] = [
            38, 6, 210, 107, 42, 125, 185, 151, 241, 224, 125, 233, 227, 8, 57, 96,
        ];

        let mut dct_block = BLOCK;

        dct4x4(&mut dct_block);

        let mut inverse_dct_block = dct_block;

        idct4x4(&mut inverse_dct_block);

        assert_eq!(BLOCK, inverse_dct_block);
    }

    #[test]
    fn test_wht_inverse() {
        // Multiples of four survive the forward halving step without loss.
        const BLOCK: [i32; 16] = [
            120, -4, 44, 0, 16, 8, -60, 4, 0, 0, 32, -8, 12, 4, 4, -128,
        ];

        let mut wht_block = BLOCK;

        wht4x4(&mut wht_block);

        let mut inverse = wht_block;

        iwht4x4(&mut inverse);

        assert_eq!(BLOCK, inverse);
    }

    #[test]
    fn test_disto_zero_for_identical_blocks() {
        let mut buf = [0u8; BPS * 4];
        for (i, px) in buf.iter_mut().enumerate() {
            *px = (i * 7 % 251) as u8;
        }
        assert_eq!(disto_4x4(&buf, &buf, &DISTO_WEIGHTS), 0);
    }
}
