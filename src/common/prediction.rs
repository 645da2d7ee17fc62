//! Intra predictors.
//!
//! Each helper fills one predictor variant into the prediction scratch
//! buffer at its fixed offset (see the offset constants in [`super`]).
//! Neighbor samples are passed as optional slices: `None` means the
//! neighbor row/column lies outside the picture. The "left" slices carry
//! the top-left corner sample at index 0, followed by the 16 (or 8)
//! left-column samples.

use super::{
    clip_u8, BPS, C8DC8, C8HE8, C8TM8, C8VE8, I16DC16, I16HE16, I16TM16, I16VE16, I4DC4, I4HD4,
    I4HE4, I4HU4, I4LD4, I4RD4, I4TM4, I4VE4, I4VL4, I4VR4,
};

fn fill(dst: &mut [u8], value: u8, size: usize) {
    for row in dst.chunks_mut(BPS).take(size) {
        row[..size].fill(value);
    }
}

fn vertical_pred(dst: &mut [u8], top: Option<&[u8]>, size: usize) {
    match top {
        Some(top) => {
            for row in dst.chunks_mut(BPS).take(size) {
                row[..size].copy_from_slice(&top[..size]);
            }
        }
        None => fill(dst, 127, size),
    }
}

fn horizontal_pred(dst: &mut [u8], left: Option<&[u8]>, size: usize) {
    match left {
        Some(left) => {
            // left[0] is the corner sample; the column starts at 1
            for (y, row) in dst.chunks_mut(BPS).take(size).enumerate() {
                row[..size].fill(left[1 + y]);
            }
        }
        None => fill(dst, 129, size),
    }
}

fn true_motion(dst: &mut [u8], left: Option<&[u8]>, top: Option<&[u8]>, size: usize) {
    match (left, top) {
        (Some(left), Some(top)) => {
            let corner = i32::from(left[0]);
            for (y, row) in dst.chunks_mut(BPS).take(size).enumerate() {
                let base = i32::from(left[1 + y]) - corner;
                for x in 0..size {
                    row[x] = clip_u8(base + i32::from(top[x]));
                }
            }
        }
        (Some(left), None) => horizontal_pred(dst, Some(left), size),
        (None, Some(top)) => vertical_pred(dst, Some(top), size),
        (None, None) => fill(dst, 129, size),
    }
}

fn dc_mode(dst: &mut [u8], left: Option<&[u8]>, top: Option<&[u8]>, size: usize) {
    let dc = match (left, top) {
        (Some(left), Some(top)) => {
            let sum: u32 = top[..size]
                .iter()
                .chain(left[1..=size].iter())
                .map(|&v| u32::from(v))
                .sum();
            (sum + size as u32) >> if size == 16 { 5 } else { 4 }
        }
        (Some(left), None) => {
            let sum: u32 = left[1..=size].iter().map(|&v| u32::from(v)).sum();
            (sum + size as u32 / 2) >> if size == 16 { 4 } else { 3 }
        }
        (None, Some(top)) => {
            let sum: u32 = top[..size].iter().map(|&v| u32::from(v)).sum();
            (sum + size as u32 / 2) >> if size == 16 { 4 } else { 3 }
        }
        (None, None) => 0x80,
    };
    fill(dst, dc as u8, size);
}

/// Fill the four 16x16 luma predictors (DC, TM, VE, HE).
pub(crate) fn make_luma16_preds(yuv_p: &mut [u8], left: Option<&[u8]>, top: Option<&[u8]>) {
    dc_mode(&mut yuv_p[I16DC16..], left, top, 16);
    true_motion(&mut yuv_p[I16TM16..], left, top, 16);
    vertical_pred(&mut yuv_p[I16VE16..], top, 16);
    horizontal_pred(&mut yuv_p[I16HE16..], left, 16);
}

/// Fill the four 8x8 chroma predictors for both U and V.
/// `top` covers U and V side by side (8 + 8 samples).
pub(crate) fn make_chroma8_preds(
    yuv_p: &mut [u8],
    left_u: Option<&[u8]>,
    left_v: Option<&[u8]>,
    top: Option<&[u8]>,
) {
    let top_u = top.map(|t| &t[..8]);
    let top_v = top.map(|t| &t[8..16]);
    for (off, left, top) in [(0usize, left_u, top_u), (8usize, left_v, top_v)] {
        dc_mode(&mut yuv_p[C8DC8 + off..], left, top, 8);
        true_motion(&mut yuv_p[C8TM8 + off..], left, top, 8);
        vertical_pred(&mut yuv_p[C8VE8 + off..], top, 8);
        horizontal_pred(&mut yuv_p[C8HE8 + off..], left, 8);
    }
}

//------------------------------------------------------------------------------
// 4x4 luma predictors
//
// The ten sub-block predictors read from the 37-sample boundary cache
// maintained by the iterator. `tl` indexes the first sample above the
// sub-block; the corner is at tl-1 and the left column at tl-2..tl-5
// (top to bottom).

#[inline]
fn avg2(a: u8, b: u8) -> u8 {
    ((u32::from(a) + u32::from(b) + 1) >> 1) as u8
}

#[inline]
fn avg3(a: u8, b: u8, c: u8) -> u8 {
    ((u32::from(a) + 2 * u32::from(b) + u32::from(c) + 2) >> 2) as u8
}

fn put4(dst: &mut [u8], values: &[[u8; 4]; 4]) {
    for (y, row) in values.iter().enumerate() {
        dst[y * BPS..y * BPS + 4].copy_from_slice(row);
    }
}

/// Fill all ten 4x4 predictors for the sub-block whose top row starts at
/// `boundary[tl]`.
pub(crate) fn make_i4_preds(yuv_p: &mut [u8], boundary: &[u8; 37], tl: usize) {
    let mut top = [0u8; 8];
    top.copy_from_slice(&boundary[tl..tl + 8]);
    let [a, b, cc, d, e, f, g, h] = top;
    let x = boundary[tl - 1];
    let (i, j, k, l) = (
        boundary[tl - 2],
        boundary[tl - 3],
        boundary[tl - 4],
        boundary[tl - 5],
    );

    // DC4
    {
        let sum = u32::from(a)
            + u32::from(b)
            + u32::from(cc)
            + u32::from(d)
            + u32::from(i)
            + u32::from(j)
            + u32::from(k)
            + u32::from(l);
        let dc = ((sum + 4) >> 3) as u8;
        put4(&mut yuv_p[I4DC4..], &[[dc; 4]; 4]);
    }
    // TM4
    {
        let dst = &mut yuv_p[I4TM4..];
        for (y, &lv) in [i, j, k, l].iter().enumerate() {
            let base = i32::from(lv) - i32::from(x);
            for (xq, &tv) in top[..4].iter().enumerate() {
                dst[y * BPS + xq] = clip_u8(base + i32::from(tv));
            }
        }
    }
    // VE4: smoothed top row replicated downward
    {
        let vals = [
            avg3(x, a, b),
            avg3(a, b, cc),
            avg3(b, cc, d),
            avg3(cc, d, e),
        ];
        put4(&mut yuv_p[I4VE4..], &[vals; 4]);
    }
    // HE4: smoothed left column replicated rightward
    {
        let vals = [avg3(x, i, j), avg3(i, j, k), avg3(j, k, l), avg3(k, l, l)];
        put4(
            &mut yuv_p[I4HE4..],
            &[[vals[0]; 4], [vals[1]; 4], [vals[2]; 4], [vals[3]; 4]],
        );
    }
    // RD4: diagonal down-right
    {
        let p0 = avg3(j, k, l);
        let p1 = avg3(i, j, k);
        let p2 = avg3(x, i, j);
        let p3 = avg3(a, x, i);
        let p4 = avg3(b, a, x);
        let p5 = avg3(cc, b, a);
        let p6 = avg3(d, cc, b);
        put4(
            &mut yuv_p[I4RD4..],
            &[
                [p3, p4, p5, p6],
                [p2, p3, p4, p5],
                [p1, p2, p3, p4],
                [p0, p1, p2, p3],
            ],
        );
    }
    // VR4: vertical-right
    {
        let q0 = avg2(x, a);
        let q1 = avg2(a, b);
        let q2 = avg2(b, cc);
        let q3 = avg2(cc, d);
        let r0 = avg3(k, j, i);
        let r1 = avg3(j, i, x);
        let r2 = avg3(i, x, a);
        let r3 = avg3(x, a, b);
        let r4 = avg3(a, b, cc);
        let r5 = avg3(b, cc, d);
        put4(
            &mut yuv_p[I4VR4..],
            &[
                [q0, q1, q2, q3],
                [r2, r3, r4, r5],
                [r1, q0, q1, q2],
                [r0, r2, r3, r4],
            ],
        );
    }
    // LD4: diagonal down-left
    {
        let p0 = avg3(a, b, cc);
        let p1 = avg3(b, cc, d);
        let p2 = avg3(cc, d, e);
        let p3 = avg3(d, e, f);
        let p4 = avg3(e, f, g);
        let p5 = avg3(f, g, h);
        let p6 = avg3(g, h, h);
        put4(
            &mut yuv_p[I4LD4..],
            &[
                [p0, p1, p2, p3],
                [p1, p2, p3, p4],
                [p2, p3, p4, p5],
                [p3, p4, p5, p6],
            ],
        );
    }
    // VL4: vertical-left
    {
        let q0 = avg2(a, b);
        let q1 = avg2(b, cc);
        let q2 = avg2(cc, d);
        let q3 = avg2(d, e);
        let r0 = avg3(a, b, cc);
        let r1 = avg3(b, cc, d);
        let r2 = avg3(cc, d, e);
        let r3 = avg3(d, e, f);
        let r4 = avg3(e, f, g);
        let r5 = avg3(f, g, h);
        put4(
            &mut yuv_p[I4VL4..],
            &[
                [q0, q1, q2, q3],
                [r0, r1, r2, r3],
                [q1, q2, q3, r4],
                [r1, r2, r3, r5],
            ],
        );
    }
    // HD4: horizontal-down
    {
        let q0 = avg2(i, x);
        let q1 = avg2(j, i);
        let q2 = avg2(k, j);
        let q3 = avg2(l, k);
        let r0 = avg3(i, x, a);
        let r1 = avg3(x, a, b);
        let r2 = avg3(a, b, cc);
        let r3 = avg3(x, i, j);
        let r4 = avg3(i, j, k);
        let r5 = avg3(j, k, l);
        put4(
            &mut yuv_p[I4HD4..],
            &[
                [q0, r0, r1, r2],
                [q1, r3, q0, r0],
                [q2, r4, q1, r3],
                [q3, r5, q2, r4],
            ],
        );
    }
    // HU4: horizontal-up
    {
        let q0 = avg2(i, j);
        let q1 = avg2(j, k);
        let q2 = avg2(k, l);
        let r0 = avg3(i, j, k);
        let r1 = avg3(j, k, l);
        let r2 = avg3(k, l, l);
        put4(
            &mut yuv_p[I4HU4..],
            &[
                [q0, r0, q1, r1],
                [q1, r1, q2, r2],
                [q2, r2, l, l],
                [l, l, l, l],
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PRED_SIZE;

    #[test]
    fn dc16_without_neighbors_is_mid_gray() {
        let mut p = vec![0u8; PRED_SIZE];
        make_luma16_preds(&mut p, None, None);
        assert!(p[I16DC16..I16DC16 + 16].iter().all(|&v| v == 0x80));
    }

    #[test]
    fn vertical16_copies_top_row() {
        let mut p = vec![0u8; PRED_SIZE];
        let top: Vec<u8> = (0..16u8).map(|v| v * 3).collect();
        make_luma16_preds(&mut p, None, Some(&top));
        for y in 0..16 {
            assert_eq!(&p[I16VE16 + y * BPS..I16VE16 + y * BPS + 16], &top[..]);
        }
    }

    #[test]
    fn dc4_averages_boundary() {
        let mut p = vec![0u8; PRED_SIZE];
        let boundary = [100u8; 37];
        make_i4_preds(&mut p, &boundary, 17);
        assert!(p[I4DC4..I4DC4 + 4].iter().all(|&v| v == 100));
    }
}
