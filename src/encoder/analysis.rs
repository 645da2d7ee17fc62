//! Frame analysis pass: estimate each macroblock's coding susceptibility
//! and group macroblocks into quantization segments.
//!
//! Susceptibility is read off a histogram of coarse transform magnitudes
//! of the best-predicted source: a spread-out histogram means texture that
//! survives coarse quantization, a peaked one means smooth content that
//! needs finer treatment. Segment centers come from a short k-means over
//! the per-macroblock values.

use crate::common::transform::fdct;
use crate::common::{CHROMA_BLOCK_OFFSETS, LUMA_BLOCK_OFFSETS, U_OFF, Y_OFF};

use super::api::Picture;
use super::iterator::MbIterator;
use super::rd::{I16_MODE_OFFSETS, UV_MODE_OFFSETS};

pub const MAX_ALPHA: i32 = 255;
const ALPHA_SCALE: i32 = 2 * MAX_ALPHA;

const MAX_COEFF_THRESH: usize = 31;
const KMEANS_ITERATIONS: usize = 6;

/// Result of the analysis pass: one segment id per macroblock in raster
/// order, and the relative (alpha, beta) susceptibility of each segment.
pub struct Analysis {
    pub segments: Vec<u8>,
    pub segment_alphas: Vec<(i32, i32)>,
}

#[derive(Default)]
struct Histogram {
    distribution: [u32; MAX_COEFF_THRESH + 1],
}

impl Histogram {
    fn collect_block(&mut self, src: &[u8], pred: &[u8]) {
        let mut out = [0i32; 16];
        fdct(src, pred, &mut out);
        for &v in &out {
            let clipped = ((v.unsigned_abs() >> 3) as usize).min(MAX_COEFF_THRESH);
            self.distribution[clipped] += 1;
        }
    }

    fn alpha(&self) -> i32 {
        let mut max_value = 0u32;
        let mut last_non_zero = 1usize;
        for (k, &count) in self.distribution.iter().enumerate() {
            if count > 0 {
                if count > max_value {
                    max_value = count;
                }
                last_non_zero = k;
            }
        }
        if max_value > 1 {
            ALPHA_SCALE * last_non_zero as i32 / max_value as i32
        } else {
            0
        }
    }
}

fn final_alpha(alpha: i32) -> i32 {
    (MAX_ALPHA - alpha).clamp(0, MAX_ALPHA)
}

fn best_intra16_alpha(it: &MbIterator) -> i32 {
    let mut best = -1;
    for &mode_off in &I16_MODE_OFFSETS {
        let mut histo = Histogram::default();
        let pred = &it.yuv_p[mode_off..];
        for &off in &LUMA_BLOCK_OFFSETS {
            histo.collect_block(&it.yuv_in[Y_OFF + off..], &pred[off..]);
        }
        let alpha = histo.alpha();
        if alpha > best {
            best = alpha;
        }
    }
    best
}

fn best_uv_alpha(it: &MbIterator) -> i32 {
    let mut best = -1;
    for &mode_off in &UV_MODE_OFFSETS {
        let mut histo = Histogram::default();
        let pred = &it.yuv_p[mode_off..];
        for &off in &CHROMA_BLOCK_OFFSETS {
            histo.collect_block(&it.yuv_in[off..], &pred[off - U_OFF..]);
        }
        let alpha = histo.alpha();
        if alpha > best {
            best = alpha;
        }
    }
    best
}

fn macroblock_alpha(it: &mut MbIterator) -> i32 {
    it.make_luma16_preds();
    it.make_chroma8_preds();
    let luma = best_intra16_alpha(it);
    let uv = best_uv_alpha(it);
    final_alpha((3 * luma + uv + 2) >> 2)
}

// Short k-means over the alpha histogram, then relative (alpha, beta) per
// center: alpha is signed distance from the weighted mean, beta the
// position inside the center range.
fn assign_segments(
    alpha_histo: &[u32; (MAX_ALPHA + 1) as usize],
    mb_alphas: &[i32],
    nb: usize,
    segments: &mut [u8],
) -> Vec<(i32, i32)> {
    let mut min_a = 0usize;
    while min_a < MAX_ALPHA as usize && alpha_histo[min_a] == 0 {
        min_a += 1;
    }
    let mut max_a = MAX_ALPHA as usize;
    while max_a > min_a && alpha_histo[max_a] == 0 {
        max_a -= 1;
    }
    let range_a = (max_a - min_a) as i32;

    let mut centers = vec![0i32; nb];
    for (k, center) in centers.iter_mut().enumerate() {
        let n = (2 * k + 1) as i32;
        *center = min_a as i32 + n * range_a / (2 * nb as i32);
    }

    let mut map = [0usize; (MAX_ALPHA + 1) as usize];
    let mut weighted_average = 0i64;
    let mut total = 0i64;
    for _ in 0..KMEANS_ITERATIONS {
        let mut accum = vec![(0i64, 0i64); nb];
        weighted_average = 0;
        total = 0;
        let mut n = 0usize;
        for (a, &count) in alpha_histo.iter().enumerate().take(max_a + 1).skip(min_a) {
            if count == 0 {
                continue;
            }
            while n + 1 < nb
                && (a as i32 - centers[n]).abs() >= (a as i32 - centers[n + 1]).abs()
            {
                n += 1;
            }
            map[a] = n;
            accum[n].0 += a as i64 * i64::from(count);
            accum[n].1 += i64::from(count);
            weighted_average += a as i64 * i64::from(count);
            total += i64::from(count);
        }
        let mut displaced = 0i32;
        for (k, center) in centers.iter_mut().enumerate() {
            if accum[k].1 > 0 {
                let new_center = (accum[k].0 / accum[k].1) as i32;
                displaced += (*center - new_center).abs();
                *center = new_center;
            }
        }
        if displaced < 5 {
            break;
        }
    }
    let mid = if total > 0 {
        (weighted_average / total) as i32
    } else {
        centers[0]
    };

    // The quantizer derived from a susceptibility is monotone decreasing
    // in it, so ids are handed out in descending center order to keep
    // segment id and quantizer sorted the same way.
    for (seg, &alpha) in segments.iter_mut().zip(mb_alphas) {
        *seg = (nb - 1 - map[alpha.clamp(0, MAX_ALPHA) as usize]) as u8;
    }

    let min = centers.iter().copied().min().unwrap_or(0);
    let mut max = centers.iter().copied().max().unwrap_or(0);
    if max == min {
        max = min + 1;
    }
    centers
        .iter()
        .rev()
        .map(|&c| {
            let alpha = (255 * (c - mid) / (max - min)).clamp(-127, 127);
            let beta = (255 * (c - min) / (max - min)).clamp(0, 255);
            (alpha, beta)
        })
        .collect()
}

/// Analyze the frame and derive the segment map.
pub fn analyze(pic: &Picture<'_>, num_segments: usize) -> Analysis {
    let mut it = MbIterator::new(pic.width() as usize, pic.height() as usize);
    let mb_count = it.mb_w * it.mb_h;

    if num_segments <= 1 {
        return Analysis {
            segments: vec![0; mb_count],
            segment_alphas: vec![(0, 0)],
        };
    }

    let mut mb_alphas = Vec::with_capacity(mb_count);
    let mut alpha_histo = [0u32; (MAX_ALPHA + 1) as usize];
    loop {
        it.import(pic);
        let alpha = macroblock_alpha(&mut it);
        alpha_histo[alpha as usize] += 1;
        mb_alphas.push(alpha);
        // the source stands in for the reconstruction during analysis
        it.yuv_out = it.yuv_in;
        it.save_boundary();
        if !it.next() {
            break;
        }
    }

    let mut segments = vec![0u8; mb_count];
    let segment_alphas = assign_segments(&alpha_histo, &mb_alphas, num_segments, &mut segments);
    Analysis {
        segments,
        segment_alphas,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_picture(buf: &mut (Vec<u8>, Vec<u8>, Vec<u8>), w: usize, h: usize) {
        buf.0 = vec![128; w * h];
        buf.1 = vec![128; (w / 2) * (h / 2)];
        buf.2 = vec![128; (w / 2) * (h / 2)];
    }

    #[test]
    fn uniform_image_lands_in_one_effective_segment() {
        let mut planes = (vec![], vec![], vec![]);
        gray_picture(&mut planes, 64, 64);
        let pic = Picture::new_yuv(&planes.0, &planes.1, &planes.2, 64, 64).unwrap();
        let analysis = analyze(&pic, 4);
        assert_eq!(analysis.segments.len(), 4 * 4);
        let first = analysis.segments[0];
        assert!(analysis.segments.iter().all(|&s| s == first));
    }

    #[test]
    fn single_segment_mode_skips_the_search() {
        let mut planes = (vec![], vec![], vec![]);
        gray_picture(&mut planes, 32, 32);
        let pic = Picture::new_yuv(&planes.0, &planes.1, &planes.2, 32, 32).unwrap();
        let analysis = analyze(&pic, 1);
        assert_eq!(analysis.segment_alphas, vec![(0, 0)]);
        assert!(analysis.segments.iter().all(|&s| s == 0));
    }

    #[test]
    fn mixed_content_separates_segments() {
        // left half flat, right half noisy
        let (w, h) = (64usize, 32usize);
        let mut y = vec![128u8; w * h];
        for row in 0..h {
            for col in w / 2..w {
                y[row * w + col] = ((row * 31 + col * 17) % 256) as u8;
            }
        }
        let u = vec![128u8; (w / 2) * (h / 2)];
        let v = vec![128u8; (w / 2) * (h / 2)];
        let pic = Picture::new_yuv(&y, &u, &v, w as u32, h as u32).unwrap();
        let analysis = analyze(&pic, 4);
        let left = analysis.segments[0];
        let right = analysis.segments[3];
        assert_ne!(left, right);
    }
}
