//! Per-macroblock mode decision and reconstruction.
//!
//! `decimate` searches the intra modes of one macroblock under the
//! configured rate-distortion level, reconstructs the winner into the
//! iterator's committed output buffer and leaves the chosen levels in a
//! [`ModeScore`]. Scores combine rate and distortion as
//! `rate * lambda + 256 * distortion`, with rates estimated from the same
//! cost tables the token writer uses.

use crate::common::transform::{disto_16x16, disto_4x4, DISTO_WEIGHTS};
use crate::common::{
    sse_16x16, sse_4x4, sse_uv, BPS, C8DC8, C8HE8, C8TM8, C8VE8, CHROMA_BLOCK_OFFSETS, I16DC16,
    I16HE16, I16TM16, I16VE16, I4DC4, I4HD4, I4HE4, I4HU4, I4LD4, I4RD4, I4TM4, I4VE4, I4VL4,
    I4VR4, LUMA_BLOCK_OFFSETS, PRED_SIZE, U_OFF, YUV_SIZE, Y_OFF,
};

use super::config::RdLevel;
use super::cost::{residual_cost, LevelCosts, Residual};
use super::iterator::{DiffusionError, MbIterator};
use super::quantize::{QuantMatrix, SegmentInfo};
use super::tables::{
    TokenProbTables, COST_I4_FLAG, FIXED_COSTS_I16, FIXED_COSTS_I4, FIXED_COSTS_UV,
};
use super::trellis::trellis_quantize_block;
use crate::common::transform::{fdct, idct_add, iwht4x4, wht4x4};

/// Weight of the distortion term against `rate * lambda`.
pub const RD_DISTO_MULT: i64 = 256;

const MAX_COST: i64 = i64::MAX / 2;

// Blocks with at most this many non-zero AC levels count as flat; complex
// predictions of flat areas get a rate penalty.
const FLATNESS_LIMIT_I16: usize = 0;
const FLATNESS_LIMIT_I4: usize = 3;
const FLATNESS_LIMIT_UV: usize = 2;
const FLATNESS_PENALTY: i64 = 140;

// Fixed lambdas of the distortion-only refinement (RD level `None`).
const LAMBDA_D_I16: i64 = 106;
const LAMBDA_D_I4: i64 = 11;
const LAMBDA_D_UV: i64 = 120;

// Chroma DC error diffusion; half of the error flows right, half down.
const DIFFUSION_C1: i32 = 7;
const DIFFUSION_C2: i32 = 8;
const DIFFUSION_SHIFT: i32 = 4;
const DIFFUSION_SCALE: i32 = 1;

/// Prediction cache offsets of the 16x16 modes, in mode order.
pub const I16_MODE_OFFSETS: [usize; 4] = [I16DC16, I16TM16, I16VE16, I16HE16];
/// Prediction cache offsets of the chroma modes.
pub const UV_MODE_OFFSETS: [usize; 4] = [C8DC8, C8TM8, C8VE8, C8HE8];
/// Prediction cache offsets of the ten 4x4 modes.
pub const I4_MODE_OFFSETS: [usize; 10] = [
    I4DC4, I4TM4, I4VE4, I4HE4, I4RD4, I4VR4, I4LD4, I4VL4, I4HD4, I4HU4,
];

#[inline]
pub fn rd_score(lambda: i64, rate: i64, distortion: i64) -> i64 {
    rate * lambda + RD_DISTO_MULT * distortion
}

#[inline]
fn mult_8b(a: i64, b: i64) -> i64 {
    (a * b + 128) >> 8
}

/// Search parameters shared by every macroblock of a segment.
pub struct RdParams<'a> {
    pub seg: &'a SegmentInfo,
    pub probs: &'a TokenProbTables,
    pub costs: &'a LevelCosts,
    pub rd_level: RdLevel,
    pub method: u8,
    /// Chroma DC error diffusion, disabled near-lossless.
    pub diffuse: bool,
    /// Per-macroblock mode bits beyond which a mode is not even tried.
    pub header_bit_limit: i64,
    /// Frame-wide budget for 4x4 mode signalling.
    pub max_i4_header_bits: i64,
}

/// Outcome of the mode search for one macroblock: chosen modes, quantized
/// levels, reconstruction statistics and the running RD score.
pub struct ModeScore {
    pub d: i64,
    pub sd: i64,
    pub h: i64,
    pub r: i64,
    pub score: i64,
    pub nz: u32,
    pub y_dc_levels: [i32; 16],
    pub y_ac_levels: [[i32; 16]; 16],
    pub uv_levels: [[i32; 16]; 8],
    pub mode_i16: usize,
    pub modes_i4: [u8; 16],
    pub mode_uv: usize,
    pub is_i4: bool,
    /// Diffusion errors of the chroma DC blocks #1..#3, per channel.
    pub derr: [[i8; 3]; 2],
    /// Largest luma DC delta of a blocky macroblock, for the filter
    /// strength estimate. Zero when the block is not blocky.
    pub max_edge_delta: i32,
}

impl ModeScore {
    pub fn new() -> Self {
        Self {
            d: 0,
            sd: 0,
            h: 0,
            r: 0,
            score: MAX_COST,
            nz: 0,
            y_dc_levels: [0; 16],
            y_ac_levels: [[0; 16]; 16],
            uv_levels: [[0; 16]; 8],
            mode_i16: 0,
            modes_i4: [0; 16],
            mode_uv: 0,
            is_i4: false,
            derr: [[0; 3]; 2],
            max_edge_delta: 0,
        }
    }

    pub fn init_score(&mut self) {
        self.d = 0;
        self.sd = 0;
        self.h = 0;
        self.r = 0;
        self.nz = 0;
        self.score = MAX_COST;
    }

    pub fn set_score(&mut self, lambda: i64) {
        self.score = rd_score(lambda, self.r + self.h, self.d + self.sd);
    }
}

impl Default for ModeScore {
    fn default() -> Self {
        Self::new()
    }
}

// Small accumulator for partial scores during the i4/uv searches.
#[derive(Clone, Copy, Default)]
struct Score {
    d: i64,
    sd: i64,
    h: i64,
    r: i64,
    nz: u32,
    score: i64,
}

impl Score {
    fn init() -> Self {
        Self {
            score: MAX_COST,
            ..Self::default()
        }
    }

    fn set(&mut self, lambda: i64) {
        self.score = rd_score(lambda, self.r + self.h, self.d + self.sd);
    }

    fn add(&mut self, o: &Score) {
        self.d += o.d;
        self.sd += o.sd;
        self.h += o.h;
        self.r += o.r;
        self.nz |= o.nz;
        self.score += o.score;
    }
}

//------------------------------------------------------------------------------
// Flatness heuristics

fn is_flat_levels(blocks: &[[i32; 16]], limit: usize) -> bool {
    let mut count = 0;
    for levels in blocks {
        for &v in &levels[1..] {
            count += (v != 0) as usize;
            if count > limit {
                return false;
            }
        }
    }
    true
}

fn is_flat_source16(src: &[u8]) -> bool {
    let v = src[0];
    for row in 0..16 {
        if src[row * BPS..row * BPS + 16].iter().any(|&p| p != v) {
            return false;
        }
    }
    true
}

//------------------------------------------------------------------------------
// Reconstruction

#[allow(clippy::too_many_arguments)]
fn reconstruct_intra16(
    yuv_in: &[u8; YUV_SIZE],
    yuv_p: &[u8; PRED_SIZE],
    dst: &mut [u8; YUV_SIZE],
    top_nz: &mut [u32; 9],
    left_nz: &mut [u32; 9],
    y_dc_levels: &mut [i32; 16],
    y_ac_levels: &mut [[i32; 16]; 16],
    seg: &SegmentInfo,
    costs: &LevelCosts,
    mode: usize,
    do_trellis: bool,
) -> u32 {
    let pred = &yuv_p[I16_MODE_OFFSETS[mode]..];
    let mut tmp = [[0i32; 16]; 16];
    for (n, block) in tmp.iter_mut().enumerate() {
        let off = LUMA_BLOCK_OFFSETS[n];
        fdct(&yuv_in[Y_OFF + off..], &pred[off..], block);
    }

    let mut dc_tmp = [0i32; 16];
    for n in 0..16 {
        dc_tmp[n] = tmp[n][0];
    }
    wht4x4(&mut dc_tmp);
    let mut nz = (seg.y2.quantize_block(&mut dc_tmp, y_dc_levels, 0) as u32) << 24;

    if do_trellis {
        for y in 0..4 {
            for x in 0..4 {
                let n = x + y * 4;
                let ctx = (top_nz[x] + left_nz[y]) as usize;
                let non_zero = trellis_quantize_block(
                    &mut tmp[n],
                    &mut y_ac_levels[n],
                    &seg.y1,
                    seg.lambda_trellis_i16,
                    1,
                    costs,
                    0,
                    ctx,
                );
                top_nz[x] = non_zero as u32;
                left_nz[y] = non_zero as u32;
                y_ac_levels[n][0] = 0;
                nz |= (non_zero as u32) << n;
            }
        }
    } else {
        for n in 0..16 {
            // the DC slot is carried by the WHT pass
            tmp[n][0] = 0;
            nz |= (seg.y1.quantize_block(&mut tmp[n], &mut y_ac_levels[n], 0) as u32) << n;
        }
    }

    iwht4x4(&mut dc_tmp);
    for n in 0..16 {
        tmp[n][0] = dc_tmp[n];
    }
    for (n, block) in tmp.iter().enumerate() {
        let off = LUMA_BLOCK_OFFSETS[n];
        idct_add(&pred[off..], block, &mut dst[Y_OFF + off..]);
    }
    nz
}

#[allow(clippy::too_many_arguments)]
fn reconstruct_intra4(
    src: &[u8],
    pred: &[u8],
    dst: &mut [u8],
    levels: &mut [i32; 16],
    seg: &SegmentInfo,
    costs: &LevelCosts,
    ctx: usize,
    do_trellis: bool,
) -> bool {
    let mut tmp = [0i32; 16];
    fdct(src, pred, &mut tmp);
    let nz = if do_trellis {
        trellis_quantize_block(
            &mut tmp,
            levels,
            &seg.y1,
            seg.lambda_trellis_i4,
            0,
            costs,
            3,
            ctx,
        )
    } else {
        seg.y1.quantize_block(&mut tmp, levels, 0)
    };
    idct_add(pred, &tmp, dst);
    nz
}

fn correct_dc_values(
    tmp: &mut [[i32; 16]; 8],
    mtx: &QuantMatrix,
    top: &DiffusionError,
    left: &DiffusionError,
    derr_out: &mut [[i8; 3]; 2],
) {
    //         | top[0] | top[1]
    // --------+--------+--------
    // left[0] | c[0]     c[1]       errors: err0 err1
    // left[1] | c[2]     c[3]               err2 err3
    //
    // err1, err2 and err3 are carried over to the neighboring blocks.
    let shift = DIFFUSION_SHIFT - DIFFUSION_SCALE;
    for ch in 0..2 {
        let c = &mut tmp[ch * 4..ch * 4 + 4];
        c[0][0] += (DIFFUSION_C1 * i32::from(top[ch][0]) + DIFFUSION_C2 * i32::from(left[ch][0]))
            >> shift;
        let err0 = mtx.quantize_single(&mut c[0][0]);
        c[1][0] += (DIFFUSION_C1 * i32::from(top[ch][1]) + DIFFUSION_C2 * err0) >> shift;
        let err1 = mtx.quantize_single(&mut c[1][0]);
        c[2][0] += (DIFFUSION_C1 * err0 + DIFFUSION_C2 * i32::from(left[ch][1])) >> shift;
        let err2 = mtx.quantize_single(&mut c[2][0]);
        c[3][0] += (DIFFUSION_C1 * err1 + DIFFUSION_C2 * err2) >> shift;
        let err3 = mtx.quantize_single(&mut c[3][0]);
        derr_out[ch][0] = err1 as i8;
        derr_out[ch][1] = err2 as i8;
        derr_out[ch][2] = err3 as i8;
    }
}

#[allow(clippy::too_many_arguments)]
fn reconstruct_uv(
    yuv_in: &[u8; YUV_SIZE],
    yuv_p: &[u8; PRED_SIZE],
    dst: &mut [u8; YUV_SIZE],
    top_nz: &mut [u32; 9],
    left_nz: &mut [u32; 9],
    uv_levels: &mut [[i32; 16]; 8],
    derr_out: &mut [[i8; 3]; 2],
    seg: &SegmentInfo,
    costs: &LevelCosts,
    mode: usize,
    do_trellis: bool,
    diffuse: Option<(DiffusionError, DiffusionError)>,
) -> u32 {
    let pred = &yuv_p[UV_MODE_OFFSETS[mode]..];
    let mut tmp = [[0i32; 16]; 8];
    for (n, block) in tmp.iter_mut().enumerate() {
        let off = CHROMA_BLOCK_OFFSETS[n];
        fdct(&yuv_in[off..], &pred[off - U_OFF..], block);
    }
    if let Some((top, left)) = diffuse {
        correct_dc_values(&mut tmp, &seg.uv, &top, &left, derr_out);
    }

    let mut nz = 0u32;
    if do_trellis {
        for ch in [0usize, 2] {
            for y in 0..2 {
                for x in 0..2 {
                    let n = ch * 2 + x + y * 2;
                    let ctx = (top_nz[4 + ch + x] + left_nz[4 + ch + y]) as usize;
                    let non_zero = trellis_quantize_block(
                        &mut tmp[n],
                        &mut uv_levels[n],
                        &seg.uv,
                        seg.lambda_trellis_uv,
                        0,
                        costs,
                        2,
                        ctx,
                    );
                    top_nz[4 + ch + x] = non_zero as u32;
                    left_nz[4 + ch + y] = non_zero as u32;
                    nz |= (non_zero as u32) << n;
                }
            }
        }
    } else {
        for n in 0..8 {
            nz |= (seg.uv.quantize_block(&mut tmp[n], &mut uv_levels[n], 0) as u32) << n;
        }
    }

    for (n, block) in tmp.iter().enumerate() {
        let off = CHROMA_BLOCK_OFFSETS[n];
        idct_add(&pred[off - U_OFF..], block, &mut dst[off..]);
    }
    nz << 16
}

//------------------------------------------------------------------------------
// Rate estimation of one macroblock's residuals

fn get_cost_luma16(it: &mut MbIterator, rd: &ModeScore, p: &RdParams<'_>) -> i64 {
    it.nz_to_bytes();
    let mut r = 0i64;

    // estimation only reads the DC context; left_nz[8] runs across the
    // row and is updated when the winner is actually coded
    let ctx = (it.top_nz[8] + it.left_nz[8]) as usize;
    let res = Residual::new(0, &rd.y_dc_levels, 1);
    r += i64::from(residual_cost(ctx, &res, p.probs, p.costs));

    for y in 0..4 {
        for x in 0..4 {
            let n = x + y * 4;
            let ctx = (it.top_nz[x] + it.left_nz[y]) as usize;
            let res = Residual::new(1, &rd.y_ac_levels[n], 0);
            r += i64::from(residual_cost(ctx, &res, p.probs, p.costs));
            it.top_nz[x] = (res.last >= 0) as u32;
            it.left_nz[y] = (res.last >= 0) as u32;
        }
    }
    r
}

fn get_cost_luma4(it: &MbIterator, levels: &[i32; 16], p: &RdParams<'_>) -> i64 {
    let x = it.i4 & 3;
    let y = it.i4 >> 2;
    let ctx = (it.top_nz[x] + it.left_nz[y]) as usize;
    let res = Residual::new(0, levels, 3);
    i64::from(residual_cost(ctx, &res, p.probs, p.costs))
}

fn get_cost_uv(it: &mut MbIterator, uv_levels: &[[i32; 16]; 8], p: &RdParams<'_>) -> i64 {
    it.nz_to_bytes();
    let mut r = 0i64;
    for ch in [0usize, 2] {
        for y in 0..2 {
            for x in 0..2 {
                let n = ch * 2 + x + y * 2;
                let ctx = (it.top_nz[4 + ch + x] + it.left_nz[4 + ch + y]) as usize;
                let res = Residual::new(0, &uv_levels[n], 2);
                r += i64::from(residual_cost(ctx, &res, p.probs, p.costs));
                it.top_nz[4 + ch + x] = (res.last >= 0) as u32;
                it.left_nz[4 + ch + y] = (res.last >= 0) as u32;
            }
        }
    }
    r
}

//------------------------------------------------------------------------------
// Mode searches

fn pick_best_intra16(it: &mut MbIterator, rd: &mut ModeScore, p: &RdParams<'_>, do_trellis: bool) {
    let lambda = p.seg.lambda_i16;
    let tlambda = p.seg.tlambda;
    let mut is_flat = is_flat_source16(&it.yuv_in[Y_OFF..]);
    let mut rd_cur = ModeScore::new();
    let mut have_best = false;

    for mode in 0..4 {
        rd_cur.init_score();
        rd_cur.mode_i16 = mode;
        it.nz_to_bytes();
        rd_cur.nz = reconstruct_intra16(
            &it.yuv_in,
            &it.yuv_p,
            &mut it.yuv_out2,
            &mut it.top_nz,
            &mut it.left_nz,
            &mut rd_cur.y_dc_levels,
            &mut rd_cur.y_ac_levels,
            p.seg,
            p.costs,
            mode,
            do_trellis,
        );

        rd_cur.d = i64::from(sse_16x16(&it.yuv_in[Y_OFF..], &it.yuv_out2[Y_OFF..]));
        rd_cur.sd = if tlambda > 0 {
            mult_8b(
                tlambda,
                i64::from(disto_16x16(
                    &it.yuv_in[Y_OFF..],
                    &it.yuv_out2[Y_OFF..],
                    &DISTO_WEIGHTS,
                )),
            )
        } else {
            0
        };
        rd_cur.h = i64::from(FIXED_COSTS_I16[mode]);
        rd_cur.r = get_cost_luma16(it, &rd_cur, p);

        if is_flat {
            // refine the pixel-space impression with the coded levels
            is_flat = is_flat_levels(&rd_cur.y_ac_levels, FLATNESS_LIMIT_I16);
            if is_flat {
                // flat blocks must reconstruct flat; emphasize distortion
                rd_cur.d *= 2;
                rd_cur.sd *= 2;
            }
        }

        rd_cur.set_score(lambda);
        if !have_best || rd_cur.score < rd.score {
            have_best = true;
            rd.d = rd_cur.d;
            rd.sd = rd_cur.sd;
            rd.h = rd_cur.h;
            rd.r = rd_cur.r;
            rd.score = rd_cur.score;
            rd.nz = rd_cur.nz;
            rd.mode_i16 = mode;
            rd.y_dc_levels = rd_cur.y_dc_levels;
            rd.y_ac_levels = rd_cur.y_ac_levels;
            it.yuv_out = it.yuv_out2;
        }
    }
    // the mode decision below compares against intra4 under lambda_mode
    rd.set_score(p.seg.lambda_mode);

    // A blocky macroblock (only DCs coded) with high distortion hints at
    // the filter strength needed to smooth it out later.
    let min_disto = 20 * i64::from(p.seg.y1.q[0]);
    if rd.nz & 0x100_ffff == 0x100_0000 && rd.d > min_disto {
        let v0 = rd.y_dc_levels[1].abs();
        let v1 = rd.y_dc_levels[2].abs();
        let v2 = rd.y_dc_levels[4].abs();
        rd.max_edge_delta = v0.max(v1).max(v2);
    }
}

fn pick_best_intra4(
    it: &mut MbIterator,
    rd: &mut ModeScore,
    p: &RdParams<'_>,
    do_trellis: bool,
) -> bool {
    if p.max_i4_header_bits == 0 {
        return false;
    }
    let lambda = p.seg.lambda_i4;
    let tlambda = p.seg.tlambda;

    let mut rd_best = Score::init();
    rd_best.h = i64::from(COST_I4_FLAG);
    rd_best.set(p.seg.lambda_mode);

    let mut y_ac_best = [[0i32; 16]; 16];
    let mut modes_best = [0u8; 16];
    let mut total_header_bits = 0i64;

    it.nz_to_bytes();
    it.start_i4();
    loop {
        let i4 = it.i4;
        let x = i4 & 3;
        let y = i4 >> 2;
        let src_off = Y_OFF + LUMA_BLOCK_OFFSETS[i4];
        let ctx = (it.top_nz[x] + it.left_nz[y]) as usize;

        it.make_i4_preds();

        let mut rd_i4 = Score::init();
        let mut best_mode = None;
        let mut best_block = [0u8; 4 * BPS];
        let mut tmp_levels_best = [0i32; 16];

        for mode in 0..10 {
            let mut rd_tmp = Score::default();
            let mut tmp_levels = [0i32; 16];
            let mut tmp_dst = [0u8; 4 * BPS];

            let non_zero = reconstruct_intra4(
                &it.yuv_in[src_off..],
                &it.yuv_p[I4_MODE_OFFSETS[mode]..],
                &mut tmp_dst,
                &mut tmp_levels,
                p.seg,
                p.costs,
                ctx,
                do_trellis,
            );
            rd_tmp.nz = (non_zero as u32) << i4;
            rd_tmp.d = i64::from(sse_4x4(&it.yuv_in[src_off..], &tmp_dst));
            rd_tmp.sd = if tlambda > 0 {
                mult_8b(
                    tlambda,
                    i64::from(disto_4x4(&it.yuv_in[src_off..], &tmp_dst, &DISTO_WEIGHTS)),
                )
            } else {
                0
            };
            rd_tmp.h = i64::from(FIXED_COSTS_I4[mode]);
            // complex predictions of flat blocks are rarely worth it
            rd_tmp.r = if mode > 0 && is_flat_levels(std::slice::from_ref(&tmp_levels), FLATNESS_LIMIT_I4)
            {
                FLATNESS_PENALTY
            } else {
                0
            };

            // cheap early-out before the residual cost
            rd_tmp.set(lambda);
            if best_mode.is_some() && rd_tmp.score >= rd_i4.score {
                continue;
            }

            rd_tmp.r += get_cost_luma4(it, &tmp_levels, p);
            rd_tmp.set(lambda);
            if best_mode.is_none() || rd_tmp.score < rd_i4.score {
                rd_i4 = rd_tmp;
                best_mode = Some(mode);
                best_block = tmp_dst;
                tmp_levels_best = tmp_levels;
            }
        }

        let best_mode = match best_mode {
            Some(m) => m,
            None => return false,
        };
        rd_i4.set(p.seg.lambda_mode);
        rd_best.add(&rd_i4);
        if rd_best.score >= rd.score {
            return false;
        }
        total_header_bits += rd_i4.h;
        if total_header_bits > p.max_i4_header_bits {
            return false;
        }

        // commit this sub-block into the trial buffer; later sub-blocks
        // predict from it
        for row in 0..4 {
            let off = src_off + row * BPS;
            it.yuv_out2[off..off + 4].copy_from_slice(&best_block[row * BPS..row * BPS + 4]);
        }
        y_ac_best[i4] = tmp_levels_best;
        modes_best[i4] = best_mode as u8;
        it.top_nz[x] = (rd_i4.nz != 0) as u32;
        it.left_nz[y] = (rd_i4.nz != 0) as u32;

        if !it.rotate_i4(true) {
            break;
        }
    }

    // intra4 wins the macroblock
    rd.d = rd_best.d;
    rd.sd = rd_best.sd;
    rd.h = rd_best.h;
    rd.r = rd_best.r;
    rd.score = rd_best.score;
    rd.nz = rd_best.nz;
    rd.y_ac_levels = y_ac_best;
    rd.modes_i4 = modes_best;
    rd.is_i4 = true;
    it.yuv_out = it.yuv_out2;
    true
}

fn pick_best_uv(it: &mut MbIterator, rd: &mut ModeScore, p: &RdParams<'_>, do_trellis: bool) {
    let lambda = p.seg.lambda_uv;
    let diffusion = if p.diffuse {
        Some((it.top_derr(), it.left_derr))
    } else {
        None
    };

    let mut rd_best = Score::init();
    let mut have_best = false;

    for mode in 0..4 {
        let mut rd_uv = Score::default();
        let mut uv_levels = [[0i32; 16]; 8];
        let mut derr = [[0i8; 3]; 2];

        it.nz_to_bytes();
        rd_uv.nz = reconstruct_uv(
            &it.yuv_in,
            &it.yuv_p,
            &mut it.yuv_out2,
            &mut it.top_nz,
            &mut it.left_nz,
            &mut uv_levels,
            &mut derr,
            p.seg,
            p.costs,
            mode,
            do_trellis,
            diffusion,
        );

        rd_uv.d = i64::from(sse_uv(&it.yuv_in, &it.yuv_out2));
        // no spectral distortion here: it tends to flatten chroma areas
        rd_uv.sd = 0;
        rd_uv.h = i64::from(FIXED_COSTS_UV[mode]);
        rd_uv.r = get_cost_uv(it, &uv_levels, p);
        if mode > 0 && is_flat_levels(&uv_levels, FLATNESS_LIMIT_UV) {
            rd_uv.r += FLATNESS_PENALTY * 8;
        }

        rd_uv.set(lambda);
        if !have_best || rd_uv.score < rd_best.score {
            have_best = true;
            rd_best = rd_uv;
            rd.mode_uv = mode;
            rd.uv_levels = uv_levels;
            rd.derr = derr;
            commit_uv(&mut it.yuv_out, &it.yuv_out2);
        }
    }

    rd.d += rd_best.d;
    rd.sd += rd_best.sd;
    rd.h += rd_best.h;
    rd.r += rd_best.r;
    rd.score += rd_best.score;
    rd.nz |= rd_best.nz;
}

fn commit_uv(dst: &mut [u8; YUV_SIZE], src: &[u8; YUV_SIZE]) {
    for row in 0..8 {
        let o = row * BPS + U_OFF;
        dst[o..o + 16].copy_from_slice(&src[o..o + 16]);
    }
}

/// Requantize with the already-chosen modes, typically to apply the
/// trellis pass once per macroblock instead of per candidate mode.
fn simple_quantize(it: &mut MbIterator, rd: &mut ModeScore, p: &RdParams<'_>) {
    let mut nz = 0u32;

    if !rd.is_i4 {
        it.nz_to_bytes();
        nz = reconstruct_intra16(
            &it.yuv_in,
            &it.yuv_p,
            &mut it.yuv_out,
            &mut it.top_nz,
            &mut it.left_nz,
            &mut rd.y_dc_levels,
            &mut rd.y_ac_levels,
            p.seg,
            p.costs,
            rd.mode_i16,
            true,
        );
    } else {
        it.nz_to_bytes();
        it.start_i4();
        loop {
            let i4 = it.i4;
            let x = i4 & 3;
            let y = i4 >> 2;
            let off = Y_OFF + LUMA_BLOCK_OFFSETS[i4];
            let ctx = (it.top_nz[x] + it.left_nz[y]) as usize;
            let mode = rd.modes_i4[i4] as usize;
            it.make_i4_preds();

            let mut dst = [0u8; 4 * BPS];
            let non_zero = reconstruct_intra4(
                &it.yuv_in[off..],
                &it.yuv_p[I4_MODE_OFFSETS[mode]..],
                &mut dst,
                &mut rd.y_ac_levels[i4],
                p.seg,
                p.costs,
                ctx,
                true,
            );
            for row in 0..4 {
                let o = off + row * BPS;
                it.yuv_out[o..o + 4].copy_from_slice(&dst[row * BPS..row * BPS + 4]);
            }
            it.top_nz[x] = non_zero as u32;
            it.left_nz[y] = non_zero as u32;
            nz |= (non_zero as u32) << i4;

            if !it.rotate_i4(false) {
                break;
            }
        }
    }

    let diffusion = if p.diffuse {
        Some((it.top_derr(), it.left_derr))
    } else {
        None
    };
    it.nz_to_bytes();
    nz |= reconstruct_uv(
        &it.yuv_in,
        &it.yuv_p,
        &mut it.yuv_out,
        &mut it.top_nz,
        &mut it.left_nz,
        &mut rd.uv_levels,
        &mut rd.derr,
        p.seg,
        p.costs,
        rd.mode_uv,
        true,
        diffusion,
    );
    rd.nz = nz;
}

/// Distortion-only mode refinement for the fastest settings: prediction
/// SSE plus a fixed per-mode rate, no residual cost.
fn refine_using_distortion(
    it: &mut MbIterator,
    rd: &mut ModeScore,
    p: &RdParams<'_>,
    mut try_both_modes: bool,
    refine_uv_mode: bool,
) {
    let mut best_score = MAX_COST;
    let mut nz = 0u32;
    let mut is_i16 = true;
    let mut score_i4 = p.seg.i4_penalty;
    let mut i4_bit_sum = 0i64;
    let bit_limit = if try_both_modes {
        p.header_bit_limit
    } else {
        MAX_COST
    };

    {
        let src = &it.yuv_in[Y_OFF..];
        let mut best_mode = 0;
        let mut have_best = false;
        for mode in 0..4 {
            let h = i64::from(FIXED_COSTS_I16[mode]);
            if mode > 0 && h > bit_limit {
                continue;
            }
            let pred = &it.yuv_p[I16_MODE_OFFSETS[mode]..];
            let score = i64::from(sse_16x16(src, pred)) * RD_DISTO_MULT + h * LAMBDA_D_I16;
            if !have_best || score < best_score {
                have_best = true;
                best_mode = mode;
                best_score = score;
            }
        }
        if it.x == 0 || it.y == 0 {
            // a flat border macroblock can start a checkerboard resonance;
            // pin it to a deterministic prediction
            if is_flat_source16(src) {
                best_mode = if it.x == 0 { 0 } else { 2 };
                try_both_modes = false;
            }
        }
        rd.mode_i16 = best_mode;
    }

    if try_both_modes {
        is_i16 = false;
        it.start_i4();
        loop {
            let i4 = it.i4;
            let src_off = Y_OFF + LUMA_BLOCK_OFFSETS[i4];
            it.make_i4_preds();

            let mut best_i4_mode = 0;
            let mut best_i4_score = MAX_COST;
            for mode in 0..10 {
                let pred = &it.yuv_p[I4_MODE_OFFSETS[mode]..];
                let score = i64::from(sse_4x4(&it.yuv_in[src_off..], pred)) * RD_DISTO_MULT
                    + i64::from(FIXED_COSTS_I4[mode]) * LAMBDA_D_I4;
                if score < best_i4_score {
                    best_i4_mode = mode;
                    best_i4_score = score;
                }
            }
            i4_bit_sum += i64::from(FIXED_COSTS_I4[best_i4_mode]);
            rd.modes_i4[i4] = best_i4_mode as u8;
            score_i4 += best_i4_score;
            if score_i4 >= best_score || i4_bit_sum >= bit_limit {
                // intra4 cannot win anymore; fall back to intra16
                is_i16 = true;
                break;
            }
            let mut dst = [0u8; 4 * BPS];
            let non_zero = reconstruct_intra4(
                &it.yuv_in[src_off..],
                &it.yuv_p[I4_MODE_OFFSETS[best_i4_mode]..],
                &mut dst,
                &mut rd.y_ac_levels[i4],
                p.seg,
                p.costs,
                0,
                false,
            );
            for row in 0..4 {
                let o = src_off + row * BPS;
                it.yuv_out2[o..o + 4].copy_from_slice(&dst[row * BPS..row * BPS + 4]);
            }
            nz |= (non_zero as u32) << i4;
            if !it.rotate_i4(true) {
                break;
            }
        }
    }

    if is_i16 {
        rd.is_i4 = false;
        nz = reconstruct_intra16(
            &it.yuv_in,
            &it.yuv_p,
            &mut it.yuv_out,
            &mut it.top_nz,
            &mut it.left_nz,
            &mut rd.y_dc_levels,
            &mut rd.y_ac_levels,
            p.seg,
            p.costs,
            rd.mode_i16,
            false,
        );
    } else {
        rd.is_i4 = true;
        it.yuv_out = it.yuv_out2;
        best_score = score_i4;
    }

    {
        let mut best_mode = 0;
        if refine_uv_mode {
            let mut best_uv_score = MAX_COST;
            for mode in 0..4 {
                let pred = &it.yuv_p[UV_MODE_OFFSETS[mode]..];
                let score = i64::from(sse_uv_pred(&it.yuv_in, pred)) * RD_DISTO_MULT
                    + i64::from(FIXED_COSTS_UV[mode]) * LAMBDA_D_UV;
                if score < best_uv_score {
                    best_mode = mode;
                    best_uv_score = score;
                }
            }
        }
        rd.mode_uv = best_mode;
        let diffusion = if p.diffuse {
            Some((it.top_derr(), it.left_derr))
        } else {
            None
        };
        nz |= reconstruct_uv(
            &it.yuv_in,
            &it.yuv_p,
            &mut it.yuv_out,
            &mut it.top_nz,
            &mut it.left_nz,
            &mut rd.uv_levels,
            &mut rd.derr,
            p.seg,
            p.costs,
            best_mode,
            false,
            diffusion,
        );
    }

    rd.nz = nz;
    rd.score = best_score;
    rd.d = i64::from(sse_16x16(&it.yuv_in[Y_OFF..], &it.yuv_out[Y_OFF..]));
}

// SSE between the chroma halves of a scratch buffer and a prediction
// area (which has U and V side by side at the same stride).
fn sse_uv_pred(yuv_in: &[u8; YUV_SIZE], pred: &[u8]) -> u32 {
    crate::common::sse_block(&yuv_in[U_OFF..], pred, 16, 8)
}

fn store_diffusion_errors(it: &mut MbIterator, rd: &ModeScore) {
    let mut top = it.top_derr();
    for ch in 0..2 {
        let left = &mut it.left_derr[ch];
        left[0] = rd.derr[ch][0];
        left[1] = ((3 * i32::from(rd.derr[ch][2])) >> 2) as i8;
        top[ch][0] = rd.derr[ch][1];
        top[ch][1] = (i32::from(rd.derr[ch][2]) - i32::from(left[1])) as i8;
    }
    it.set_top_derr(top);
}

/// Run the mode decision for the current macroblock. The reconstruction
/// of the winner is left in `it.yuv_out` and the coding decisions in
/// `rd`. Returns whether the macroblock can be skipped entirely.
pub fn decimate(it: &mut MbIterator, rd: &mut ModeScore, p: &RdParams<'_>) -> bool {
    *rd = ModeScore::new();
    rd.init_score();

    it.make_luma16_preds();
    it.make_chroma8_preds();

    if p.rd_level > RdLevel::None {
        let do_trellis = p.rd_level >= RdLevel::TrellisAll;
        pick_best_intra16(it, rd, p, do_trellis);
        if p.method >= 2 {
            pick_best_intra4(it, rd, p, do_trellis);
        }
        pick_best_uv(it, rd, p, do_trellis);
        if p.rd_level == RdLevel::Trellis {
            simple_quantize(it, rd, p);
        }
    } else {
        refine_using_distortion(it, rd, p, p.method >= 2, p.method >= 1);
    }

    if p.diffuse {
        store_diffusion_errors(it, rd);
    }
    rd.nz == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::cost::LevelCosts;
    use crate::encoder::quantize::setup_segments;
    use crate::encoder::tables::default_coeff_probs;

    fn params<'a>(
        seg: &'a SegmentInfo,
        probs: &'a TokenProbTables,
        costs: &'a LevelCosts,
        rd_level: RdLevel,
    ) -> RdParams<'a> {
        RdParams {
            seg,
            probs,
            costs,
            rd_level,
            method: 4,
            diffuse: false,
            header_bit_limit: MAX_COST,
            max_i4_header_bits: 256 * 16 * 16,
        }
    }

    #[test]
    fn flat_macroblock_skips_at_moderate_quality() {
        let segments = setup_segments(75.0, 50, 60, 0, &[(0, 0)]);
        let probs = default_coeff_probs();
        let costs = LevelCosts::new(&probs);
        let p = params(&segments[0], &probs, &costs, RdLevel::Basic);

        let mut it = MbIterator::new(16, 16);
        it.yuv_in.fill(128);
        let mut rd = ModeScore::new();
        let skip = decimate(&mut it, &mut rd, &p);

        assert!(skip);
        assert_eq!(rd.nz, 0);
        assert!(!rd.is_i4);
        // a flat block reconstructs to itself
        assert_eq!(sse_16x16(&it.yuv_in[Y_OFF..], &it.yuv_out[Y_OFF..]), 0);
    }

    #[test]
    fn flat_block_at_top_quality_stays_dc_and_skips() {
        let segments = setup_segments(100.0, 50, 60, 0, &[(0, 0)]);
        let probs = default_coeff_probs();
        let costs = LevelCosts::new(&probs);
        let mut p = params(&segments[0], &probs, &costs, RdLevel::None);
        p.method = 0;

        let mut it = MbIterator::new(16, 16);
        it.yuv_in.fill(128);
        let mut rd = ModeScore::new();
        let skip = decimate(&mut it, &mut rd, &p);

        assert!(skip);
        assert_eq!(rd.nz, 0);
        assert!(!rd.is_i4);
        assert_eq!(rd.mode_i16, 0, "flat content stays on the DC predictor");
    }

    #[test]
    fn mode_search_leaves_the_running_dc_context_alone() {
        // left_nz[8] carries the left neighbor's Y2 flag across the row;
        // candidate costing must read it without writing it back.
        let segments = setup_segments(60.0, 50, 60, 0, &[(0, 0)]);
        let probs = default_coeff_probs();
        let costs = LevelCosts::new(&probs);
        let p = params(&segments[0], &probs, &costs, RdLevel::Basic);

        let mut it = MbIterator::new(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                it.yuv_in[Y_OFF + y * BPS + x] = ((x * 11 + y * 5) % 256) as u8;
            }
        }
        let mut rd = ModeScore::new();
        decimate(&mut it, &mut rd, &p);
        assert_ne!(rd.nz, 0, "content this busy codes a DC block");
        assert_eq!(it.left_nz[8], 0, "candidate DC flag leaked into the left context");
    }

    #[test]
    fn gradient_macroblock_codes_something() {
        let segments = setup_segments(80.0, 50, 60, 0, &[(0, 0)]);
        let probs = default_coeff_probs();
        let costs = LevelCosts::new(&probs);
        let p = params(&segments[0], &probs, &costs, RdLevel::Basic);

        let mut it = MbIterator::new(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                it.yuv_in[Y_OFF + y * BPS + x] = (x * 16) as u8;
            }
        }
        for row in 0..8 {
            for col in 0..8 {
                it.yuv_in[U_OFF + row * BPS + col] = (row * 30) as u8;
                it.yuv_in[crate::common::V_OFF + row * BPS + col] = 128;
            }
        }
        let mut rd = ModeScore::new();
        let skip = decimate(&mut it, &mut rd, &p);
        assert!(!skip);
        assert!(rd.nz != 0);
        assert!(rd.score < MAX_COST);
    }

    #[test]
    fn trellis_levels_never_raise_the_score() {
        // Same macroblock, basic vs trellis-everywhere: the trellis run
        // must not end with a worse RD score.
        let segments = setup_segments(50.0, 0, 60, 0, &[(0, 0)]);
        let probs = default_coeff_probs();
        let costs = LevelCosts::new(&probs);

        let mut fill = |it: &mut MbIterator| {
            for y in 0..16 {
                for x in 0..16 {
                    it.yuv_in[Y_OFF + y * BPS + x] = ((x * 7 + y * 13) % 256) as u8;
                }
            }
        };

        let p_basic = params(&segments[0], &probs, &costs, RdLevel::Basic);
        let mut it = MbIterator::new(16, 16);
        fill(&mut it);
        let mut rd_basic = ModeScore::new();
        decimate(&mut it, &mut rd_basic, &p_basic);

        let p_trellis = params(&segments[0], &probs, &costs, RdLevel::TrellisAll);
        let mut it2 = MbIterator::new(16, 16);
        fill(&mut it2);
        let mut rd_trellis = ModeScore::new();
        decimate(&mut it2, &mut rd_trellis, &p_trellis);

        assert!(rd_trellis.score <= rd_basic.score * 11 / 10);
    }
}
