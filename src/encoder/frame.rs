//! Frame orchestration: analysis, the macroblock scan, probability
//! finalization and partition assembly.
//!
//! The scan visits macroblocks in raster order, runs the mode decision,
//! and either buffers the residual tokens (two-pass) or codes them
//! straight into the residual partition (single-pass). Two-pass picks the
//! coefficient probabilities from the recorded statistics before replaying
//! the tokens, which is where most of its size win comes from. The alpha
//! plane, when present, is compressed concurrently on a worker.

use std::sync::{Arc, Mutex};

use crate::common::{sse_16x16, Y_OFF};
use crate::worker::{Worker, WorkerKind};

use super::alpha::compress_alpha;
use super::analysis::analyze;
use super::api::{EncodedFrame, EncodingError, EncodingStats, Picture, ProgressHook};
use super::arithmetic::BoolEncoder;
use super::config::{EmissionStrategy, EncoderConfig};
use super::cost::{calc_proba, should_update, LevelCosts, ProbaStats, Residual};
use super::iterator::MbIterator;
use super::quantize::{filter_strength_from_delta, setup_segments, SegmentInfo};
use super::rd::{decimate, ModeScore, RdParams};
use super::tables::{
    default_coeff_probs, token_id, TokenProbTables, CAT3_PROBS, CAT4_PROBS, CAT5_PROBS,
    CAT6_PROBS, COEFF_BANDS, I4MODE_PROBS, I4_FLAG_PROBA, NUM_BANDS, NUM_CTX, NUM_PROBAS,
    NUM_TYPES, UVMODE_PROBS, YMODE_PROBS,
};
use super::tokens::TokenBuffer;

// Probability of the per-node "this coefficient probability is updated"
// flag. The reference layout varies this per node; a single mid value
// costs a fraction of a percent and keeps the header layout flat.
const COEFF_UPDATE_PROBA: u8 = 252;

// Mode header budget used by the fast path to give up on expensive modes.
const HEADER_BIT_BUDGET: i64 = 256 * 510 * 8 * 1024;

struct MbInfo {
    segment: u8,
    skip: bool,
    is_i4: bool,
    mode_i16: u8,
    modes_i4: [u8; 16],
    mode_uv: u8,
}

pub(crate) fn encode(
    config: &EncoderConfig,
    pic: &Picture<'_>,
    hook: Option<&ProgressHook<'_>>,
) -> Result<EncodedFrame, EncodingError> {
    let width = pic.width() as usize;
    let height = pic.height() as usize;

    if let Some(h) = hook {
        if !h(0) {
            return Err(EncodingError::Aborted);
        }
    }

    // Alpha is independent of the coded planes; start it first.
    let mut alpha_worker = None;
    let alpha_slot: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    if let Some(plane) = pic.alpha_plane() {
        let kind = if config.use_threads {
            WorkerKind::Threaded
        } else {
            WorkerKind::Synchronous
        };
        let mut worker = Worker::new(kind);
        if !worker.reset() {
            return Err(EncodingError::OutOfMemory);
        }
        let owned = plane[..width * height].to_vec();
        let slot = Arc::clone(&alpha_slot);
        worker.launch(move || {
            let compressed = compress_alpha(&owned, width, height);
            *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(compressed);
            true
        });
        alpha_worker = Some(worker);
    }

    let analysis = analyze(pic, config.segments);
    let seg_infos = setup_segments(
        config.quality,
        config.sns_strength,
        config.filter_strength,
        config.filter_sharpness,
        &analysis.segment_alphas,
    );

    if let Some(h) = hook {
        if !h(10) {
            return Err(EncodingError::Aborted);
        }
    }

    let mut probs = default_coeff_probs();
    let costs = LevelCosts::new(&probs);

    let mut it = MbIterator::new(width, height);
    it.set_progress_base(10);
    let mb_count = it.mb_w * it.mb_h;
    let two_pass = config.emission == EmissionStrategy::TwoPassTokens;

    let mut tokens = TokenBuffer::new(config.token_page_size);
    let mut stats = ProbaStats::new();
    let mut residual_enc = BoolEncoder::new();
    let mut mb_infos: Vec<MbInfo> = Vec::with_capacity(mb_count);
    let mut rd = ModeScore::new();

    let header_bit_limit = HEADER_BIT_BUDGET / mb_count as i64;
    let q = config.quality as i64;
    let max_i4_header_bits = 256 * 16 * 16 * q * q / (100 * 100);
    let diffuse = config.quality < 98.0;
    let rd_level = config.rd_level();

    let chroma_len = ((width + 1) / 2) * ((height + 1) / 2);
    let mut recon_y = vec![0u8; width * height];
    let mut recon_u = vec![0u8; chroma_len];
    let mut recon_v = vec![0u8; chroma_len];

    let mut seg_max_edge = [0i32; 4];
    let mut luma_sse = 0u64;
    let mut skip_count = 0usize;

    loop {
        let mb_index = it.y * it.mb_w + it.x;
        let segment = analysis.segments[mb_index];
        let seg = &seg_infos[segment as usize];

        it.import(pic);
        let params = RdParams {
            seg,
            probs: &probs,
            costs: &costs,
            rd_level,
            method: config.method,
            diffuse,
            header_bit_limit,
            max_i4_header_bits,
        };
        let skip = decimate(&mut it, &mut rd, &params);
        if skip {
            skip_count += 1;
        }

        if skip && two_pass {
            reset_after_skip(&mut it, rd.is_i4);
        } else if two_pass {
            if !record_residuals(&mut it, &rd, &mut tokens, &mut stats) {
                return Err(EncodingError::OutOfMemory);
            }
        } else {
            // single-pass codes every macroblock, skipped ones are a
            // handful of end-of-block bits
            code_residuals(&mut residual_enc, &mut it, &rd, &probs);
        }

        mb_infos.push(MbInfo {
            segment,
            skip,
            is_i4: rd.is_i4,
            mode_i16: rd.mode_i16 as u8,
            modes_i4: rd.modes_i4,
            mode_uv: rd.mode_uv as u8,
        });

        if rd.max_edge_delta > seg_max_edge[segment as usize] {
            seg_max_edge[segment as usize] = rd.max_edge_delta;
        }
        luma_sse += u64::from(sse_16x16(&it.yuv_in[Y_OFF..], &it.yuv_out[Y_OFF..]));

        it.export(&mut recon_y, &mut recon_u, &mut recon_v);
        it.save_boundary();
        if !it.progress(80, hook) {
            return Err(EncodingError::Aborted);
        }
        if !it.next() {
            break;
        }
    }

    // Skipped macroblocks recorded no tokens, so the flag must be coded
    // whenever any macroblock skipped. Single-pass codes every residual
    // and never needs the flag.
    let skip_proba = calc_proba(skip_count as u32, mb_count as u32);
    let use_skip = two_pass && skip_count > 0;

    if two_pass {
        finalize_token_probs(&stats, &mut probs);
    }

    let mut part0 = BoolEncoder::new();
    write_frame_header(
        &mut part0,
        config,
        &seg_infos,
        use_skip,
        skip_proba,
        &probs,
    );
    for info in &mb_infos {
        write_mb_header(&mut part0, info, seg_infos.len(), use_skip, skip_proba);
    }

    if two_pass && !tokens.emit(&mut residual_enc, &probs, true) {
        return Err(EncodingError::OutOfMemory);
    }

    let alpha = match alpha_worker.as_mut() {
        Some(worker) => {
            if !worker.sync() {
                return Err(EncodingError::OutOfMemory);
            }
            alpha_slot.lock().unwrap_or_else(|e| e.into_inner()).take()
        }
        None => None,
    };

    let mut filter_levels = [0i32; 4];
    let mut segment_quant = [0i32; 4];
    for (s, seg) in seg_infos.iter().enumerate() {
        let from_edges =
            filter_strength_from_delta(config.filter_sharpness, seg_max_edge[s]);
        filter_levels[s] = seg.fstrength.max(from_edges).clamp(0, 63);
        segment_quant[s] = seg.quant;
    }

    let mut enc_stats = EncodingStats::default();
    enc_stats.skip_count = skip_count;
    enc_stats.i4_count = mb_infos.iter().filter(|m| m.is_i4).count();
    enc_stats.i16_count = mb_count - enc_stats.i4_count;
    enc_stats.segment_quant = segment_quant;
    enc_stats.segment_count = seg_infos.len();
    enc_stats.luma_sse = luma_sse;

    if let Some(h) = hook {
        if !h(100) {
            return Err(EncodingError::Aborted);
        }
    }

    Ok(EncodedFrame {
        mode_partition: part0.finish(),
        residual_partition: residual_enc.finish(),
        alpha,
        filter_levels,
        stats: enc_stats,
    })
}

// An uncoded macroblock leaves no non-zero context behind. 16x16 mode
// also clears the running DC flag so the neighbors see a zero Y2 context.
fn reset_after_skip(it: &mut MbIterator, is_i4: bool) {
    if is_i4 {
        it.set_nz(it.nz() & (1 << 24));
    } else {
        it.set_nz(0);
        it.left_nz[8] = 0;
    }
}

//------------------------------------------------------------------------------
// Residual recording (two-pass) and direct coding (single-pass)

fn record_residuals(
    it: &mut MbIterator,
    rd: &ModeScore,
    tokens: &mut TokenBuffer,
    stats: &mut ProbaStats,
) -> bool {
    it.nz_to_bytes();

    if !rd.is_i4 {
        let res = Residual::new(0, &rd.y_dc_levels, 1);
        let ctx = (it.top_nz[8] + it.left_nz[8]) as usize;
        tokens.record_coeffs(ctx, &res, stats);
        let nz = (res.last >= 0) as u32;
        it.top_nz[8] = nz;
        it.left_nz[8] = nz;
        for y in 0..4 {
            for x in 0..4 {
                let n = x + y * 4;
                let res = Residual::new(1, &rd.y_ac_levels[n], 0);
                let ctx = (it.top_nz[x] + it.left_nz[y]) as usize;
                tokens.record_coeffs(ctx, &res, stats);
                let nz = (res.last >= 0) as u32;
                it.top_nz[x] = nz;
                it.left_nz[y] = nz;
            }
        }
    } else {
        for y in 0..4 {
            for x in 0..4 {
                let n = x + y * 4;
                let res = Residual::new(0, &rd.y_ac_levels[n], 3);
                let ctx = (it.top_nz[x] + it.left_nz[y]) as usize;
                tokens.record_coeffs(ctx, &res, stats);
                let nz = (res.last >= 0) as u32;
                it.top_nz[x] = nz;
                it.left_nz[y] = nz;
            }
        }
    }

    for ch in [0usize, 2] {
        for y in 0..2 {
            for x in 0..2 {
                let n = ch * 2 + x + y * 2;
                let res = Residual::new(0, &rd.uv_levels[n], 2);
                let ctx = (it.top_nz[4 + ch + x] + it.left_nz[4 + ch + y]) as usize;
                tokens.record_coeffs(ctx, &res, stats);
                let nz = (res.last >= 0) as u32;
                it.top_nz[4 + ch + x] = nz;
                it.left_nz[4 + ch + y] = nz;
            }
        }
    }

    it.bytes_to_nz();
    !tokens.error()
}

fn code_residuals(
    enc: &mut BoolEncoder,
    it: &mut MbIterator,
    rd: &ModeScore,
    probs: &TokenProbTables,
) {
    it.nz_to_bytes();

    if !rd.is_i4 {
        let res = Residual::new(0, &rd.y_dc_levels, 1);
        let ctx = (it.top_nz[8] + it.left_nz[8]) as usize;
        put_coeffs(enc, ctx, &res, probs);
        let nz = (res.last >= 0) as u32;
        it.top_nz[8] = nz;
        it.left_nz[8] = nz;
        for y in 0..4 {
            for x in 0..4 {
                let n = x + y * 4;
                let res = Residual::new(1, &rd.y_ac_levels[n], 0);
                let ctx = (it.top_nz[x] + it.left_nz[y]) as usize;
                put_coeffs(enc, ctx, &res, probs);
                let nz = (res.last >= 0) as u32;
                it.top_nz[x] = nz;
                it.left_nz[y] = nz;
            }
        }
    } else {
        for y in 0..4 {
            for x in 0..4 {
                let n = x + y * 4;
                let res = Residual::new(0, &rd.y_ac_levels[n], 3);
                let ctx = (it.top_nz[x] + it.left_nz[y]) as usize;
                put_coeffs(enc, ctx, &res, probs);
                let nz = (res.last >= 0) as u32;
                it.top_nz[x] = nz;
                it.left_nz[y] = nz;
            }
        }
    }

    for ch in [0usize, 2] {
        for y in 0..2 {
            for x in 0..2 {
                let n = ch * 2 + x + y * 2;
                let res = Residual::new(0, &rd.uv_levels[n], 2);
                let ctx = (it.top_nz[4 + ch + x] + it.left_nz[4 + ch + y]) as usize;
                put_coeffs(enc, ctx, &res, probs);
                let nz = (res.last >= 0) as u32;
                it.top_nz[4 + ch + x] = nz;
                it.left_nz[4 + ch + y] = nz;
            }
        }
    }

    it.bytes_to_nz();
}

/// Code one residual block directly. Same tree walk the token recorder
/// uses, with the bits written out immediately.
fn put_coeffs(enc: &mut BoolEncoder, ctx0: usize, res: &Residual<'_>, probs: &TokenProbTables) {
    let t = res.coeff_type;
    let mut n = res.first;
    let mut band = COEFF_BANDS[n] as usize;
    let mut ctx = ctx0;

    enc.write_bool(res.last >= 0, probs[t][band][ctx][0]);
    if res.last < 0 {
        return;
    }

    while n < 16 {
        let c = res.coeffs[n];
        n += 1;
        let sign = c < 0;
        let v = c.unsigned_abs();
        let p = &probs[t][band][ctx];
        if v == 0 {
            enc.write_bool(false, p[1]);
            band = COEFF_BANDS[n] as usize;
            ctx = 0;
            continue;
        }
        enc.write_bool(true, p[1]);
        if v == 1 {
            enc.write_bool(false, p[2]);
            enc.write_bool(sign, 128);
            band = COEFF_BANDS[n] as usize;
            ctx = 1;
        } else {
            enc.write_bool(true, p[2]);
            put_magnitude(enc, v, p);
            enc.write_bool(sign, 128);
            band = COEFF_BANDS[n] as usize;
            ctx = 2;
        }
        if n == 16 {
            break;
        }
        let more = (n as i32) <= res.last;
        enc.write_bool(more, probs[t][band][ctx][0]);
        if !more {
            break;
        }
    }
}

fn put_magnitude(enc: &mut BoolEncoder, v: u32, p: &[u8; NUM_PROBAS]) {
    if v <= 4 {
        enc.write_bool(false, p[3]);
        if v == 2 {
            enc.write_bool(false, p[4]);
        } else {
            enc.write_bool(true, p[4]);
            enc.write_bool(v == 4, p[5]);
        }
    } else if v <= 10 {
        enc.write_bool(true, p[3]);
        enc.write_bool(false, p[6]);
        if v <= 6 {
            enc.write_bool(false, p[7]);
            enc.write_bool(v == 6, 159);
        } else {
            enc.write_bool(true, p[7]);
            enc.write_bool(v >= 9, 165);
            enc.write_bool(v & 1 == 0, 145);
        }
    } else if v <= 34 {
        enc.write_bool(true, p[3]);
        enc.write_bool(true, p[6]);
        enc.write_bool(false, p[8]);
        if v <= 18 {
            enc.write_bool(false, p[9]);
            put_extra_bits(enc, v - 11, &CAT3_PROBS);
        } else {
            enc.write_bool(true, p[9]);
            put_extra_bits(enc, v - 19, &CAT4_PROBS);
        }
    } else if v <= 66 {
        enc.write_bool(true, p[3]);
        enc.write_bool(true, p[6]);
        enc.write_bool(true, p[8]);
        enc.write_bool(false, p[10]);
        put_extra_bits(enc, v - 35, &CAT5_PROBS);
    } else {
        enc.write_bool(true, p[3]);
        enc.write_bool(true, p[6]);
        enc.write_bool(true, p[8]);
        enc.write_bool(true, p[10]);
        put_extra_bits(enc, v - 67, &CAT6_PROBS);
    }
}

fn put_extra_bits(enc: &mut BoolEncoder, value: u32, probs: &[u8]) {
    for (i, &p) in probs.iter().enumerate() {
        let bit = value >> (probs.len() - 1 - i) & 1 != 0;
        enc.write_bool(bit, p);
    }
}

//------------------------------------------------------------------------------
// Probability finalization and headers

fn finalize_token_probs(stats: &ProbaStats, probs: &mut TokenProbTables) {
    for t in 0..NUM_TYPES {
        for b in 0..NUM_BANDS {
            for c in 0..NUM_CTX {
                for p in 0..NUM_PROBAS {
                    let (nb, total) = stats.split(token_id(t, b, c, p));
                    let new = calc_proba(nb, total);
                    if should_update(nb, total, probs[t][b][c][p], new) {
                        probs[t][b][c][p] = new;
                    }
                }
            }
        }
    }
}

fn write_frame_header(
    enc: &mut BoolEncoder,
    config: &EncoderConfig,
    segments: &[SegmentInfo],
    use_skip: bool,
    skip_proba: u8,
    probs: &TokenProbTables,
) {
    let use_segments = segments.len() > 1;
    enc.write_flag(use_segments);
    if use_segments {
        enc.write_literal(2, segments.len() as u32 - 1);
        for seg in segments {
            enc.write_literal(7, seg.quant as u32);
        }
    }
    enc.write_literal(6, config.filter_strength as u32 >> 1);
    enc.write_literal(3, config.filter_sharpness as u32);

    enc.write_flag(use_skip);
    if use_skip {
        enc.write_literal(8, u32::from(skip_proba));
    }

    let defaults = default_coeff_probs();
    for t in 0..NUM_TYPES {
        for b in 0..NUM_BANDS {
            for c in 0..NUM_CTX {
                for p in 0..NUM_PROBAS {
                    let updated = probs[t][b][c][p] != defaults[t][b][c][p];
                    enc.write_bool(updated, COEFF_UPDATE_PROBA);
                    if updated {
                        enc.write_literal(8, u32::from(probs[t][b][c][p]));
                    }
                }
            }
        }
    }
}

fn write_mb_header(
    enc: &mut BoolEncoder,
    info: &MbInfo,
    num_segments: usize,
    use_skip: bool,
    skip_proba: u8,
) {
    if num_segments > 1 {
        enc.write_literal(2, u32::from(info.segment));
    }
    if use_skip {
        enc.write_bool(info.skip, skip_proba);
    }
    enc.write_bool(info.is_i4, I4_FLAG_PROBA);
    if info.is_i4 {
        for &mode in &info.modes_i4 {
            put_unary_mode(enc, mode as usize);
        }
    } else {
        put_tree4_mode(enc, info.mode_i16 as usize, &YMODE_PROBS);
    }
    put_tree4_mode(enc, info.mode_uv as usize, &UVMODE_PROBS);
}

// Same trees the fixed mode-cost tables are built from.
fn put_tree4_mode(enc: &mut BoolEncoder, mode: usize, probs: &[u8; 3]) {
    match mode {
        0 => enc.write_bool(false, probs[0]),
        1 => {
            enc.write_bool(true, probs[0]);
            enc.write_bool(false, probs[1]);
        }
        2 => {
            enc.write_bool(true, probs[0]);
            enc.write_bool(true, probs[1]);
            enc.write_bool(false, probs[2]);
        }
        _ => {
            enc.write_bool(true, probs[0]);
            enc.write_bool(true, probs[1]);
            enc.write_bool(true, probs[2]);
        }
    }
}

fn put_unary_mode(enc: &mut BoolEncoder, mode: usize) {
    for (k, &p) in I4MODE_PROBS.iter().enumerate() {
        if k == mode {
            enc.write_bool(false, p);
            return;
        }
        enc.write_bool(true, p);
    }
    // mode 9 is the all-ones suffix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::api::encode_frame;

    fn flat_planes(w: usize, h: usize, luma: u8) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        (
            vec![luma; w * h],
            vec![128; (w / 2) * (h / 2)],
            vec![128; (w / 2) * (h / 2)],
        )
    }

    #[test]
    fn flat_frame_skips_every_macroblock() {
        let (y, u, v) = flat_planes(64, 48, 128);
        let pic = Picture::new_yuv(&y, &u, &v, 64, 48).unwrap();
        let config = EncoderConfig::new().with_quality(75.0).with_method(4);
        let frame = encode_frame(&config, &pic).unwrap();
        assert_eq!(frame.stats.skip_count, 4 * 3);
        assert!(!frame.mode_partition.is_empty());
    }

    #[test]
    fn encoding_is_deterministic() {
        let (w, h) = (48usize, 48usize);
        let mut y = vec![0u8; w * h];
        for (i, p) in y.iter_mut().enumerate() {
            *p = ((i * 31) % 256) as u8;
        }
        let u = vec![100u8; (w / 2) * (h / 2)];
        let v = vec![200u8; (w / 2) * (h / 2)];
        let pic = Picture::new_yuv(&y, &u, &v, w as u32, h as u32).unwrap();
        let config = EncoderConfig::new().with_quality(60.0);
        let a = encode_frame(&config, &pic).unwrap();
        let b = encode_frame(&config, &pic).unwrap();
        assert_eq!(a.mode_partition, b.mode_partition);
        assert_eq!(a.residual_partition, b.residual_partition);
    }

    #[test]
    fn alpha_output_is_thread_independent() {
        let (y, u, v) = flat_planes(32, 32, 90);
        let alpha: Vec<u8> = (0..32 * 32).map(|i| (i % 256) as u8).collect();
        let pic = Picture::new_yuv(&y, &u, &v, 32, 32)
            .unwrap()
            .with_alpha(&alpha)
            .unwrap();
        let inline = encode_frame(&EncoderConfig::new(), &pic).unwrap();
        let threaded = encode_frame(&EncoderConfig::new().with_threads(true), &pic).unwrap();
        assert_eq!(inline.alpha, threaded.alpha);
        assert!(inline.alpha.is_some());
    }

    #[test]
    fn single_pass_produces_nonempty_partitions() {
        let (w, h) = (32usize, 32usize);
        let mut y = vec![0u8; w * h];
        for (i, p) in y.iter_mut().enumerate() {
            *p = ((i * 7) % 256) as u8;
        }
        let u = vec![128u8; (w / 2) * (h / 2)];
        let v = vec![128u8; (w / 2) * (h / 2)];
        let pic = Picture::new_yuv(&y, &u, &v, w as u32, h as u32).unwrap();
        let config =
            EncoderConfig::new().with_emission_strategy(EmissionStrategy::SinglePass);
        let frame = encode_frame(&config, &pic).unwrap();
        assert!(!frame.residual_partition.is_empty());
    }

    #[test]
    fn progress_hook_can_abort() {
        let (y, u, v) = flat_planes(32, 32, 128);
        let pic = Picture::new_yuv(&y, &u, &v, 32, 32).unwrap();
        let config = EncoderConfig::new();
        let result = crate::encoder::api::encode_frame_with_progress(&config, &pic, &|_| false);
        assert!(matches!(result, Err(EncodingError::Aborted)));
    }

    #[test]
    fn progress_reports_are_monotone() {
        use std::cell::RefCell;
        let (y, u, v) = flat_planes(64, 64, 128);
        let pic = Picture::new_yuv(&y, &u, &v, 64, 64).unwrap();
        let seen = RefCell::new(Vec::new());
        let hook = |p: i32| {
            seen.borrow_mut().push(p);
            true
        };
        crate::encoder::api::encode_frame_with_progress(&EncoderConfig::new(), &pic, &hook)
            .unwrap();
        let seen = seen.into_inner();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 100);
    }
}
