//! Trellis quantization: joint selection of the coefficient levels of a
//! 4x4 block minimizing `rate * lambda + 256 * distortion`.
//!
//! A dynamic program over the zigzag positions. Each position keeps two
//! candidate levels (the neutrally-biased quantization and that level plus
//! one); each state carries the cost table the next position will be coded
//! under, since the coding context is min(level, 2). Every non-zero state
//! is also scored as a terminal with the end-of-block cost added, and the
//! cheapest terminal wins over the all-zero skip.

use super::cost::{LevelCostArray, LevelCosts};
use super::quantize::{quantdiv, quantization_bias, QuantMatrix};
use super::rd::rd_score;
use super::tables::{
    LEVEL_FIXED_COSTS, MAX_LEVEL, MAX_VARIABLE_LEVEL, WEIGHT_TRELLIS, ZIGZAG,
};

const MAX_COST: i64 = i64::MAX / 2;

// Candidate levels per position: level0 and level0 + 1.
const NUM_NODES: usize = 2;

#[derive(Clone, Copy, Default)]
struct TrellisNode {
    prev: i8,
    sign: bool,
    level: i16,
}

/// Partial score plus the cost table for the *next* position, as implied
/// by this state's level.
#[derive(Clone, Copy)]
struct ScoreState<'a> {
    score: i64,
    costs: Option<&'a LevelCostArray>,
}

impl Default for ScoreState<'_> {
    fn default() -> Self {
        Self {
            score: MAX_COST,
            costs: None,
        }
    }
}

#[inline]
fn node_level_cost(costs: Option<&LevelCostArray>, level: usize) -> i64 {
    let fixed = i64::from(LEVEL_FIXED_COSTS[level.min(MAX_LEVEL)]);
    match costs {
        Some(table) => fixed + i64::from(table[level.min(MAX_VARIABLE_LEVEL)]),
        None => fixed,
    }
}

/// Quantize one block along the cheapest trellis path.
///
/// `coeffs` holds the transform output in scan order and is overwritten
/// with the dequantized reconstruction; `out` receives the chosen levels in
/// zigzag order. Positions before `first` are untouched (the I16 AC case
/// keeps its DC). Returns whether any chosen level is non-zero.
#[allow(clippy::too_many_arguments)]
pub fn trellis_quantize_block(
    coeffs: &mut [i32; 16],
    out: &mut [i32; 16],
    mtx: &QuantMatrix,
    lambda: i64,
    first: usize,
    level_costs: &LevelCosts,
    ctype: usize,
    ctx0: usize,
) -> bool {
    let mut nodes = [[TrellisNode::default(); NUM_NODES]; 16];
    let mut score_states = [[ScoreState::default(); NUM_NODES]; 2];
    let mut cur = 0usize;
    let mut prev = 1usize;

    // Last coefficient whose energy clears the quantizer threshold, then
    // one more position so borderline samples still get a chance.
    let thresh = i64::from(mtx.q[1]) * i64::from(mtx.q[1]) / 4;
    let mut last = first as i32 - 1;
    for n in (first..16).rev() {
        let j = ZIGZAG[n];
        let err = i64::from(coeffs[j]) * i64::from(coeffs[j]);
        if err > thresh {
            last = n as i32;
            break;
        }
    }
    if last < 15 {
        last += 1;
    }

    // (position, delta, prev-delta) of the best terminal found so far
    let mut best_path: Option<(usize, usize, i8)> = None;

    // The competing baseline is signalling an empty block right away.
    let skip_cost = i64::from(level_costs.skip_eob_cost(ctype, first, ctx0));
    let mut best_score = rd_score(lambda, skip_cost, 0);

    let initial_costs = level_costs.cost_table(ctype, first, ctx0);
    let init_rate = if ctx0 == 0 {
        i64::from(level_costs.init_cost(ctype, first, ctx0))
    } else {
        0
    };
    let init_score = rd_score(lambda, init_rate, 0);
    for state in &mut score_states[cur] {
        *state = ScoreState {
            score: init_score,
            costs: Some(initial_costs),
        };
    }

    let neutral_bias = quantization_bias(0x00);
    let prune_bias = quantization_bias(0x80);

    for n in first..=last as usize {
        let j = ZIGZAG[n];
        let q = i32::from(mtx.q[j]);
        let iq = mtx.iq[j];

        let sign = coeffs[j] < 0;
        let abs_coeff = coeffs[j].unsigned_abs() + u32::from(mtx.sharpen[j]);

        let level0 = quantdiv(abs_coeff, iq, neutral_bias).min(MAX_LEVEL as i32);
        // Levels above this over-shoot even a maximally biased rounding.
        let max_level = quantdiv(abs_coeff, iq, prune_bias).min(MAX_LEVEL as i32);

        std::mem::swap(&mut cur, &mut prev);

        for delta in 0..NUM_NODES {
            let level = level0 + delta as i32;
            let ctx = (level as usize).min(2);
            let next_costs = if n + 1 < 16 {
                Some(level_costs.cost_table(ctype, n + 1, ctx))
            } else {
                None
            };
            score_states[cur][delta] = ScoreState {
                score: MAX_COST,
                costs: next_costs,
            };

            if level < 0 || level > max_level {
                continue;
            }

            let new_error = i64::from(abs_coeff as i32 - level * q);
            let old_error = i64::from(abs_coeff);
            let weight = i64::from(WEIGHT_TRELLIS[j]);
            let delta_distortion = weight * (new_error * new_error - old_error * old_error);
            let base_score = rd_score(lambda, 0, delta_distortion);

            let level_usize = level as usize;
            let ss_prev = &score_states[prev];
            let score0 =
                ss_prev[0].score + node_level_cost(ss_prev[0].costs, level_usize) * lambda;
            let score1 =
                ss_prev[1].score + node_level_cost(ss_prev[1].costs, level_usize) * lambda;
            let (score, from) = if score1 < score0 {
                (score1, 1i8)
            } else {
                (score0, 0i8)
            };
            let score = score + base_score;

            nodes[n][delta] = TrellisNode {
                prev: from,
                sign,
                level: level as i16,
            };
            score_states[cur][delta].score = score;

            if level != 0 && score < best_score {
                let eob_cost = if n < 15 {
                    i64::from(level_costs.eob_cost(ctype, n, ctx))
                } else {
                    0
                };
                let terminal = score + rd_score(lambda, eob_cost, 0);
                if terminal < best_score {
                    best_score = terminal;
                    best_path = Some((n, delta, from));
                }
            }
        }
    }

    if first == 1 {
        // AC-only block: the DC slot belongs to the WHT pass
        out[1..].fill(0);
        coeffs[1..].fill(0);
    } else {
        out.fill(0);
        coeffs.fill(0);
    }

    let (mut n, mut delta, terminal_prev) = match best_path {
        Some(path) => path,
        None => return false,
    };
    nodes[n][delta].prev = terminal_prev;

    let mut has_nz = false;
    loop {
        let node = nodes[n][delta];
        let j = ZIGZAG[n];
        let level = if node.sign {
            -i32::from(node.level)
        } else {
            i32::from(node.level)
        };
        out[n] = level;
        has_nz |= level != 0;
        coeffs[j] = level * i32::from(mtx.q[j]);

        if n == first {
            break;
        }
        delta = node.prev as usize;
        n -= 1;
    }
    has_nz
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::cost::{residual_cost, Residual};
    use crate::encoder::quantize::MatrixKind;
    use crate::encoder::tables::default_coeff_probs;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn block_rd_cost(
        levels: &[i32; 16],
        original: &[i32; 16],
        mtx: &QuantMatrix,
        lambda: i64,
        costs: &LevelCosts,
        probs: &crate::encoder::tables::TokenProbTables,
    ) -> i64 {
        let res = Residual::new(0, levels, 2);
        let rate = i64::from(residual_cost(0, &res, probs, costs));
        let mut distortion = 0i64;
        for n in 0..16 {
            let j = ZIGZAG[n];
            let recon = i64::from(levels[n]) * i64::from(mtx.q[j]);
            let d = i64::from(original[j]) - recon;
            distortion += i64::from(WEIGHT_TRELLIS[j]) * d * d;
        }
        rd_score(lambda, rate, distortion)
    }

    #[test]
    fn trellis_never_beats_by_losing() {
        // The trellis outcome must not cost more, under its own metric,
        // than plain biased quantization of the same block.
        // A sharpen-free matrix keeps the comparison metric identical to
        // the one the search minimizes.
        let probs = default_coeff_probs();
        let level_costs = LevelCosts::new(&probs);
        let mtx = QuantMatrix::new(20, 24, MatrixKind::UV);
        let lambda = 120i64;
        let mut rng = StdRng::seed_from_u64(0x7e11);

        for _ in 0..50 {
            let mut original = [0i32; 16];
            for c in original.iter_mut() {
                *c = rng.gen_range(-400..=400);
            }

            let mut coeffs_basic = original;
            let mut levels_basic = [0i32; 16];
            mtx.quantize_block(&mut coeffs_basic, &mut levels_basic, 0);

            let mut coeffs_trellis = original;
            let mut levels_trellis = [0i32; 16];
            trellis_quantize_block(
                &mut coeffs_trellis,
                &mut levels_trellis,
                &mtx,
                lambda,
                0,
                &level_costs,
                2,
                0,
            );

            let basic = block_rd_cost(&levels_basic, &original, &mtx, lambda, &level_costs, &probs);
            let trellis =
                block_rd_cost(&levels_trellis, &original, &mtx, lambda, &level_costs, &probs);
            assert!(
                trellis <= basic,
                "trellis {trellis} worse than basic {basic} for {original:?}"
            );
        }
    }

    #[test]
    fn small_coefficients_collapse_to_skip() {
        let probs = default_coeff_probs();
        let level_costs = LevelCosts::new(&probs);
        let mtx = QuantMatrix::new(60, 60, MatrixKind::Y1);
        let mut coeffs = [3i32; 16];
        let mut out = [0i32; 16];
        let nz = trellis_quantize_block(
            &mut coeffs,
            &mut out,
            &mtx,
            1000,
            0,
            &level_costs,
            3,
            0,
        );
        assert!(!nz);
        assert_eq!(out, [0; 16]);
        assert_eq!(coeffs, [0; 16]);
    }

    #[test]
    fn ac_only_mode_preserves_dc() {
        let probs = default_coeff_probs();
        let level_costs = LevelCosts::new(&probs);
        let mtx = QuantMatrix::new(10, 12, MatrixKind::Y1);
        let mut coeffs = [0i32; 16];
        coeffs[0] = 777; // belongs to the WHT pass
        let mut out = [0i32; 16];
        out[0] = 99;
        trellis_quantize_block(&mut coeffs, &mut out, &mtx, 50, 1, &level_costs, 0, 0);
        assert_eq!(coeffs[0], 777);
        assert_eq!(out[0], 99);
    }
}
