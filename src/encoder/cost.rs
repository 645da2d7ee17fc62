//! Rate estimation: level-cost tables, probability statistics and the
//! residual cost walker.
//!
//! Costs are in 1/256th-bit units throughout. The level-cost tables cache
//! the context-dependent tree cost of each magnitude up to
//! [`MAX_VARIABLE_LEVEL`]; the sign and extra-bits part is the precomputed
//! [`LEVEL_FIXED_COSTS`] table.

use super::tables::{
    bit_cost, TokenProbTables, COEFF_BANDS, LEVEL_FIXED_COSTS, MAX_LEVEL, MAX_VARIABLE_LEVEL,
    NUM_BANDS, NUM_CTX, NUM_PROBAS, NUM_TOKEN_IDS, NUM_TYPES,
};

/// Context-dependent cost of each codable magnitude, for one
/// (type, band, context) triple.
pub type LevelCostArray = [u16; MAX_VARIABLE_LEVEL + 1];

/// Tree cost of a magnitude, excluding the leading EOB/zero decisions that
/// the table construction accounts for separately.
fn variable_level_cost(level: usize, probs: &[u8; NUM_PROBAS]) -> u32 {
    let v = level as i32;
    debug_assert!((1..=MAX_VARIABLE_LEVEL as i32).contains(&v));
    if v == 1 {
        return u32::from(bit_cost(false, probs[2]));
    }
    let mut cost = u32::from(bit_cost(true, probs[2]));
    if v <= 4 {
        cost += u32::from(bit_cost(false, probs[3]));
        if v == 2 {
            cost += u32::from(bit_cost(false, probs[4]));
        } else {
            cost += u32::from(bit_cost(true, probs[4]));
            cost += u32::from(bit_cost(v == 4, probs[5]));
        }
    } else if v <= 10 {
        cost += u32::from(bit_cost(true, probs[3]));
        cost += u32::from(bit_cost(false, probs[6]));
        cost += u32::from(bit_cost(v > 6, probs[7]));
    } else {
        cost += u32::from(bit_cost(true, probs[3]));
        cost += u32::from(bit_cost(true, probs[6]));
        if v <= 34 {
            cost += u32::from(bit_cost(false, probs[8]));
            cost += u32::from(bit_cost(v > 18, probs[9]));
        } else {
            cost += u32::from(bit_cost(true, probs[8]));
            cost += u32::from(bit_cost(v > 66, probs[10]));
        }
    }
    cost
}

/// Cached per-magnitude costs, recomputed whenever the probabilities change.
pub struct LevelCosts {
    costs: [[[LevelCostArray; NUM_CTX]; NUM_BANDS]; NUM_TYPES],
    eob: [[[u16; NUM_CTX]; NUM_BANDS]; NUM_TYPES],
    init: [[[u16; NUM_CTX]; NUM_BANDS]; NUM_TYPES],
}

impl LevelCosts {
    pub fn new(probs: &TokenProbTables) -> Box<Self> {
        let mut lc = Box::new(Self {
            costs: [[[[0; MAX_VARIABLE_LEVEL + 1]; NUM_CTX]; NUM_BANDS]; NUM_TYPES],
            eob: [[[0; NUM_CTX]; NUM_BANDS]; NUM_TYPES],
            init: [[[0; NUM_CTX]; NUM_BANDS]; NUM_TYPES],
        });
        lc.calculate(probs);
        lc
    }

    /// Rebuild every table from the given probabilities.
    pub fn calculate(&mut self, probs: &TokenProbTables) {
        for t in 0..NUM_TYPES {
            for b in 0..NUM_BANDS {
                for c in 0..NUM_CTX {
                    let p = &probs[t][b][c];
                    // For ctx > 0 the "not end-of-block" decision is folded
                    // into the table; at ctx 0 the caller pays it once.
                    let cost0 = if c > 0 {
                        u32::from(bit_cost(true, p[0]))
                    } else {
                        0
                    };
                    let cost_base = u32::from(bit_cost(true, p[1])) + cost0;
                    let table = &mut self.costs[t][b][c];
                    table[0] = (u32::from(bit_cost(false, p[1])) + cost0) as u16;
                    for v in 1..=MAX_VARIABLE_LEVEL {
                        table[v] = (cost_base + variable_level_cost(v, p)).min(0xffff) as u16;
                    }
                    self.eob[t][b][c] = bit_cost(false, p[0]);
                    self.init[t][b][c] = bit_cost(true, p[0]);
                }
            }
        }
    }

    /// Cost table for coefficient position `n` under context `ctx`.
    #[inline]
    pub fn cost_table(&self, ctype: usize, n: usize, ctx: usize) -> &LevelCostArray {
        &self.costs[ctype][COEFF_BANDS[n] as usize][ctx]
    }

    /// Cost of signalling end-of-block after position `n`.
    #[inline]
    pub fn eob_cost(&self, ctype: usize, n: usize, ctx: usize) -> u16 {
        self.eob[ctype][COEFF_BANDS[n + 1] as usize][ctx]
    }

    /// Cost of the leading "coefficients follow" decision at position `n`.
    #[inline]
    pub fn init_cost(&self, ctype: usize, n: usize, ctx: usize) -> u16 {
        self.init[ctype][COEFF_BANDS[n] as usize][ctx]
    }

    /// Cost of signalling an empty block starting at position `first`.
    #[inline]
    pub fn skip_eob_cost(&self, ctype: usize, first: usize, ctx: usize) -> u16 {
        self.eob[ctype][COEFF_BANDS[first] as usize][ctx]
    }
}

/// Total cost of one magnitude: cached tree cost plus sign/extra bits.
#[inline]
pub fn level_cost(table: &LevelCostArray, level: usize) -> u32 {
    u32::from(table[level.min(MAX_VARIABLE_LEVEL)])
        + u32::from(LEVEL_FIXED_COSTS[level.min(MAX_LEVEL)])
}

//------------------------------------------------------------------------------
// Probability statistics

/// Packed branch counters: upper half is the total, lower half the number
/// of one-bits seen. Halved on overflow so the ratio survives.
#[derive(Clone)]
pub struct ProbaStats {
    counts: Box<[u32; NUM_TOKEN_IDS]>,
}

impl ProbaStats {
    pub fn new() -> Self {
        Self {
            counts: Box::new([0; NUM_TOKEN_IDS]),
        }
    }

    #[inline]
    pub fn record(&mut self, bit: bool, token_id: usize) {
        let p = &mut self.counts[token_id];
        if *p >= 0xffff_0000 {
            *p = ((*p + 1) >> 1) & 0x7fff_7fff;
        }
        *p += 0x0001_0000 + bit as u32;
    }

    /// (one-bits, total) observed for one probability node.
    #[inline]
    pub fn split(&self, token_id: usize) -> (u32, u32) {
        let p = self.counts[token_id];
        (p & 0xffff, p >> 16)
    }
}

/// Probability of the zero branch given `nb` one-bits out of `total`.
pub fn calc_proba(nb: u32, total: u32) -> u8 {
    if nb == 0 || total == 0 {
        255
    } else {
        (255 - nb * 255 / total).max(1) as u8
    }
}

fn branch_cost(nb: u64, total: u64, proba: u8) -> u64 {
    nb * u64::from(bit_cost(true, proba)) + (total - nb) * u64::from(bit_cost(false, proba))
}

/// Whether re-signalling a probability pays for its own 8-bit overhead.
pub fn should_update(nb: u32, total: u32, old_p: u8, new_p: u8) -> bool {
    if old_p == new_p || total == 0 {
        return false;
    }
    let old_cost = branch_cost(nb.into(), total.into(), old_p);
    let new_cost = branch_cost(nb.into(), total.into(), new_p) + 8 * 256;
    old_cost > new_cost
}

//------------------------------------------------------------------------------
// Residual cost

/// One block's worth of quantized levels, in zigzag order, tagged with its
/// plane type and first coded position (1 for the AC-only luma case).
pub struct Residual<'a> {
    pub first: usize,
    pub last: i32,
    pub coeffs: &'a [i32; 16],
    pub coeff_type: usize,
}

impl<'a> Residual<'a> {
    pub fn new(first: usize, coeffs: &'a [i32; 16], coeff_type: usize) -> Self {
        let mut last = -1;
        for n in (first..16).rev() {
            if coeffs[n] != 0 {
                last = n as i32;
                break;
            }
        }
        Self {
            first,
            last,
            coeffs,
            coeff_type,
        }
    }
}

/// Exact cost of coding one residual block under the given probabilities.
pub fn residual_cost(
    ctx0: usize,
    res: &Residual<'_>,
    probs: &TokenProbTables,
    costs: &LevelCosts,
) -> u32 {
    let ctype = res.coeff_type;
    let mut n = res.first;
    let p0 = probs[ctype][COEFF_BANDS[n] as usize][ctx0][0];

    // bit_cost(1, p0) is already incorporated in the cost tables, but only
    // if ctx != 0.
    let mut cost = if ctx0 == 0 {
        u32::from(bit_cost(true, p0))
    } else {
        0
    };

    if res.last < 0 {
        return u32::from(bit_cost(false, p0));
    }

    let mut ctx = ctx0;
    while (n as i32) < res.last {
        let v = res.coeffs[n].unsigned_abs() as usize;
        cost += level_cost(costs.cost_table(ctype, n, ctx), v);
        ctx = v.min(2);
        n += 1;
    }

    // Last coefficient is always non-zero
    {
        let v = res.coeffs[n].unsigned_abs() as usize;
        debug_assert!(v != 0);
        cost += level_cost(costs.cost_table(ctype, n, ctx), v);
        if n < 15 {
            let next_band = COEFF_BANDS[n + 1] as usize;
            let next_ctx = if v == 1 { 1 } else { 2 };
            let last_p0 = probs[ctype][next_band][next_ctx][0];
            cost += u32::from(bit_cost(false, last_p0));
        }
    }

    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::tables::default_coeff_probs;

    #[test]
    fn empty_block_costs_one_eob_decision() {
        let probs = default_coeff_probs();
        let costs = LevelCosts::new(&probs);
        let coeffs = [0i32; 16];
        let res = Residual::new(0, &coeffs, 3);
        let cost = residual_cost(0, &res, &probs, &costs);
        assert_eq!(cost, u32::from(bit_cost(false, probs[3][0][0][0])));
    }

    #[test]
    fn larger_levels_cost_more() {
        let probs = default_coeff_probs();
        let costs = LevelCosts::new(&probs);
        let table = costs.cost_table(0, 1, 0);
        assert!(level_cost(table, 4) > level_cost(table, 1));
        assert!(level_cost(table, 100) > level_cost(table, 10));
    }

    #[test]
    fn proba_stats_round_trip() {
        let mut stats = ProbaStats::new();
        for i in 0..10 {
            stats.record(i % 4 == 0, 7);
        }
        let (nb, total) = stats.split(7);
        assert_eq!(total, 10);
        assert_eq!(nb, 3);
        assert!(calc_proba(nb, total) > 128);
    }

    #[test]
    fn update_requires_savings() {
        // A tiny sample never amortizes the 8-bit signalling overhead.
        assert!(!should_update(1, 2, 200, 128));
        // A big skewed sample against a bad prior does.
        assert!(should_update(9000, 10000, 240, 26));
    }
}
