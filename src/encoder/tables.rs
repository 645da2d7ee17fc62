//! Scan orders, probability layout and the computed cost tables.
//!
//! The entropy-cost table and the fixed level costs are derived at compile
//! time from the token tree structure instead of being transcribed, so the
//! recording, estimation and emission paths all share one definition.

/// Zigzag scan order of the 4x4 coefficients.
pub const ZIGZAG: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

/// Coefficient position to probability band. Position 16 is the band used
/// for the end-of-block cost lookup past the last coefficient.
pub const COEFF_BANDS: [u8; 17] = [0, 1, 2, 3, 6, 4, 5, 6, 6, 6, 6, 6, 6, 6, 6, 7, 0];

/// Number of residual plane types (luma-AC, luma-DC, chroma, luma4).
pub const NUM_TYPES: usize = 4;
/// Number of probability bands.
pub const NUM_BANDS: usize = 8;
/// Number of non-zero contexts.
pub const NUM_CTX: usize = 3;
/// Number of probability nodes per (type, band, context).
pub const NUM_PROBAS: usize = 11;

/// Largest codable coefficient magnitude.
pub const MAX_LEVEL: usize = 2047;
/// Largest magnitude with a context-dependent tree cost; beyond this the
/// tree decisions are those of the last category.
pub const MAX_VARIABLE_LEVEL: usize = 67;

/// Coefficient probabilities, indexed `[type][band][ctx][node]`.
pub type TokenProbTables = [[[[u8; NUM_PROBAS]; NUM_CTX]; NUM_BANDS]; NUM_TYPES];

/// Flat index of one probability node, as stored in buffered tokens.
#[inline]
pub const fn token_id(t: usize, b: usize, c: usize, p: usize) -> usize {
    ((t * NUM_BANDS + b) * NUM_CTX + c) * NUM_PROBAS + p
}

/// Total number of probability nodes.
pub const NUM_TOKEN_IDS: usize = NUM_TYPES * NUM_BANDS * NUM_CTX * NUM_PROBAS;

/// Per-frequency sharpening boost applied to the luma-AC quantizer.
pub const FREQ_SHARPENING: [u8; 16] = [0, 30, 60, 90, 30, 60, 90, 90, 60, 90, 90, 90, 90, 90, 90, 90];

/// Perceptual weights used by the trellis distortion delta.
pub const WEIGHT_TRELLIS: [u16; 16] = [30, 27, 19, 11, 27, 24, 17, 10, 19, 17, 12, 8, 11, 10, 8, 6];

//------------------------------------------------------------------------------
// Magnitude categories
//
// Magnitudes above 4 are coded as a category selector followed by raw
// extra bits with fixed probabilities.

/// Fixed probabilities of the per-category extra bits.
pub const CAT1_PROBS: [u8; 1] = [159];
pub const CAT2_PROBS: [u8; 2] = [165, 145];
pub const CAT3_PROBS: [u8; 3] = [173, 148, 140];
pub const CAT4_PROBS: [u8; 4] = [176, 155, 140, 135];
pub const CAT5_PROBS: [u8; 5] = [180, 157, 141, 134, 130];
pub const CAT6_PROBS: [u8; 11] = [254, 254, 243, 230, 196, 177, 153, 140, 133, 130, 129];

/// Smallest magnitude of each category.
pub const CAT_BASES: [i32; 6] = [5, 7, 11, 19, 35, 67];

//------------------------------------------------------------------------------
// Entropy cost table
//
// cost(p) is the cost of coding a zero-branch of probability p, in units
// of 1/256th of a bit: -log2(p / 256) * 256, computed with a fixed-point
// log2 so the table needs no transcription.

const fn log2_fix8(x: u32) -> u32 {
    // round(log2(x) * 256) for x >= 1
    let msb = 31 - x.leading_zeros();
    let mut f = (x as u64) << (31 - msb); // Q31, in [2^31, 2^32)
    let mut frac = 0u32;
    let mut i = 0;
    while i < 9 {
        f = ((f as u128 * f as u128) >> 31) as u64;
        frac <<= 1;
        if f >= 1 << 32 {
            f >>= 1;
            frac |= 1;
        }
        i += 1;
    }
    msb * 256 + ((frac + 1) >> 1)
}

const fn build_entropy_cost() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut p = 0usize;
    while p < 256 {
        let clamped = if p == 0 { 1 } else { p as u32 };
        table[p] = (2048 - log2_fix8(clamped)) as u16;
        p += 1;
    }
    table
}

/// Cost of coding the zero-branch of a boolean with probability `p`.
pub static ENTROPY_COST: [u16; 256] = build_entropy_cost();

/// Cost of one boolean decision, in 1/256th-bit units.
#[inline]
pub const fn bit_cost(bit: bool, proba: u8) -> u16 {
    ENTROPY_COST[if bit { 255 - proba as usize } else { proba as usize }]
}

//------------------------------------------------------------------------------
// Fixed level costs
//
// The part of a coefficient's cost that does not depend on the adaptive
// tree probabilities: the sign bit plus the category extra bits.

const fn extra_bits_cost(value: u32, probs: &[u8]) -> u32 {
    let mut cost = 0u32;
    let n = probs.len();
    let mut i = 0;
    while i < n {
        let bit = (value >> (n - 1 - i)) & 1 != 0;
        cost += bit_cost(bit, probs[i]) as u32;
        i += 1;
    }
    cost
}

const fn fixed_level_cost(level: i32) -> u16 {
    if level == 0 {
        return 0;
    }
    let sign = bit_cost(false, 128) as u32;
    let extra = if level < CAT_BASES[0] {
        0
    } else if level < CAT_BASES[1] {
        extra_bits_cost((level - CAT_BASES[0]) as u32, &CAT1_PROBS)
    } else if level < CAT_BASES[2] {
        extra_bits_cost((level - CAT_BASES[1]) as u32, &CAT2_PROBS)
    } else if level < CAT_BASES[3] {
        extra_bits_cost((level - CAT_BASES[2]) as u32, &CAT3_PROBS)
    } else if level < CAT_BASES[4] {
        extra_bits_cost((level - CAT_BASES[3]) as u32, &CAT4_PROBS)
    } else if level < CAT_BASES[5] {
        extra_bits_cost((level - CAT_BASES[4]) as u32, &CAT5_PROBS)
    } else {
        extra_bits_cost((level - CAT_BASES[5]) as u32, &CAT6_PROBS)
    };
    let total = sign + extra;
    if total > u16::MAX as u32 {
        u16::MAX
    } else {
        total as u16
    }
}

const fn build_level_fixed_costs() -> [u16; MAX_LEVEL + 1] {
    let mut table = [0u16; MAX_LEVEL + 1];
    let mut v = 0;
    while v <= MAX_LEVEL {
        table[v] = fixed_level_cost(v as i32);
        v += 1;
    }
    table
}

/// Sign + extra-bits cost per coefficient magnitude.
pub static LEVEL_FIXED_COSTS: [u16; MAX_LEVEL + 1] = build_level_fixed_costs();

//------------------------------------------------------------------------------
// Default coefficient probabilities
//
// Rough priors only: the per-frame statistics pass replaces them before
// the residual partition is emitted, so shape matters more than the exact
// values. End-of-block gets likelier with the band, a non-zero neighbor
// context makes further coefficients likelier.

pub(crate) fn default_coeff_probs() -> TokenProbTables {
    const NODE_PRIOR: [i32; NUM_PROBAS] = [230, 224, 160, 148, 150, 158, 160, 150, 168, 160, 154];
    let mut probs = [[[[0u8; NUM_PROBAS]; NUM_CTX]; NUM_BANDS]; NUM_TYPES];
    for tp in probs.iter_mut() {
        for (b, bp) in tp.iter_mut().enumerate() {
            for (c, cp) in bp.iter_mut().enumerate() {
                for (p, v) in cp.iter_mut().enumerate() {
                    let mut prior = NODE_PRIOR[p];
                    if p == 0 {
                        prior += 3 * b as i32 - 35 * c as i32;
                    } else if p == 1 {
                        prior -= 25 * c as i32;
                    }
                    *v = prior.clamp(1, 255) as u8;
                }
            }
        }
    }
    probs
}

//------------------------------------------------------------------------------
// Mode coding
//
// Intra modes are coded with small fixed-probability trees. The cost
// tables below are derived from the same probabilities the writer uses,
// so mode rates in the RD search match the emitted bits.

/// Probability that a macroblock is not coded with 4x4 modes.
pub const I4_FLAG_PROBA: u8 = 145;
/// Probabilities of the 16x16 luma mode tree (DC / TM / VE-HE split).
pub const YMODE_PROBS: [u8; 3] = [156, 163, 128];
/// Probabilities of the chroma mode tree.
pub const UVMODE_PROBS: [u8; 3] = [162, 110, 128];
/// Probabilities of the unary 4x4 mode chain (modes 0..8; mode 9 is the
/// all-ones suffix).
pub const I4MODE_PROBS: [u8; 9] = [110, 118, 124, 128, 130, 132, 134, 136, 128];

const fn tree4_cost(mode: usize, probs: &[u8; 3], prefix: u32) -> u16 {
    let c = match mode {
        0 => bit_cost(false, probs[0]) as u32,
        1 => bit_cost(true, probs[0]) as u32 + bit_cost(false, probs[1]) as u32,
        2 => {
            bit_cost(true, probs[0]) as u32
                + bit_cost(true, probs[1]) as u32
                + bit_cost(false, probs[2]) as u32
        }
        _ => {
            bit_cost(true, probs[0]) as u32
                + bit_cost(true, probs[1]) as u32
                + bit_cost(true, probs[2]) as u32
        }
    };
    (c + prefix) as u16
}

const fn build_i16_mode_costs() -> [u16; 4] {
    let flag = bit_cost(false, I4_FLAG_PROBA) as u32;
    [
        tree4_cost(0, &YMODE_PROBS, flag),
        tree4_cost(1, &YMODE_PROBS, flag),
        tree4_cost(2, &YMODE_PROBS, flag),
        tree4_cost(3, &YMODE_PROBS, flag),
    ]
}

const fn build_uv_mode_costs() -> [u16; 4] {
    [
        tree4_cost(0, &UVMODE_PROBS, 0),
        tree4_cost(1, &UVMODE_PROBS, 0),
        tree4_cost(2, &UVMODE_PROBS, 0),
        tree4_cost(3, &UVMODE_PROBS, 0),
    ]
}

const fn build_i4_mode_costs() -> [u16; 10] {
    let mut costs = [0u16; 10];
    let mut mode = 0usize;
    while mode < 10 {
        let mut c = 0u32;
        let mut k = 0usize;
        while k < 9 {
            if k == mode {
                c += bit_cost(false, I4MODE_PROBS[k]) as u32;
                break;
            }
            c += bit_cost(true, I4MODE_PROBS[k]) as u32;
            k += 1;
        }
        costs[mode] = c as u16;
        mode += 1;
    }
    costs
}

/// Header cost of each 16x16 luma mode (includes the not-4x4 flag).
pub static FIXED_COSTS_I16: [u16; 4] = build_i16_mode_costs();
/// Header cost of each chroma mode.
pub static FIXED_COSTS_UV: [u16; 4] = build_uv_mode_costs();
/// Header cost of each 4x4 sub-block mode.
pub static FIXED_COSTS_I4: [u16; 10] = build_i4_mode_costs();
/// Cost of signalling that a macroblock uses 4x4 modes.
pub static COST_I4_FLAG: u16 = bit_cost(true, I4_FLAG_PROBA);
