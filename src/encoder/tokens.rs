//! Paginated token buffer.
//!
//! Residuals are tokenized once, probability-free, while the scan runs;
//! the actual probabilities are chosen afterwards from the recorded
//! statistics and the buffered tokens replayed into the arithmetic
//! encoder. A token stores the boolean decision plus either the flat index
//! of its probability node or, for the fixed-probability bits (sign,
//! category extra bits), the probability itself.
//!
//! Pages have a fixed capacity and are appended on demand with fallible
//! allocation: an allocation failure flips a sticky error flag and every
//! later operation becomes a failing no-op.

use std::collections::VecDeque;

use super::arithmetic::BoolEncoder;
use super::cost::{ProbaStats, Residual};
use super::tables::{
    bit_cost, token_id, TokenProbTables, CAT3_PROBS, CAT4_PROBS, CAT5_PROBS, CAT6_PROBS,
    COEFF_BANDS, NUM_BANDS, NUM_CTX, NUM_PROBAS,
};

/// Default number of tokens per page.
pub const DEFAULT_PAGE_SIZE: usize = 8192;

const BIT_FLAG: u16 = 1 << 15;
const FIXED_PROBA_FLAG: u16 = 1 << 14;

pub struct TokenBuffer {
    pages: VecDeque<Vec<u16>>,
    page_size: usize,
    error: bool,
}

impl TokenBuffer {
    pub fn new(page_size: usize) -> Self {
        Self {
            pages: VecDeque::new(),
            page_size: page_size.max(1),
            error: false,
        }
    }

    /// Whether a page allocation has failed. Sticky.
    pub fn error(&self) -> bool {
        self.error
    }

    /// Total number of buffered tokens.
    pub fn len(&self) -> usize {
        self.pages.iter().map(Vec::len).sum()
    }

    fn push(&mut self, token: u16) -> bool {
        if self.error {
            return false;
        }
        let needs_page = match self.pages.back() {
            Some(page) => page.len() == self.page_size,
            None => true,
        };
        if needs_page {
            let mut page = Vec::new();
            if page.try_reserve_exact(self.page_size).is_err() {
                self.error = true;
                return false;
            }
            self.pages.push_back(page);
        }
        // the page cannot be full here
        if let Some(page) = self.pages.back_mut() {
            page.push(token);
        }
        true
    }

    fn add_token(&mut self, bit: bool, id: usize, stats: &mut ProbaStats) -> bool {
        debug_assert!(id < FIXED_PROBA_FLAG as usize);
        stats.record(bit, id);
        self.push(((bit as u16) << 15) | id as u16);
        bit
    }

    fn add_constant_token(&mut self, bit: bool, proba: u8) -> bool {
        self.push(((bit as u16) << 15) | FIXED_PROBA_FLAG | u16::from(proba));
        bit
    }

    /// Tokenize one residual block entered under non-zero context `ctx0`.
    /// Returns false if the buffer is in the failed state.
    pub fn record_coeffs(
        &mut self,
        ctx0: usize,
        res: &Residual<'_>,
        stats: &mut ProbaStats,
    ) -> bool {
        let t = res.coeff_type;
        let mut n = res.first;
        let mut band = COEFF_BANDS[n] as usize;
        let mut ctx = ctx0;

        if !self.add_token(res.last >= 0, token_id(t, band, ctx, 0), stats) {
            return !self.error;
        }

        while n < 16 {
            let c = res.coeffs[n];
            n += 1;
            let sign = c < 0;
            let v = c.unsigned_abs();
            if !self.add_token(v != 0, token_id(t, band, ctx, 1), stats) {
                band = COEFF_BANDS[n] as usize;
                ctx = 0;
                continue;
            }
            if !self.add_token(v > 1, token_id(t, band, ctx, 2), stats) {
                // magnitude 1
                self.add_constant_token(sign, 128);
                band = COEFF_BANDS[n] as usize;
                ctx = 1;
            } else {
                self.record_magnitude(v, t, band, ctx, stats);
                self.add_constant_token(sign, 128);
                band = COEFF_BANDS[n] as usize;
                ctx = 2;
            }
            if n == 16 || !self.add_token((n as i32) <= res.last, token_id(t, band, ctx, 0), stats)
            {
                break; // end of block
            }
        }
        !self.error
    }

    // Magnitude above 1: tree nodes 3..10 plus the fixed-probability
    // category extra bits.
    fn record_magnitude(&mut self, v: u32, t: usize, band: usize, ctx: usize, stats: &mut ProbaStats) {
        let id = |p: usize| token_id(t, band, ctx, p);
        if !self.add_token(v > 4, id(3), stats) {
            if self.add_token(v != 2, id(4), stats) {
                self.add_token(v == 4, id(5), stats);
            }
        } else if !self.add_token(v > 10, id(6), stats) {
            if !self.add_token(v > 6, id(7), stats) {
                self.add_constant_token(v == 6, 159);
            } else {
                self.add_constant_token(v >= 9, 165);
                self.add_constant_token(v & 1 == 0, 145);
            }
        } else if !self.add_token(v > 34, id(8), stats) {
            if !self.add_token(v > 18, id(9), stats) {
                self.put_extra_bits(v - 11, &CAT3_PROBS);
            } else {
                self.put_extra_bits(v - 19, &CAT4_PROBS);
            }
        } else if !self.add_token(v > 66, id(10), stats) {
            self.put_extra_bits(v - 35, &CAT5_PROBS);
        } else {
            self.put_extra_bits(v - 67, &CAT6_PROBS);
        }
    }

    fn put_extra_bits(&mut self, value: u32, probs: &[u8]) {
        for (i, &p) in probs.iter().enumerate() {
            let bit = value >> (probs.len() - 1 - i) & 1 != 0;
            self.add_constant_token(bit, p);
        }
    }

    /// Exact size, in 1/256th-bit units, the buffered tokens would occupy
    /// under `probs`. Non-destructive.
    pub fn estimate_size(&self, probs: &TokenProbTables) -> u64 {
        if self.error {
            return 0;
        }
        let mut size = 0u64;
        for page in &self.pages {
            for &token in page {
                size += u64::from(token_cost(token, probs));
            }
        }
        size
    }

    /// Replay every buffered token into `enc` in recorded order. When
    /// `final_pass` is set, each page is released as soon as it has been
    /// written out.
    pub fn emit(&mut self, enc: &mut BoolEncoder, probs: &TokenProbTables, final_pass: bool) -> bool {
        if self.error {
            return false;
        }
        if final_pass {
            while let Some(page) = self.pages.pop_front() {
                for &token in &page {
                    emit_token(token, enc, probs);
                }
                drop(page);
            }
        } else {
            for page in &self.pages {
                for &token in page {
                    emit_token(token, enc, probs);
                }
            }
        }
        true
    }
}

fn token_proba(token: u16, probs: &TokenProbTables) -> u8 {
    if token & FIXED_PROBA_FLAG != 0 {
        (token & 0xff) as u8
    } else {
        let id = (token & (FIXED_PROBA_FLAG - 1)) as usize;
        let p = id % NUM_PROBAS;
        let c = (id / NUM_PROBAS) % NUM_CTX;
        let b = (id / (NUM_PROBAS * NUM_CTX)) % NUM_BANDS;
        let t = id / (NUM_PROBAS * NUM_CTX * NUM_BANDS);
        probs[t][b][c][p]
    }
}

#[inline]
fn token_cost(token: u16, probs: &TokenProbTables) -> u16 {
    bit_cost(token & BIT_FLAG != 0, token_proba(token, probs))
}

#[inline]
fn emit_token(token: u16, enc: &mut BoolEncoder, probs: &TokenProbTables) {
    enc.write_bool(token & BIT_FLAG != 0, token_proba(token, probs));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::tables::default_coeff_probs;

    fn residual_from(levels: [i32; 16]) -> [i32; 16] {
        levels
    }

    #[test]
    fn estimate_matches_encoder_cost() {
        let probs = default_coeff_probs();
        let mut stats = ProbaStats::new();
        let mut buf = TokenBuffer::new(16);

        let coeffs = residual_from([12, -3, 0, 1, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let res = Residual::new(0, &coeffs, 3);
        assert!(buf.record_coeffs(0, &res, &mut stats));

        let estimated = buf.estimate_size(&probs);
        let mut enc = BoolEncoder::new();
        assert!(buf.emit(&mut enc, &probs, false));
        assert_eq!(estimated, enc.cost());
    }

    #[test]
    fn tokens_span_multiple_pages() {
        let probs = default_coeff_probs();
        let mut stats = ProbaStats::new();
        let mut buf = TokenBuffer::new(4);
        let coeffs = residual_from([5, 1, -1, 2, 0, 3, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]);
        for _ in 0..10 {
            let res = Residual::new(0, &coeffs, 0);
            buf.record_coeffs(0, &res, &mut stats);
        }
        assert!(buf.len() > 4);
        let est = buf.estimate_size(&probs);
        assert!(est > 0);

        // Emission order must be the recorded order regardless of paging.
        let mut small_pages = BoolEncoder::new();
        buf.emit(&mut small_pages, &probs, false);

        let mut buf_large = TokenBuffer::new(1 << 12);
        let mut stats2 = ProbaStats::new();
        for _ in 0..10 {
            let res = Residual::new(0, &coeffs, 0);
            buf_large.record_coeffs(0, &res, &mut stats2);
        }
        let mut one_page = BoolEncoder::new();
        buf_large.emit(&mut one_page, &probs, false);
        assert_eq!(small_pages.finish(), one_page.finish());
    }

    #[test]
    fn final_pass_releases_pages() {
        let probs = default_coeff_probs();
        let mut stats = ProbaStats::new();
        let mut buf = TokenBuffer::new(8);
        let coeffs = residual_from([1, 0, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        let res = Residual::new(0, &coeffs, 2);
        buf.record_coeffs(0, &res, &mut stats);
        let mut enc = BoolEncoder::new();
        buf.emit(&mut enc, &probs, true);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn empty_block_records_a_single_token() {
        let mut stats = ProbaStats::new();
        let mut buf = TokenBuffer::new(64);
        let coeffs = [0i32; 16];
        let res = Residual::new(0, &coeffs, 1);
        buf.record_coeffs(2, &res, &mut stats);
        assert_eq!(buf.len(), 1);
    }
}
