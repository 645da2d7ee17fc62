//! Boolean arithmetic (range) encoder.
//!
//! Bits are coded against an 8-bit probability of the zero branch. The
//! encoder also accumulates the entropy cost of everything written so far,
//! in 1/256th-bit units, so callers can measure coded sizes without
//! flushing: the same cost table drives the rate estimates in the RD
//! search, which keeps estimated and emitted sizes in exact agreement.

use super::tables::bit_cost;

pub(crate) struct BoolEncoder {
    /// the bytes that have been encoded so far
    buf: Vec<u8>,
    /// value of the current bytes being encoded
    bottom: u32,
    /// the range for the next bit, must be between 128 and 255 inclusive
    range: u32,
    /// number of bits that have been encoded in the current byte
    bit_num: i32,
    /// accumulated entropy cost, in 1/256th-bit units
    cost: u64,
}

impl BoolEncoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            bottom: 0,
            range: 255,
            bit_num: 24,
            cost: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            ..Self::new()
        }
    }

    /// Entropy cost of everything written so far, in 1/256th-bit units.
    pub fn cost(&self) -> u64 {
        self.cost
    }

    /// Number of whole bytes already flushed to the output buffer.
    pub fn num_bytes(&self) -> usize {
        self.buf.len()
    }

    // Handle carry propagation: add one to output, handling 0xFF overflow chains.
    // When a byte is 0xFF and we add 1, it becomes 0x00 with carry to the previous byte.
    fn add_one_to_output(&mut self) {
        let mut i = self.buf.len();
        while i > 0 {
            i -= 1;
            if self.buf[i] < 255 {
                self.buf[i] += 1;
                return;
            }
            // 0xFF + 1 = 0x00 with carry to previous byte
            self.buf[i] = 0;
        }
        // All bytes were 0xFF - prepend a 0x01
        self.buf.insert(0, 1);
    }

    pub fn write_flag(&mut self, flag: bool) {
        self.write_bool(flag, 128);
    }

    pub fn write_bool(&mut self, bit: bool, probability: u8) {
        let split = 1 + (((self.range - 1) * u32::from(probability)) >> 8);

        if bit {
            self.bottom += split;
            self.range -= split;
        } else {
            self.range = split;
        }
        self.cost += u64::from(bit_cost(bit, probability));

        while self.range < 128 {
            self.range <<= 1;

            if self.bottom & (1 << 31) != 0 {
                self.add_one_to_output();
            }
            self.bottom <<= 1;

            self.bit_num -= 1;
            // we have a byte now so can write it
            if self.bit_num == 0 {
                let new_value = (self.bottom >> 24) as u8;
                self.buf.push(new_value);
                // only keep low 3 bytes
                self.bottom &= (1 << 24) - 1;
                self.bit_num = 8;
            }
        }
    }

    /// Write `num_bits` raw bits of `value`, most significant first.
    pub fn write_literal(&mut self, num_bits: u8, value: u32) {
        for bit in (0..num_bits).rev() {
            self.write_bool((1 << bit) & value != 0, 128);
        }
    }

    /// Flushes any remaining bits and consumes the encoder.
    pub fn finish(mut self) -> Vec<u8> {
        let mut c = self.bit_num;
        let mut v = self.bottom;
        if self.bottom & (1 << (32 - self.bit_num)) != 0 {
            self.add_one_to_output();
        }
        v <<= c & 0b111;
        c = (c >> 3) - 1;
        while c >= 0 {
            v <<= 8;
            c -= 1;
        }
        c = 3;
        while c >= 0 {
            self.buf.push((v >> 24) as u8);
            v <<= 8;
            c -= 1;
        }
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_bitstream() {
        let mut enc = BoolEncoder::new();
        enc.write_flag(false);
        enc.write_bool(true, 10);
        enc.write_bool(false, 250);
        enc.write_literal(1, 1);
        enc.write_literal(3, 5);
        enc.write_literal(8, 64);
        enc.write_literal(8, 185);
        let bytes = enc.finish();
        assert_eq!(&[104, 101, 107, 128], &*bytes);
    }

    #[test]
    fn cost_counts_quarter_bits() {
        let mut enc = BoolEncoder::new();
        for _ in 0..8 {
            enc.write_flag(true);
        }
        // eight even-odds flags cost exactly one byte
        assert_eq!(enc.cost(), 8 * 256);
    }

    #[test]
    fn cost_tracks_skewed_probabilities() {
        let mut enc = BoolEncoder::new();
        enc.write_bool(false, 250); // likely branch, cheap
        let cheap = enc.cost();
        enc.write_bool(true, 250); // unlikely branch, expensive
        assert!(enc.cost() - cheap > cheap);
    }
}
