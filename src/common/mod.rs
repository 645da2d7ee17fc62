//! Common layout constants and signal-processing primitives shared by the
//! encoder stages.
//!
//! All per-macroblock pixel work happens in small strided scratch buffers
//! rather than in the source planes. A macroblock's luma (16x16) and both
//! chroma blocks (8x8 each) share one buffer: every row is `BPS` bytes wide,
//! with luma at column 0, U at column [`U_OFF`] and V at column [`V_OFF`].
//! Rows 8..16 of the chroma columns are unused.

pub mod prediction;
pub mod transform;

/// Stride of the macroblock scratch buffers, in bytes.
pub const BPS: usize = 32;

/// Byte offset of the luma 16x16 block inside a scratch buffer.
pub const Y_OFF: usize = 0;
/// Byte offset (column) of the U 8x8 block inside a scratch buffer.
pub const U_OFF: usize = 16;
/// Byte offset (column) of the V 8x8 block inside a scratch buffer.
pub const V_OFF: usize = U_OFF + 8;
/// Total size of one macroblock scratch buffer (Y + U + V).
pub const YUV_SIZE: usize = BPS * 16;

// Offsets of the intra predictors inside the prediction scratch buffer.
// The 16x16 and 8x8 predictors are laid out two per 16-row band; the ten
// 4x4 predictors share the last band, four columns apart.
/// 16x16 DC predictor offset.
pub const I16DC16: usize = 0;
/// 16x16 TrueMotion predictor offset.
pub const I16TM16: usize = I16DC16 + 16;
/// 16x16 vertical predictor offset.
pub const I16VE16: usize = 16 * BPS;
/// 16x16 horizontal predictor offset.
pub const I16HE16: usize = I16VE16 + 16;
/// Chroma 8x8 DC predictor offset (U plane; V follows 8 columns later).
pub const C8DC8: usize = 2 * 16 * BPS;
/// Chroma 8x8 TrueMotion predictor offset.
pub const C8TM8: usize = C8DC8 + 16;
/// Chroma 8x8 vertical predictor offset.
pub const C8VE8: usize = C8DC8 + 8 * BPS;
/// Chroma 8x8 horizontal predictor offset.
pub const C8HE8: usize = C8VE8 + 16;
/// 4x4 predictor offsets, in mode order (DC, TM, VE, HE, RD, VR, LD, VL, HD, HU).
pub const I4DC4: usize = 3 * 16 * BPS;
pub const I4TM4: usize = I4DC4 + 4;
pub const I4VE4: usize = I4DC4 + 8;
pub const I4HE4: usize = I4DC4 + 12;
pub const I4RD4: usize = I4DC4 + 16;
pub const I4VR4: usize = I4DC4 + 20;
pub const I4LD4: usize = I4DC4 + 24;
pub const I4VL4: usize = I4DC4 + 28;
pub const I4HD4: usize = I4DC4 + 4 * BPS;
pub const I4HU4: usize = I4HD4 + 4;
/// Total size of the prediction scratch buffer.
pub const PRED_SIZE: usize = 3 * 16 * BPS + 8 * BPS;

/// Offsets of the sixteen luma 4x4 sub-blocks inside a scratch buffer,
/// in raster sub-block order.
pub const LUMA_BLOCK_OFFSETS: [usize; 16] = {
    let mut scan = [0; 16];
    let mut n = 0;
    while n < 16 {
        scan[n] = (n & 3) * 4 + (n >> 2) * 4 * BPS;
        n += 1;
    }
    scan
};

/// Offsets of the eight chroma 4x4 sub-blocks (U first, then V).
pub const CHROMA_BLOCK_OFFSETS: [usize; 8] = [
    U_OFF,
    U_OFF + 4,
    U_OFF + 4 * BPS,
    U_OFF + 4 + 4 * BPS,
    V_OFF,
    V_OFF + 4,
    V_OFF + 4 * BPS,
    V_OFF + 4 + 4 * BPS,
];

#[inline]
pub fn clip_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Sum of squared differences over a `w`x`h` area of two strided buffers.
pub fn sse_block(a: &[u8], b: &[u8], w: usize, h: usize) -> u32 {
    let mut sum = 0u32;
    for y in 0..h {
        let ra = &a[y * BPS..y * BPS + w];
        let rb = &b[y * BPS..y * BPS + w];
        for (&pa, &pb) in ra.iter().zip(rb.iter()) {
            let d = i32::from(pa) - i32::from(pb);
            sum += (d * d) as u32;
        }
    }
    sum
}

/// SSE over a full 16x16 luma block.
#[inline]
pub fn sse_16x16(a: &[u8], b: &[u8]) -> u32 {
    sse_block(a, b, 16, 16)
}

/// SSE over one 8x8 chroma block.
#[inline]
pub fn sse_8x8(a: &[u8], b: &[u8]) -> u32 {
    sse_block(a, b, 8, 8)
}

/// SSE over one 4x4 sub-block.
#[inline]
pub fn sse_4x4(a: &[u8], b: &[u8]) -> u32 {
    sse_block(a, b, 4, 4)
}

/// SSE over the two chroma 8x8 blocks of a scratch buffer.
#[inline]
pub fn sse_uv(a: &[u8], b: &[u8]) -> u32 {
    sse_8x8(&a[U_OFF..], &b[U_OFF..]) + sse_8x8(&a[V_OFF..], &b[V_OFF..])
}
