//! Macroblock scan state: working buffers, neighbor reconstruction
//! context, non-zero bookkeeping and the 4x4 sub-block iteration.
//!
//! The iterator walks the picture in raster order. For each macroblock it
//! imports the source samples into a strided scratch buffer (replicating
//! edge samples past the picture border), exposes the reconstructed left
//! column and top row of the neighbors for prediction, and persists the
//! per-column non-zero bitmaps that drive the residual coding contexts.

use crate::common::{prediction, BPS, LUMA_BLOCK_OFFSETS, PRED_SIZE, U_OFF, V_OFF, YUV_SIZE, Y_OFF};

use super::api::{Picture, ProgressHook};

/// Per-side chroma DC diffusion errors: `[channel][slot]` where channel 0
/// is U and 1 is V.
pub type DiffusionError = [[i8; 2]; 2];

/// Boundary index of the topmost-left sample of each 4x4 sub-block inside
/// [`MbIterator::i4_boundary`]. The corner sits one below, the left column
/// at decreasing indices from there.
pub const TOP_LEFT_I4: [usize; 16] = [
    17, 21, 25, 29, //
    13, 17, 21, 25, //
    9, 13, 17, 21, //
    5, 9, 13, 17,
];

pub struct MbIterator {
    /// Current macroblock position, in macroblock units.
    pub x: usize,
    pub y: usize,
    pub mb_w: usize,
    pub mb_h: usize,
    width: usize,
    height: usize,

    /// Source samples of the current macroblock.
    pub yuv_in: [u8; YUV_SIZE],
    /// Committed reconstruction of the current macroblock.
    pub yuv_out: [u8; YUV_SIZE],
    /// Trial reconstruction buffer for the mode search.
    pub yuv_out2: [u8; YUV_SIZE],
    /// Prediction cache, one area per intra mode.
    pub yuv_p: [u8; PRED_SIZE],

    /// Reconstructed left column; `[0]` is the top-left corner sample.
    pub y_left: [u8; 17],
    pub u_left: [u8; 9],
    pub v_left: [u8; 9],
    /// Reconstructed bottom rows of the macroblock row above, 16 luma
    /// bytes per column.
    y_top: Vec<u8>,
    /// Same for chroma: 8 U bytes then 8 V bytes per column.
    uv_top: Vec<u8>,

    /// Per-column non-zero bitmaps; `nz[x]` doubles as the left context
    /// while the row is being rewritten in place.
    nz: Vec<u32>,
    pub top_nz: [u32; 9],
    pub left_nz: [u32; 9],

    /// Current 4x4 sub-block during the i4 iteration.
    pub i4: usize,
    /// 37 boundary samples shared by the sixteen sub-blocks: left column
    /// bottom-to-top, then the top row, then four top-right samples.
    pub i4_boundary: [u8; 37],

    /// Chroma DC error-diffusion terms carried across macroblocks.
    pub left_derr: DiffusionError,
    top_derr: Vec<DiffusionError>,

    count_down: usize,
    count_down0: usize,
    percent0: i32,
    percent: i32,
}

impl MbIterator {
    pub fn new(width: usize, height: usize) -> Self {
        let mb_w = (width + 15) / 16;
        let mb_h = (height + 15) / 16;
        let mut it = Self {
            x: 0,
            y: 0,
            mb_w,
            mb_h,
            width,
            height,
            yuv_in: [0; YUV_SIZE],
            yuv_out: [0; YUV_SIZE],
            yuv_out2: [0; YUV_SIZE],
            yuv_p: [0; PRED_SIZE],
            y_left: [0; 17],
            u_left: [0; 9],
            v_left: [0; 9],
            y_top: vec![127; mb_w * 16],
            uv_top: vec![127; mb_w * 16],
            nz: vec![0; mb_w + 1],
            top_nz: [0; 9],
            left_nz: [0; 9],
            i4: 0,
            i4_boundary: [0; 37],
            left_derr: [[0; 2]; 2],
            top_derr: vec![[[0; 2]; 2]; mb_w],
            count_down: 0,
            count_down0: 0,
            percent0: 0,
            percent: 0,
        };
        it.reset();
        it
    }

    /// Restart the scan at (0, 0) with pristine boundary state.
    pub fn reset(&mut self) {
        self.x = 0;
        self.y = 0;
        self.y_top.fill(127);
        self.uv_top.fill(127);
        self.nz.fill(0);
        self.top_derr.fill([[0; 2]; 2]);
        self.init_left();
        self.count_down = self.mb_w * self.mb_h;
        self.count_down0 = self.count_down;
    }

    fn init_left(&mut self) {
        let corner = if self.y > 0 { 129 } else { 127 };
        self.y_left[0] = corner;
        self.u_left[0] = corner;
        self.v_left[0] = corner;
        self.y_left[1..].fill(129);
        self.u_left[1..].fill(129);
        self.v_left[1..].fill(129);
        self.left_nz[8] = 0;
        self.left_derr = [[0; 2]; 2];
    }

    /// Advance to the next macroblock. Returns false once the scan is done.
    pub fn next(&mut self) -> bool {
        self.x += 1;
        if self.x == self.mb_w {
            self.x = 0;
            self.y += 1;
            self.init_left();
        }
        self.count_down -= 1;
        self.count_down > 0
    }

    //--------------------------------------------------------------------
    // Source import / reconstruction export

    /// Copy the current macroblock's source samples into `yuv_in`,
    /// replicating the last row/column past the picture border.
    pub fn import(&mut self, pic: &Picture<'_>) {
        let x = self.x * 16;
        let y = self.y * 16;
        let w = (self.width - x).min(16);
        let h = (self.height - y).min(16);
        import_block(
            pic.y_plane(),
            pic.y_stride(),
            x,
            y,
            &mut self.yuv_in[Y_OFF..],
            w,
            h,
            16,
        );
        let uv_w = (w + 1) / 2;
        let uv_h = (h + 1) / 2;
        import_block(
            pic.u_plane(),
            pic.uv_stride(),
            x / 2,
            y / 2,
            &mut self.yuv_in[U_OFF..],
            uv_w,
            uv_h,
            8,
        );
        import_block(
            pic.v_plane(),
            pic.uv_stride(),
            x / 2,
            y / 2,
            &mut self.yuv_in[V_OFF..],
            uv_w,
            uv_h,
            8,
        );
    }

    /// Copy the committed reconstruction out into full-size planes,
    /// clipping at the picture border.
    pub fn export(&self, y_out: &mut [u8], u_out: &mut [u8], v_out: &mut [u8]) {
        let x = self.x * 16;
        let y = self.y * 16;
        let w = (self.width - x).min(16);
        let h = (self.height - y).min(16);
        export_block(&self.yuv_out[Y_OFF..], y_out, self.width, x, y, w, h);
        let uv_w = (self.width + 1) / 2;
        export_block(
            &self.yuv_out[U_OFF..],
            u_out,
            uv_w,
            x / 2,
            y / 2,
            (w + 1) / 2,
            (h + 1) / 2,
        );
        export_block(
            &self.yuv_out[V_OFF..],
            v_out,
            uv_w,
            x / 2,
            y / 2,
            (w + 1) / 2,
            (h + 1) / 2,
        );
    }

    //--------------------------------------------------------------------
    // Neighbor context

    /// Reconstructed top row of the macroblock above (16 luma bytes), or
    /// None on the first row.
    pub fn y_top(&self) -> Option<&[u8]> {
        if self.y > 0 {
            Some(&self.y_top[self.x * 16..self.x * 16 + 16])
        } else {
            None
        }
    }

    /// Chroma top row, 8 U bytes then 8 V bytes.
    pub fn uv_top(&self) -> Option<&[u8]> {
        if self.y > 0 {
            Some(&self.uv_top[self.x * 16..self.x * 16 + 16])
        } else {
            None
        }
    }

    pub fn has_left(&self) -> bool {
        self.x > 0
    }

    pub fn has_top(&self) -> bool {
        self.y > 0
    }

    /// Persist the reconstructed right column and bottom row of `yuv_out`
    /// as prediction context for the neighbors. The corner sample must be
    /// taken before the top row is overwritten.
    pub fn save_boundary(&mut self) {
        let ysrc = &self.yuv_out[Y_OFF..];
        let uvsrc = &self.yuv_out[U_OFF..];
        if self.x < self.mb_w - 1 {
            for i in 0..16 {
                self.y_left[1 + i] = ysrc[15 + i * BPS];
            }
            for i in 0..8 {
                self.u_left[1 + i] = uvsrc[7 + i * BPS];
                self.v_left[1 + i] = uvsrc[15 + i * BPS];
            }
            // corner, read before the top rows are replaced below
            self.y_left[0] = self.y_top[self.x * 16 + 15];
            self.u_left[0] = self.uv_top[self.x * 16 + 7];
            self.v_left[0] = self.uv_top[self.x * 16 + 15];
        }
        if self.y < self.mb_h - 1 {
            let t = self.x * 16;
            self.y_top[t..t + 16].copy_from_slice(&ysrc[15 * BPS..15 * BPS + 16]);
            self.uv_top[t..t + 16].copy_from_slice(&uvsrc[7 * BPS..7 * BPS + 16]);
        }
    }

    //--------------------------------------------------------------------
    // Predictions

    /// Fill the four 16x16 luma predictors from the reconstructed
    /// neighbors.
    pub fn make_luma16_preds(&mut self) {
        let left = if self.x > 0 {
            Some(&self.y_left[..])
        } else {
            None
        };
        let top = if self.y > 0 {
            Some(&self.y_top[self.x * 16..self.x * 16 + 16])
        } else {
            None
        };
        prediction::make_luma16_preds(&mut self.yuv_p, left, top);
    }

    /// Fill the four 8x8 chroma predictors for U and V.
    pub fn make_chroma8_preds(&mut self) {
        let (left_u, left_v) = if self.x > 0 {
            (Some(&self.u_left[..]), Some(&self.v_left[..]))
        } else {
            (None, None)
        };
        let top = if self.y > 0 {
            Some(&self.uv_top[self.x * 16..self.x * 16 + 16])
        } else {
            None
        };
        prediction::make_chroma8_preds(&mut self.yuv_p, left_u, left_v, top);
    }

    /// Fill the ten 4x4 predictors for the current sub-block.
    pub fn make_i4_preds(&mut self) {
        prediction::make_i4_preds(&mut self.yuv_p, &self.i4_boundary, TOP_LEFT_I4[self.i4]);
    }

    //--------------------------------------------------------------------
    // Non-zero context

    /// Unpack the neighboring non-zero bitmaps into the per-block context
    /// bytes used while coding residuals.
    pub fn nz_to_bytes(&mut self) {
        let tnz = self.nz[self.x + 1];
        let lnz = self.nz[self.x];
        // bottom luma row of the block above
        self.top_nz[0] = tnz >> 12 & 1;
        self.top_nz[1] = tnz >> 13 & 1;
        self.top_nz[2] = tnz >> 14 & 1;
        self.top_nz[3] = tnz >> 15 & 1;
        // bottom U and V rows
        self.top_nz[4] = tnz >> 18 & 1;
        self.top_nz[5] = tnz >> 19 & 1;
        self.top_nz[6] = tnz >> 22 & 1;
        self.top_nz[7] = tnz >> 23 & 1;
        // DC of the block above
        self.top_nz[8] = tnz >> 24 & 1;

        // right luma column of the block on the left
        self.left_nz[0] = lnz >> 3 & 1;
        self.left_nz[1] = lnz >> 7 & 1;
        self.left_nz[2] = lnz >> 11 & 1;
        self.left_nz[3] = lnz >> 15 & 1;
        // right U and V columns
        self.left_nz[4] = lnz >> 17 & 1;
        self.left_nz[5] = lnz >> 19 & 1;
        self.left_nz[6] = lnz >> 21 & 1;
        self.left_nz[7] = lnz >> 23 & 1;
        // left_nz[8] is the DC flag, kept running across the row
    }

    /// Repack the context bytes updated during residual coding into the
    /// current column's bitmap.
    pub fn bytes_to_nz(&mut self) {
        let mut nz = 0u32;
        nz |= self.top_nz[0] << 12 | self.top_nz[1] << 13;
        nz |= self.top_nz[2] << 14 | self.top_nz[3] << 15;
        nz |= self.top_nz[4] << 18 | self.top_nz[5] << 19;
        nz |= self.top_nz[6] << 22 | self.top_nz[7] << 23;
        nz |= self.top_nz[8] << 24;
        nz |= self.left_nz[0] << 3 | self.left_nz[1] << 7;
        nz |= self.left_nz[2] << 11;
        nz |= self.left_nz[4] << 17 | self.left_nz[6] << 21;
        self.nz[self.x + 1] = nz;
    }

    /// Non-zero bitmap of the current macroblock.
    pub fn nz(&self) -> u32 {
        self.nz[self.x + 1]
    }

    pub fn set_nz(&mut self, nz: u32) {
        self.nz[self.x + 1] = nz;
    }

    //--------------------------------------------------------------------
    // Chroma DC diffusion errors

    pub fn top_derr(&self) -> DiffusionError {
        self.top_derr[self.x]
    }

    pub fn set_top_derr(&mut self, derr: DiffusionError) {
        self.top_derr[self.x] = derr;
    }

    //--------------------------------------------------------------------
    // 4x4 sub-block iteration

    /// Build the 37-sample boundary and position the iteration on
    /// sub-block 0.
    pub fn start_i4(&mut self) {
        self.i4 = 0;
        // left column, bottom to top, ending on the corner sample
        for i in 0..17 {
            self.i4_boundary[i] = self.y_left[16 - i];
        }
        // reconstructed top row
        for i in 0..16 {
            self.i4_boundary[17 + i] = match self.y_top() {
                Some(top) => top[i],
                None => 127,
            };
        }
        // top-right samples, from the next macroblock when available
        if self.y > 0 && self.x < self.mb_w - 1 {
            let t = (self.x + 1) * 16;
            for i in 0..4 {
                self.i4_boundary[33 + i] = self.y_top[t + i];
            }
        } else {
            let fill = self.i4_boundary[32];
            for i in 0..4 {
                self.i4_boundary[33 + i] = fill;
            }
        }
    }

    /// Fold the committed sub-block reconstruction into the boundary and
    /// advance; `trial` selects `yuv_out2` over `yuv_out` as the source.
    /// Returns false after the last sub-block.
    pub fn rotate_i4(&mut self, trial: bool) -> bool {
        let base = Y_OFF + LUMA_BLOCK_OFFSETS[self.i4];
        let buf = if trial { &self.yuv_out2 } else { &self.yuv_out };
        let mut bottom = [0u8; 4];
        let mut right = [0u8; 3];
        for i in 0..4 {
            bottom[i] = buf[base + i + 3 * BPS];
        }
        for i in 0..3 {
            right[i] = buf[base + 3 + (2 - i) * BPS];
        }
        let top = TOP_LEFT_I4[self.i4];
        // bottom row becomes the top row of the sub-block below
        self.i4_boundary[top - 4..top].copy_from_slice(&bottom);
        if self.i4 & 3 != 3 {
            // right column becomes the left column of the next sub-block
            self.i4_boundary[top..top + 3].copy_from_slice(&right);
        } else {
            // rightmost sub-blocks replicate their top-right samples
            for i in 0..4 {
                self.i4_boundary[top + i] = self.i4_boundary[top + 4 + i];
            }
        }
        self.i4 += 1;
        self.i4 < 16
    }

    //--------------------------------------------------------------------
    // Progress

    /// Set the percentage already reported before the scan starts.
    pub fn set_progress_base(&mut self, base: i32) {
        self.percent0 = base.clamp(0, 100);
        self.percent = self.percent0;
    }

    /// Map the scan position onto `delta` percent above the base and
    /// report it. Returns false if the hook requests an abort.
    pub fn progress(&mut self, delta: i32, hook: Option<&ProgressHook<'_>>) -> bool {
        let hook = match hook {
            Some(h) if delta > 0 => h,
            _ => return true,
        };
        let done = (self.count_down0 - self.count_down) as i32;
        let percent = if self.count_down0 == 0 {
            self.percent0
        } else {
            self.percent0 + delta * done / self.count_down0 as i32
        };
        let percent = percent.clamp(0, 100);
        if percent > self.percent {
            self.percent = percent;
            return hook(percent);
        }
        true
    }
}

fn import_block(
    src: &[u8],
    stride: usize,
    x: usize,
    y: usize,
    dst: &mut [u8],
    w: usize,
    h: usize,
    size: usize,
) {
    for row in 0..h {
        let s = (y + row) * stride + x;
        let d = row * BPS;
        dst[d..d + w].copy_from_slice(&src[s..s + w]);
        let pad = dst[d + w - 1];
        dst[d + w..d + size].fill(pad);
    }
    for row in h..size {
        let (prev, cur) = dst.split_at_mut(row * BPS);
        cur[..size].copy_from_slice(&prev[(row - 1) * BPS..(row - 1) * BPS + size]);
    }
}

fn export_block(src: &[u8], dst: &mut [u8], dst_w: usize, x: usize, y: usize, w: usize, h: usize) {
    for row in 0..h {
        let d = (y + row) * dst_w + x;
        dst[d..d + w].copy_from_slice(&src[row * BPS..row * BPS + w]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::api::Picture;

    fn gradient_picture(w: usize, h: usize) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let y: Vec<u8> = (0..w * h).map(|i| (i % 251) as u8).collect();
        let uv_w = (w + 1) / 2;
        let uv_h = (h + 1) / 2;
        let u = vec![90u8; uv_w * uv_h];
        let v = vec![180u8; uv_w * uv_h];
        (y, u, v)
    }

    #[test]
    fn first_macroblock_sees_default_boundaries() {
        let it = MbIterator::new(48, 48);
        assert_eq!(it.y_left[0], 127);
        assert_eq!(it.y_left[1], 129);
        assert!(it.y_top().is_none());
        assert!(!it.has_left());
    }

    #[test]
    fn second_row_corner_defaults_to_129() {
        let mut it = MbIterator::new(16, 32);
        it.next();
        assert_eq!(it.y, 1);
        assert_eq!(it.y_left[0], 129);
    }

    #[test]
    fn import_replicates_border_samples() {
        let (y, u, v) = gradient_picture(20, 20);
        let pic = Picture::new_yuv(&y, &u, &v, 20, 20).unwrap();
        let mut it = MbIterator::new(20, 20);
        it.next(); // (1, 0): only 4 source columns
        it.import(&pic);
        let last_real = it.yuv_in[Y_OFF + 3];
        for col in 4..16 {
            assert_eq!(it.yuv_in[Y_OFF + col], last_real);
        }
    }

    #[test]
    fn boundary_round_trip_through_save() {
        let (y, u, v) = gradient_picture(32, 32);
        let pic = Picture::new_yuv(&y, &u, &v, 32, 32).unwrap();
        let mut it = MbIterator::new(32, 32);
        it.import(&pic);
        // pretend the reconstruction equals the source
        it.yuv_out = it.yuv_in;
        it.save_boundary();
        let expected_left: Vec<u8> = (0..16).map(|i| it.yuv_out[Y_OFF + 15 + i * BPS]).collect();
        it.next();
        assert_eq!(&it.y_left[1..17], expected_left.as_slice());
        // the next row must see this macroblock's bottom row on top
        let bottom: Vec<u8> = (0..16)
            .map(|i| it.yuv_out[Y_OFF + 15 * BPS + i])
            .collect();
        while !(it.x == 0 && it.y == 1) {
            it.next();
        }
        assert_eq!(it.y_top().unwrap(), bottom.as_slice());
    }

    #[test]
    fn nz_bits_round_trip() {
        let mut it = MbIterator::new(64, 32);
        it.set_nz(0x01ff_ffff);
        it.nz_to_bytes();
        assert!(it.top_nz.iter().all(|&b| b == 1));
        it.bytes_to_nz();
        let nz = it.nz();
        for bit in [3, 7, 11, 12, 13, 14, 15, 17, 18, 19, 21, 22, 23, 24] {
            assert_eq!(nz >> bit & 1, 1, "bit {bit}");
        }
    }

    #[test]
    fn i4_iteration_visits_sixteen_blocks() {
        let mut it = MbIterator::new(16, 16);
        it.yuv_out.fill(100);
        it.start_i4();
        let mut count = 1;
        while it.rotate_i4(false) {
            count += 1;
        }
        assert_eq!(count, 16);
    }

    #[test]
    fn i4_boundary_replicates_top_right_on_last_column() {
        let mut it = MbIterator::new(16, 16);
        it.start_i4();
        // no next macroblock: samples 33..37 mirror sample 32
        let fill = it.i4_boundary[32];
        assert!(it.i4_boundary[33..37].iter().all(|&b| b == fill));
    }

    #[test]
    fn progress_is_monotone_and_capped() {
        let mut it = MbIterator::new(64, 64);
        it.set_progress_base(90);
        let reported = std::cell::RefCell::new(Vec::new());
        let hook = |p: i32| {
            reported.borrow_mut().push(p);
            true
        };
        while it.next() {
            assert!(it.progress(50, Some(&hook)));
        }
        let reported = reported.into_inner();
        assert!(reported.windows(2).all(|w| w[0] < w[1]));
        assert!(reported.iter().all(|&p| p <= 100));
    }
}
