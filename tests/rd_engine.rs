//! End-to-end checks of the mode decision through the public API.

use zenstill::{encode_frame, EncoderConfig, Picture};

fn noisy_planes(w: usize, h: usize, seed: usize) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let mut y = vec![0u8; w * h];
    for (i, p) in y.iter_mut().enumerate() {
        *p = ((i * 31 + seed * 17 + (i * i) % 97) % 256) as u8;
    }
    let u = (0..(w / 2) * (h / 2))
        .map(|i| ((i * 13 + seed) % 256) as u8)
        .collect();
    let v = (0..(w / 2) * (h / 2))
        .map(|i| ((i * 7 + seed * 3) % 256) as u8)
        .collect();
    (y, u, v)
}

#[test]
fn flat_frame_reconstructs_exactly_and_skips() {
    let (w, h) = (64u32, 64u32);
    let y = vec![128u8; 64 * 64];
    let c = vec![128u8; 32 * 32];
    let pic = Picture::new_yuv(&y, &c, &c, w, h).unwrap();
    let frame = encode_frame(&EncoderConfig::new().with_quality(75.0), &pic).unwrap();
    assert_eq!(frame.stats.skip_count, 16);
    assert_eq!(frame.stats.luma_sse, 0);
    assert_eq!(frame.stats.i4_count, 0);
}

#[test]
fn every_method_encodes_and_is_deterministic() {
    let (y, u, v) = noisy_planes(48, 48, 1);
    let pic = Picture::new_yuv(&y, &u, &v, 48, 48).unwrap();
    for method in 0..=6 {
        let config = EncoderConfig::new().with_method(method).with_quality(50.0);
        let a = encode_frame(&config, &pic).unwrap();
        let b = encode_frame(&config, &pic).unwrap();
        assert_eq!(
            a.residual_partition, b.residual_partition,
            "method {method} not deterministic"
        );
        assert!(!a.mode_partition.is_empty());
    }
}

#[test]
fn lower_quality_spends_fewer_residual_bytes() {
    let (y, u, v) = noisy_planes(64, 64, 2);
    let pic = Picture::new_yuv(&y, &u, &v, 64, 64).unwrap();
    let small = encode_frame(&EncoderConfig::new().with_quality(10.0), &pic).unwrap();
    let large = encode_frame(&EncoderConfig::new().with_quality(95.0), &pic).unwrap();
    assert!(
        small.residual_partition.len() < large.residual_partition.len(),
        "{} vs {}",
        small.residual_partition.len(),
        large.residual_partition.len()
    );
}

#[test]
fn higher_quality_reconstructs_closer() {
    let (y, u, v) = noisy_planes(64, 64, 3);
    let pic = Picture::new_yuv(&y, &u, &v, 64, 64).unwrap();
    let coarse = encode_frame(&EncoderConfig::new().with_quality(5.0), &pic).unwrap();
    let fine = encode_frame(&EncoderConfig::new().with_quality(95.0), &pic).unwrap();
    assert!(fine.stats.luma_sse < coarse.stats.luma_sse);
}

#[test]
fn segment_quantizers_stay_in_range() {
    let (y, u, v) = noisy_planes(96, 64, 4);
    let pic = Picture::new_yuv(&y, &u, &v, 96, 64).unwrap();
    let frame = encode_frame(&EncoderConfig::new().with_segments(4), &pic).unwrap();
    assert!(frame.stats.segment_count >= 1 && frame.stats.segment_count <= 4);
    for s in 0..frame.stats.segment_count {
        let q = frame.stats.segment_quant[s];
        assert!((0..=127).contains(&q), "quant {q} out of range");
    }
    for level in frame.filter_levels {
        assert!((0..=63).contains(&level));
    }
}

#[test]
fn odd_dimensions_encode_with_replicated_borders() {
    // 33x17 forces partial macroblocks on both edges
    let (w, h) = (33usize, 17usize);
    let y: Vec<u8> = (0..w * h).map(|i| (i % 256) as u8).collect();
    let cw = (w + 1) / 2;
    let ch = (h + 1) / 2;
    let u = vec![90u8; cw * ch];
    let v = vec![160u8; cw * ch];
    let pic = Picture::new_yuv(&y, &u, &v, w as u32, h as u32).unwrap();
    let frame = encode_frame(&EncoderConfig::new(), &pic).unwrap();
    assert!(!frame.residual_partition.is_empty());
    // 3x2 macroblocks
    assert_eq!(
        frame.stats.i16_count + frame.stats.i4_count,
        6,
        "every macroblock is counted exactly once"
    );
}

#[test]
fn slow_methods_do_not_code_more_than_fast_ones() {
    // Trellis should shave residual bytes off on textured content.
    let (y, u, v) = noisy_planes(64, 64, 5);
    let pic = Picture::new_yuv(&y, &u, &v, 64, 64).unwrap();
    let fast = encode_frame(&EncoderConfig::new().with_method(3).with_quality(50.0), &pic).unwrap();
    let slow = encode_frame(&EncoderConfig::new().with_method(6).with_quality(50.0), &pic).unwrap();
    // allow a small margin: the trellis optimizes rate*lambda+distortion,
    // not bytes alone
    assert!(slow.residual_partition.len() <= fast.residual_partition.len() * 21 / 20);
}
