//! Token buffering and worker behavior through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use zenstill::{
    encode_frame, encode_frame_with_progress, EmissionStrategy, EncoderConfig, EncodingError,
    Picture, Worker, WorkerKind,
};

fn textured_picture(buf: &mut (Vec<u8>, Vec<u8>, Vec<u8>), w: usize, h: usize) {
    buf.0 = (0..w * h).map(|i| ((i * 37 + i / w * 11) % 256) as u8).collect();
    buf.1 = vec![100; (w / 2) * (h / 2)];
    buf.2 = vec![180; (w / 2) * (h / 2)];
}

#[test]
fn token_page_size_does_not_change_the_bitstream() {
    let mut planes = (vec![], vec![], vec![]);
    textured_picture(&mut planes, 64, 64);
    let pic = Picture::new_yuv(&planes.0, &planes.1, &planes.2, 64, 64).unwrap();

    let tiny = encode_frame(
        &EncoderConfig::new().with_token_page_size(16),
        &pic,
    )
    .unwrap();
    let huge = encode_frame(
        &EncoderConfig::new().with_token_page_size(1 << 16),
        &pic,
    )
    .unwrap();
    assert_eq!(tiny.residual_partition, huge.residual_partition);
    assert_eq!(tiny.mode_partition, huge.mode_partition);
}

#[test]
fn single_pass_and_two_pass_agree_on_reconstruction() {
    let mut planes = (vec![], vec![], vec![]);
    textured_picture(&mut planes, 48, 48);
    let pic = Picture::new_yuv(&planes.0, &planes.1, &planes.2, 48, 48).unwrap();

    let two = encode_frame(&EncoderConfig::new(), &pic).unwrap();
    let one = encode_frame(
        &EncoderConfig::new().with_emission_strategy(EmissionStrategy::SinglePass),
        &pic,
    )
    .unwrap();
    // the mode decision is independent of the emission strategy
    assert_eq!(two.stats.luma_sse, one.stats.luma_sse);
    assert_eq!(two.stats.i4_count, one.stats.i4_count);
}

#[test]
fn threaded_alpha_matches_inline_alpha() {
    let mut planes = (vec![], vec![], vec![]);
    textured_picture(&mut planes, 32, 32);
    let alpha: Vec<u8> = (0..32 * 32).map(|i| (255 - i % 200) as u8).collect();
    let pic = Picture::new_yuv(&planes.0, &planes.1, &planes.2, 32, 32)
        .unwrap()
        .with_alpha(&alpha)
        .unwrap();

    let inline = encode_frame(&EncoderConfig::new(), &pic).unwrap();
    let threaded = encode_frame(&EncoderConfig::new().with_threads(true), &pic).unwrap();
    assert!(inline.alpha.is_some());
    assert_eq!(inline.alpha, threaded.alpha);
    assert_eq!(inline.residual_partition, threaded.residual_partition);
}

#[test]
fn worker_lifecycle_runs_jobs_between_reset_and_end() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut w = Worker::new(WorkerKind::Threaded);
    assert!(w.reset());
    for _ in 0..3 {
        let c = Arc::clone(&counter);
        w.launch(move || {
            c.fetch_add(1, Ordering::SeqCst);
            true
        });
        assert!(w.sync());
    }
    w.end();
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn worker_end_twice_and_sync_idle_are_harmless() {
    let mut w = Worker::new(WorkerKind::Synchronous);
    assert!(w.reset());
    assert!(w.sync());
    w.end();
    w.end();

    let mut t = Worker::new(WorkerKind::Threaded);
    assert!(t.reset());
    assert!(t.sync());
    t.end();
    t.end();
}

#[test]
fn worker_failure_survives_until_reset() {
    let mut w = Worker::new(WorkerKind::Threaded);
    assert!(w.reset());
    w.launch(|| false);
    assert!(!w.sync());
    assert!(w.reset());
    w.launch(|| true);
    assert!(w.sync());
    w.end();
}

#[test]
fn abort_mid_scan_stops_the_encode() {
    let mut planes = (vec![], vec![], vec![]);
    textured_picture(&mut planes, 64, 64);
    let pic = Picture::new_yuv(&planes.0, &planes.1, &planes.2, 64, 64).unwrap();
    // allow the early reports, refuse once the scan is underway
    let hook = |percent: i32| percent < 50;
    let result = encode_frame_with_progress(&EncoderConfig::new(), &pic, &hook);
    assert!(matches!(result, Err(EncodingError::Aborted)));
}
