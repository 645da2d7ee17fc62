//! Lossy intra-only encoding core for block-based still images.
//!
//! This crate implements the macroblock layer of a VP8-style still-image
//! encoder: quantization parameter derivation, rate-distortion mode
//! decision, boolean arithmetic coding of the residual tokens, and the
//! scan/boundary bookkeeping that ties them together. It produces coded
//! partitions (mode partition + residual partition) and an optional
//! compressed alpha plane; container muxing and colorspace conversion are
//! left to the caller.
//!
//! # Encoding
//!
//! ```rust
//! use zenstill::{encode_frame, EncoderConfig, Picture};
//!
//! let (w, h) = (32usize, 24usize);
//! let y = vec![128u8; w * h];
//! let u = vec![128u8; (w / 2) * (h / 2)];
//! let v = vec![128u8; (w / 2) * (h / 2)];
//!
//! let config = EncoderConfig::new().with_quality(75.0).with_method(4);
//! let picture = Picture::new_yuv(&y, &u, &v, w as u32, h as u32)?;
//! let frame = encode_frame(&config, &picture)?;
//! assert!(!frame.residual_partition.is_empty());
//! # Ok::<(), zenstill::EncodingError>(())
//! ```
//!
//! The encoder is deterministic: the same picture and configuration always
//! produce the same bytes, whether the alpha plane is compressed on a
//! worker thread or inline.

#![forbid(unsafe_code)]

mod common;
mod encoder;
mod worker;

pub use encoder::api::{
    encode_frame, encode_frame_with_progress, EncodedFrame, EncodingError, EncodingStats, Picture,
    ProgressHook,
};
pub use encoder::config::{EmissionStrategy, EncoderConfig, RdLevel};
pub use worker::{Worker, WorkerKind};
