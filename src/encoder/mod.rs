//! The encoder proper: mode decision, quantization, token coding and the
//! frame scan that drives them.

pub(crate) mod alpha;
pub mod api;
pub(crate) mod analysis;
pub(crate) mod arithmetic;
pub mod config;
pub(crate) mod cost;
pub(crate) mod frame;
pub(crate) mod iterator;
pub(crate) mod quantize;
pub(crate) mod rd;
pub(crate) mod tables;
pub(crate) mod tokens;
pub(crate) mod trellis;
