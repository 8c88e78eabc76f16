//! Transformer building blocks used by `llama-dispatch`.
//!
//! The layers in this crate read their parameters through [varbuilder::VarBuilder],
//! which shares one checkpoint backend between several devices. This is what
//! allows a model to be split up layer by layer over the devices of a process.

pub mod error;

pub mod kv_cache;

pub mod layers;

pub mod varbuilder;

#[cfg(any(test, feature = "test-util"))]
pub mod util;
