//! Distributed LLaMA inference.
//!
//! This crate loads LLaMA checkpoints, splits the model into contiguous
//! blocks of layers over the ranks of a process group and the devices of
//! every rank, and generates text. Rank 0 tokenizes the prompts, runs the
//! first block of layers and samples from the logits that the last rank
//! sends back.

pub mod architectures;

pub mod checkpoint;

pub mod distributed;

pub mod error;

pub mod generation;

pub mod inference;

pub mod models;

pub mod placement;

pub mod tokenizers;

pub mod util;
