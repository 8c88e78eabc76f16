//! Model implementations.

pub mod llama;
