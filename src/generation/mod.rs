//! Text generation.

mod generator;
pub use generator::{Generator, GeneratorError};

mod options;
pub use options::GenerateOptions;

mod stats;
pub use stats::GenerationStats;
