//! Tokenizers.

mod hf_tokenizer;
pub use hf_tokenizer::HfTokenizer;

mod tokenizer;
pub use tokenizer::{Tokenizer, TokenizerError};
