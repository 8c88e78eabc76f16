use std::path::PathBuf;

use snafu::Snafu;

use crate::error::BoxedError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TokenizerError {
    #[snafu(display("Couldn't encode text into piece identifiers"))]
    Encode { source: BoxedError },

    #[snafu(display("Couldn't decode piece identifiers into a string"))]
    Decode { source: BoxedError },

    #[snafu(display("Cannot load tokenizer: {}", path.to_string_lossy()))]
    Load { source: BoxedError, path: PathBuf },
}

/// Trait implemented by tokenizers.
pub trait Tokenizer: Send + Sync {
    /// Number of pieces in the vocabulary, including special pieces.
    fn n_words(&self) -> usize;

    /// Identifier of the beginning-of-sequence piece.
    fn bos_id(&self) -> Option<u32>;

    /// Identifier of the end-of-sequence piece.
    fn eos_id(&self) -> Option<u32>;

    /// Split a text into piece identifiers.
    ///
    /// * `text` - The text to encode.
    /// * `bos` - Prepend the beginning-of-sequence piece.
    /// * `eos` - Append the end-of-sequence piece.
    fn encode(&self, text: &str, bos: bool, eos: bool) -> Result<Vec<u32>, TokenizerError>;

    /// Reconstruct a string from piece identifiers.
    ///
    /// Special pieces are skipped.
    fn decode(&self, ids: &[u32]) -> Result<String, TokenizerError>;
}
