use std::path::Path;

use snafu::ResultExt;
use tokenizers::tokenizer::Tokenizer as HuggingFaceTokenizer;

use super::tokenizer::{DecodeSnafu, EncodeSnafu, LoadSnafu, Tokenizer, TokenizerError};

static BOS_PIECE: &str = "<s>";
static EOS_PIECE: &str = "</s>";

/// Wraps the tokenizers from the Hugging Face `tokenizers` package.
///
/// Special pieces are added by the wrapper, so that it does not depend on
/// the post-processor of the tokenizer definition.
pub struct HfTokenizer {
    tokenizer: HuggingFaceTokenizer,
    n_words: usize,
    bos_id: Option<u32>,
    eos_id: Option<u32>,
}

impl HfTokenizer {
    pub fn new(tokenizer: HuggingFaceTokenizer) -> Self {
        let bos_id = tokenizer.token_to_id(BOS_PIECE);
        let eos_id = tokenizer.token_to_id(EOS_PIECE);
        // Added pieces can also be in the model vocabulary, so the number of
        // pieces is derived from the largest identifier.
        let n_words = tokenizer
            .get_vocab(true)
            .values()
            .max()
            .map_or(0, |&max_id| max_id as usize + 1);
        HfTokenizer {
            tokenizer,
            n_words,
            bos_id,
            eos_id,
        }
    }

    /// Load a tokenizer from a `tokenizer.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TokenizerError> {
        let path = path.as_ref();
        let tokenizer = HuggingFaceTokenizer::from_file(path).context(LoadSnafu { path })?;
        Ok(Self::new(tokenizer))
    }
}

impl Tokenizer for HfTokenizer {
    fn n_words(&self) -> usize {
        self.n_words
    }

    fn bos_id(&self) -> Option<u32> {
        self.bos_id
    }

    fn eos_id(&self) -> Option<u32> {
        self.eos_id
    }

    fn encode(&self, text: &str, bos: bool, eos: bool) -> Result<Vec<u32>, TokenizerError> {
        let encoding = self.tokenizer.encode(text, false).context(EncodeSnafu)?;

        let mut ids = Vec::with_capacity(encoding.len() + 2);
        if let (true, Some(bos_id)) = (bos, self.bos_id) {
            ids.push(bos_id);
        }
        ids.extend_from_slice(encoding.get_ids());
        if let (true, Some(eos_id)) = (eos, self.eos_id) {
            ids.push(eos_id);
        }

        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String, TokenizerError> {
        self.tokenizer.decode(ids, true).context(DecodeSnafu)
    }
}
