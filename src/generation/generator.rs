use std::sync::Arc;

use candle_core::{Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use snafu::{ensure, ResultExt, Snafu};

use super::options::GenerateOptions;
use super::stats::GenerationStats;
use crate::architectures::CausalLM;
use crate::error::BoxedError;
use crate::tokenizers::{Tokenizer, TokenizerError};

#[derive(Debug, Snafu)]
pub enum GeneratorError {
    #[snafu(display("Cannot generate for an empty batch"))]
    EmptyBatch,

    #[snafu(display("Batch size {batch_size} exceeds the maximum batch size {max_batch_size}"))]
    BatchTooLarge {
        batch_size: usize,
        max_batch_size: usize,
    },

    #[snafu(display("Prompt {index} has no pieces"))]
    EmptyPrompt { index: usize },

    #[snafu(display("Prompt of {len} pieces exceeds the maximum sequence length {max_seq_len}"))]
    PromptTooLong { len: usize, max_seq_len: usize },

    #[snafu(display("Tokenizer error"))]
    Tokenize { source: TokenizerError },

    #[snafu(display("Cannot run model"))]
    Model { source: BoxedError },

    #[snafu(display("Cannot create piece tensor"))]
    PieceTensor { source: candle_core::Error },

    #[snafu(display("Cannot sample next piece"))]
    Sample { source: candle_core::Error },
}

/// Batched text generation.
///
/// Prompts of different lengths are decoded together: decoding starts at
/// the length of the shortest prompt and prompts that are longer keep
/// their own pieces until they are exhausted. Every prompt gets at most
/// `max_gen_len` generated pieces.
pub struct Generator {
    tokenizer: Arc<dyn Tokenizer>,
    max_seq_len: usize,
    max_batch_size: usize,
}

impl Generator {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, max_seq_len: usize, max_batch_size: usize) -> Self {
        Generator {
            tokenizer,
            max_seq_len,
            max_batch_size,
        }
    }

    /// Generate continuations of `prompts`.
    ///
    /// Returns the prompts with their continuations and generation
    /// statistics. The run time is not measured, see
    /// [GenerationStats::finish].
    pub fn generate<S: AsRef<str>>(
        &self,
        model: &mut dyn CausalLM,
        prompts: &[S],
        options: &GenerateOptions,
    ) -> Result<(Vec<String>, GenerationStats), GeneratorError> {
        let batch_size = prompts.len();
        ensure!(batch_size > 0, EmptyBatchSnafu);
        ensure!(
            batch_size <= self.max_batch_size,
            BatchTooLargeSnafu {
                batch_size,
                max_batch_size: self.max_batch_size
            }
        );

        let prompt_pieces = prompts
            .iter()
            .map(|prompt| self.tokenizer.encode(prompt.as_ref(), true, false))
            .collect::<Result<Vec<_>, _>>()
            .context(TokenizeSnafu)?;
        for (index, pieces) in prompt_pieces.iter().enumerate() {
            ensure!(!pieces.is_empty(), EmptyPromptSnafu { index });
        }
        let min_prompt_len = prompt_pieces.iter().map(Vec::len).min().unwrap_or(0);
        let max_prompt_len = prompt_pieces.iter().map(Vec::len).max().unwrap_or(0);
        ensure!(
            max_prompt_len <= self.max_seq_len,
            PromptTooLongSnafu {
                len: max_prompt_len,
                max_seq_len: self.max_seq_len
            }
        );
        let total_len = self.max_seq_len.min(options.max_gen_len + max_prompt_len);

        model.reset().context(ModelSnafu)?;
        let mut logits_processor = LogitsProcessor::from_sampling(options.seed, options.sampling());
        let eos_id = self.tokenizer.eos_id();
        let padding_id = eos_id.unwrap_or(0);

        let mut pieces = prompt_pieces.clone();
        let mut generated = vec![Vec::new(); batch_size];
        let mut finished = vec![options.max_gen_len == 0; batch_size];
        let mut prev_pos = 0;
        for cur_pos in min_prompt_len..total_len {
            if finished.iter().all(|&finished| finished) {
                break;
            }

            let input: Vec<u32> = pieces
                .iter()
                .flat_map(|sequence| sequence[prev_pos..cur_pos].iter().copied())
                .collect();
            let input = Tensor::from_vec(input, (batch_size, cur_pos - prev_pos), &Device::Cpu)
                .context(PieceTensorSnafu)?;
            let logits = model.last_logits(&input, prev_pos).context(ModelSnafu)?;

            for row in 0..batch_size {
                // The next piece is still part of the prompt.
                if cur_pos < prompt_pieces[row].len() {
                    continue;
                }

                if finished[row] {
                    pieces[row].push(padding_id);
                    continue;
                }

                let row_logits = logits.get(row).context(SampleSnafu)?;
                let piece = logits_processor.sample(&row_logits).context(SampleSnafu)?;
                pieces[row].push(piece);

                if Some(piece) == eos_id || options.stop_ids.contains(&piece) {
                    finished[row] = true;
                    continue;
                }

                generated[row].push(piece);
                if generated[row].len() >= options.max_gen_len {
                    finished[row] = true;
                } else if !options.stop_words.is_empty() {
                    let (text, offset) =
                        self.decode_with_offset(&prompt_pieces[row], &generated[row])?;
                    finished[row] = find_stop_word(&text[offset..], &options.stop_words).is_some();
                }
            }

            prev_pos = cur_pos;
        }

        let texts = prompt_pieces
            .iter()
            .zip(&generated)
            .map(|(prompt, generated)| {
                let (mut text, offset) = self.decode_with_offset(prompt, generated)?;
                if let Some(stop) = find_stop_word(&text[offset..], &options.stop_words) {
                    text.truncate(offset + stop);
                }
                Ok(text)
            })
            .collect::<Result<Vec<_>, GeneratorError>>()?;

        let stats = GenerationStats {
            num_generated_tokens: generated.iter().map(Vec::len).collect(),
            prompt_tokens: prompt_pieces.iter().map(Vec::len).collect(),
            ..Default::default()
        };

        Ok((texts, stats))
    }

    /// Decode a prompt with its continuation.
    ///
    /// Returns the text and the byte offset at which the continuation starts.
    fn decode_with_offset(
        &self,
        prompt: &[u32],
        generated: &[u32],
    ) -> Result<(String, usize), GeneratorError> {
        let prompt_text = self.tokenizer.decode(prompt).context(TokenizeSnafu)?;
        let sequence: Vec<u32> = prompt.iter().chain(generated).copied().collect();
        let text = self.tokenizer.decode(&sequence).context(TokenizeSnafu)?;

        // Decoding can merge the prompt with the continuation, in that case
        // the whole text is searched for stop words.
        let offset = if text.starts_with(&prompt_text) {
            prompt_text.len()
        } else {
            0
        };

        Ok((text, offset))
    }
}

/// Byte offset of the earliest stop word in `text`.
fn find_stop_word(text: &str, stop_words: &[String]) -> Option<usize> {
    stop_words
        .iter()
        .filter(|word| !word.is_empty())
        .filter_map(|word| text.find(word.as_str()))
        .min()
}
