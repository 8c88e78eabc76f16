use candle_transformers::generation::Sampling;

/// Generation options.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerateOptions {
    pub max_gen_len: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub stop_ids: Vec<u32>,
    pub stop_words: Vec<String>,
    pub seed: u64,
}

impl GenerateOptions {
    /// Maximum number of pieces to generate.
    ///
    /// Default: `5`
    pub fn max_gen_len(mut self, max_gen_len: usize) -> Self {
        self.max_gen_len = max_gen_len;
        self
    }

    /// Sampling temperature, pieces are picked greedily when the
    /// temperature is zero.
    ///
    /// Default: `0.8`
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Probability mass of the pieces that nucleus sampling picks from.
    ///
    /// Default: `0.95`
    pub fn top_p(mut self, top_p: f64) -> Self {
        self.top_p = top_p;
        self
    }

    /// Pieces that end a sequence, in addition to the end-of-sequence piece.
    ///
    /// Default: none
    pub fn stop_ids(mut self, stop_ids: Vec<u32>) -> Self {
        self.stop_ids = stop_ids;
        self
    }

    /// Words that end a sequence. The generated text is cut before the
    /// first stop word.
    ///
    /// Default: none
    pub fn stop_words(mut self, stop_words: Vec<String>) -> Self {
        self.stop_words = stop_words;
        self
    }

    /// Seed of the sampler.
    ///
    /// Default: `299792458`
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub(crate) fn sampling(&self) -> Sampling {
        if self.temperature <= 0. {
            Sampling::ArgMax
        } else {
            Sampling::TopP {
                p: self.top_p,
                temperature: self.temperature,
            }
        }
    }
}

impl Default for GenerateOptions {
    fn default() -> Self {
        GenerateOptions {
            max_gen_len: 5,
            temperature: 0.8,
            top_p: 0.95,
            stop_ids: Vec::new(),
            stop_words: Vec::new(),
            seed: 299792458,
        }
    }
}
