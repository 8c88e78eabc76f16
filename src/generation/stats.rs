use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Statistics of a generation run.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct GenerationStats {
    /// Number of generated pieces per prompt, stop pieces excluded.
    pub num_generated_tokens: Vec<usize>,

    /// Number of prompt pieces per prompt, including the
    /// beginning-of-sequence piece.
    pub prompt_tokens: Vec<usize>,

    /// Wall-clock time of the run.
    pub total_seconds: f64,

    /// Largest number of pieces generated for a prompt.
    pub toks: usize,

    /// `toks` divided by `total_seconds`.
    pub tokens_per_second: f64,
}

impl GenerationStats {
    /// Record the duration of the run and derive the throughput.
    pub fn finish(&mut self, elapsed: Duration) {
        self.total_seconds = elapsed.as_secs_f64();
        self.toks = self.num_generated_tokens.iter().copied().max().unwrap_or(0);
        self.tokens_per_second = if self.total_seconds > 0. {
            self.toks as f64 / self.total_seconds
        } else {
            0.
        };
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::GenerationStats;

    #[test]
    fn toks_is_the_longest_generation() {
        let mut stats = GenerationStats {
            num_generated_tokens: vec![3, 8, 5],
            prompt_tokens: vec![4, 2, 6],
            ..Default::default()
        };
        stats.finish(Duration::from_secs(2));
        assert_eq!(stats.toks, 8);
        assert_eq!(stats.total_seconds, 2.);
        assert_eq!(stats.tokens_per_second, 4.);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["num_generated_tokens"], serde_json::json!([3, 8, 5]));
        assert_eq!(json["toks"], 8);
    }

    #[test]
    fn empty_run_has_zero_throughput() {
        let mut stats = GenerationStats::default();
        stats.finish(Duration::ZERO);
        assert_eq!(stats.toks, 0);
        assert_eq!(stats.tokens_per_second, 0.);
    }
}
