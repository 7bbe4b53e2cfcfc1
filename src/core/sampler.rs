use std::cmp::Ordering;
use std::collections::HashMap;

use rand::Rng;

use crate::core::config::ChatOptions;
use crate::core::error::{ChatError, Result};
use crate::core::types::Sampler;
use crate::core::vecops::{argmax, normalize, softmax};

/// Picks the next token from a logits buffer. The buffer is scratch space and may be
/// overwritten. The chat loop is generic over this so tests can script selections.
pub trait TokenSampler {
    fn sample(&mut self, logits: &mut [f32]) -> Result<usize>;
}

impl<R: Rng> Sampler<R> {
    pub fn new(temperature: f32, top_p: f32, rng: R) -> Self {
        Sampler {
            temperature,
            top_p,
            sorted: Vec::new(),
            rng
        }
    }

    pub fn from_options(options: &ChatOptions, rng: R) -> Self {
        Self::new(options.temperature, options.top_p, rng)
    }

    fn sample_mult(probabilities: &[f32], coin: f32) -> usize {
        // first candidate whose cumulative mass reaches the coin;
        // zeroed entries never qualify, even for a coin of exactly 0
        let mut cdf = 0.0;
        probabilities
            .iter()
            .position(|&p| {
                cdf += p;
                p > 0.0 && cdf >= coin
            })
            // in case of rounding errors
            .or_else(|| probabilities.iter().rposition(|&p| p > 0.0))
            .unwrap_or(probabilities.len() - 1)
    }

    fn apply_logit_bias(probabilities: &mut [f32], logit_bias: &HashMap<usize, f32>) {
        for p in probabilities.iter_mut() {
            *p = p.ln();
        }
        for (&token, &bias) in logit_bias {
            if let Some(logit) = probabilities.get_mut(token) {
                *logit += bias;
            }
        }
        for p in probabilities.iter_mut() {
            *p = p.exp();
        }
        normalize(probabilities);
    }

    fn apply_top_p(&mut self, probabilities: &mut [f32], top_p: f32) {
        // top-p sampling (or "nucleus sampling") samples from the smallest set of
        // tokens whose cumulative probability exceeds top_p. The probability of the
        // token where the running sum first crosses top_p is the cutoff.
        self.sorted.clear();
        self.sorted.extend_from_slice(probabilities);
        self.sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));

        let mut cumulative_prob = 0.0;
        let cutoff = self.sorted
            .iter()
            .copied()
            .find(|&p| {
                cumulative_prob += p;
                cumulative_prob > top_p
            })
            // rounding kept the total at or below top_p: nothing to cut
            .unwrap_or(0.0);

        for p in probabilities.iter_mut() {
            if *p < cutoff {
                *p = 0.0;
            }
        }
    }

    /// Samples a token id from raw `logits`, rewriting the buffer into the final
    /// probability vector on the way.
    ///
    /// `logits` must be finite (single entries of -inf are allowed). A `top_p` of 0 is
    /// treated as 1. With a temperature of 0 the most likely token after bias is
    /// returned and neither top-p nor the random source is touched.
    pub fn sample_logits(&mut self, logits: &mut [f32], logit_bias: &HashMap<usize, f32>) -> Result<usize> {
        if !(self.temperature >= 0.0) {
            return Err(ChatError::parameter(
                "temperature",
                format!("must be non-negative, got {}", self.temperature),
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ChatError::parameter(
                "top_p",
                format!("must be in [0, 1], got {}", self.top_p),
            ));
        }
        if logits.is_empty() {
            return Err(ChatError::parameter("logits", "empty logits vector"));
        }
        let top_p = if self.top_p == 0.0 { 1.0 } else { self.top_p };

        softmax(logits);
        if !logit_bias.is_empty() {
            Self::apply_logit_bias(logits, logit_bias);
        }

        if self.temperature == 0.0 {
            return Ok(argmax(logits));
        }

        if top_p < 1.0 {
            self.apply_top_p(logits, top_p);
        }

        if self.temperature != 1.0 {
            let inv_temperature = 1.0 / self.temperature;
            for p in logits.iter_mut() {
                *p = p.powf(inv_temperature);
            }
        }
        normalize(logits);

        let coin: f32 = self.rng.gen();
        Ok(Self::sample_mult(logits, coin))
    }
}

impl<T: TokenSampler + ?Sized> TokenSampler for &mut T {
    fn sample(&mut self, logits: &mut [f32]) -> Result<usize> {
        (**self).sample(logits)
    }
}

impl<R: Rng> TokenSampler for Sampler<R> {
    fn sample(&mut self, logits: &mut [f32]) -> Result<usize> {
        self.sample_logits(logits, &HashMap::new())
    }
}
