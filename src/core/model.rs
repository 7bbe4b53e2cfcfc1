use std::path::Path;

use tracing::{debug, info};

use crate::core::config::ChatOptions;
use crate::core::error::{ChatError, Result};
use crate::core::sampler::TokenSampler;
use crate::core::types::{ChatModel, Tokenizer, TurnOutput};

/// Per-token evaluation contract of a recurrent inference engine.
///
/// The engine is a black box: it seeds hidden-state buffers and advances them one token
/// at a time, writing the logits for the next token. State and logits buffers are owned
/// by the caller; `state` is read and overwritten in place.
///
/// Implementations that are `Sync` promise that concurrent `eval` calls with distinct
/// buffers are safe; the chat layer never evaluates one session from two threads.
pub trait Engine {
    fn state_len(&self) -> usize;
    fn logits_len(&self) -> usize;
    fn init_state(&self, state: &mut [f32]);
    /// Advances `state` by `token`. An error leaves `state` and `logits` unspecified.
    fn eval(&self, token: usize, state: &mut [f32], logits: &mut [f32]) -> Result<()>;
}

/// Engines that can be created from a model file. Resources are released on drop.
pub trait LoadEngine: Engine + Sized {
    fn load(model_path: &Path, threads: u32) -> Result<Self>;
}

impl<E: Engine> ChatModel<E> {
    pub fn new(engine: E, tokenizer: Tokenizer, threads: u32) -> Self {
        ChatModel { engine, tokenizer, threads }
    }

    pub fn from_file(model_path: impl AsRef<Path>, tokenizer: Tokenizer, threads: u32) -> Result<Self>
    where
        E: LoadEngine,
    {
        let model_path = model_path.as_ref();
        if !model_path.is_file() {
            return Err(ChatError::ResourceNotFound(model_path.to_path_buf()));
        }
        let engine = E::load(model_path, threads)?;
        info!(
            path = %model_path.display(),
            threads,
            state_len = engine.state_len(),
            logits_len = engine.logits_len(),
            "model loaded"
        );
        Ok(Self::new(engine, tokenizer, threads))
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn threads(&self) -> u32 {
        self.threads
    }

    pub fn encode(&self, text: &str) -> Vec<usize> {
        self.tokenizer.encode(text)
    }

    pub fn decode(&self, tokens: &[usize]) -> String {
        self.tokenizer.decode_text(tokens)
    }

    pub fn fresh_state(&self) -> Vec<f32> {
        let mut state = vec![0f32; self.engine.state_len()];
        self.engine.init_state(&mut state);
        state
    }

    pub fn new_logits(&self) -> Vec<f32> {
        vec![0f32; self.engine.logits_len()]
    }

    /// Feeds `tokens` one by one; `logits` ends up holding the prediction after the last one.
    pub fn eval_sequence(&self, tokens: &[usize], state: &mut [f32], logits: &mut [f32]) -> Result<()> {
        for &token in tokens {
            self.engine.eval(token, state, logits)?;
        }
        debug!(tokens = tokens.len(), "sequence evaluated");
        Ok(())
    }

    /// Continues `prompt` from a fresh state without chat formatting or penalties,
    /// stopping at the first stop sequence in `options` or after `max_tokens`.
    pub fn complete<S: TokenSampler>(
        &self,
        prompt: &str,
        options: &ChatOptions,
        sampler: &mut S,
    ) -> Result<TurnOutput> {
        self.session(sampler, options.clone())?.predict(prompt)
    }
}
