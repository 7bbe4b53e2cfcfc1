use std::thread::{Scope, ScopedJoinHandle};

use chrono::Utc;
use tracing::{debug, warn};

use crate::core::config::ChatOptions;
use crate::core::error::Result;
use crate::core::model::Engine;
use crate::core::sampler::TokenSampler;
use crate::core::stream::{stream_channel, Discard, PieceAssembler, StreamReceiver, TurnSink};
use crate::core::types::{ChatModel, Session, StopReason, TurnOutput};

impl<E: Engine> ChatModel<E> {
    /// Opens a context from a fresh engine state.
    pub fn session<S: TokenSampler>(&self, sampler: S, options: ChatOptions) -> Result<Session<'_, E, S>> {
        options.validate()?;
        Ok(Session {
            model: self,
            sampler,
            options,
            state: self.fresh_state(),
            logits: self.new_logits(),
            evaluated: 0
        })
    }
}

impl<'m, E: Engine, S: TokenSampler> Session<'m, E, S> {
    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    pub fn state(&self) -> &[f32] {
        &self.state
    }

    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    pub fn evaluated(&self) -> usize {
        self.evaluated
    }

    /// Forgets everything fed so far.
    pub fn reset(&mut self) {
        self.model.engine().init_state(&mut self.state);
        self.logits.fill(0.0);
        self.evaluated = 0;
    }

    /// Feeds `input` into the running context, then continues it until a stop sequence
    /// or `max_tokens`. The generated tokens stay in the context for the next call.
    pub fn predict(&mut self, input: &str) -> Result<TurnOutput> {
        self.predict_into(input, &mut Discard)
    }

    /// Like [`predict`](Self::predict), handing validated fragments to `sink`.
    /// After an error the context is no longer trustworthy; call [`reset`](Self::reset).
    pub fn predict_into<K: TurnSink + ?Sized>(&mut self, input: &str, sink: &mut K) -> Result<TurnOutput> {
        let result = self.generate(input, sink);
        if let Err(e) = &result {
            warn!(error = %e, "prediction aborted");
        }
        result
    }

    /// Runs [`predict_into`](Self::predict_into) on a thread of `scope` and returns the
    /// fragment stream with the producer's handle.
    pub fn stream<'scope, 'env>(
        &'scope mut self,
        input: &'scope str,
        capacity: usize,
        scope: &'scope Scope<'scope, 'env>,
    ) -> (StreamReceiver, ScopedJoinHandle<'scope, Result<TurnOutput>>)
    where
        Self: Send,
    {
        let (mut tx, rx) = stream_channel(capacity);
        let producer = scope.spawn(move || self.predict_into(input, &mut tx));
        (rx, producer)
    }

    fn generate<K: TurnSink + ?Sized>(&mut self, input: &str, sink: &mut K) -> Result<TurnOutput> {
        let started_at = Utc::now();
        let model: &'m ChatModel<E> = self.model;

        let input = model.encode(input);
        model.eval_sequence(&input, &mut self.state, &mut self.logits)?;
        self.evaluated += input.len();

        let mut assembler = PieceAssembler::new(model.tokenizer(), &self.options.stop_sequences);
        let mut stop = StopReason::MaxTokens;
        for _ in 0..self.options.max_tokens {
            if sink.cancelled() {
                stop = StopReason::Cancelled;
                break;
            }
            let token = self.sampler.sample(&mut self.logits)?;
            model.engine().eval(token, &mut self.state, &mut self.logits)?;
            self.evaluated += 1;

            assembler.push(token);
            if let Some(found) = assembler.stop_sequence() {
                stop = StopReason::StopSequence(found.to_string());
            }
            if let Some(fragment) = assembler.take_streamable() {
                if !sink.fragment(&fragment) {
                    stop = StopReason::Cancelled;
                    break;
                }
            }
            if stop != StopReason::MaxTokens {
                break;
            }
        }

        if stop == StopReason::MaxTokens {
            if let Some(rest) = assembler.take_rest() {
                sink.fragment(&rest);
            }
        }

        let (text, tokens) = assembler.finish();
        debug!(tokens = tokens.len(), evaluated = self.evaluated, ?stop, "prediction finished");
        Ok(TurnOutput { text, tokens, stop, started_at })
    }
}
