use std::thread::{Scope, ScopedJoinHandle};

use chrono::Utc;
use tracing::{debug, info, trace, warn};

use crate::core::config::ChatOptions;
use crate::core::error::Result;
use crate::core::model::Engine;
use crate::core::sampler::TokenSampler;
use crate::core::stream::{stream_channel, Discard, PieceAssembler, StreamReceiver, TurnSink};
use crate::core::types::{
    ChatModel, ChatPhase, Chatbot, ConversationState, Occurrences, StopReason, TurnOutput,
};

pub const END_OF_TEXT: usize = 0;
pub const END_OF_LINE: usize = 11;

/// Punctuation that should not be repeated right after the user typed it.
const AVOID_REPEAT: &str = "，：？！";

const CHAT_LEN_SHORT: usize = 40;
const CHAT_LEN_LONG: usize = 150;
const NEWLINE_BONUS_CAP: f32 = 3.0;

/// Bias added to the end-of-line logit after the `step`-th generated token.
///
/// Forbidden right away, then relaxed linearly until `CHAT_LEN_SHORT`, neutral until
/// `CHAT_LEN_LONG` and increasingly favoured after that so long answers wrap up.
pub fn newline_bias(step: usize) -> f32 {
    if step == 0 {
        f32::NEG_INFINITY
    } else if step <= CHAT_LEN_SHORT {
        (step as f32 - CHAT_LEN_SHORT as f32) * 0.1
    } else if step <= CHAT_LEN_LONG {
        0.0
    } else {
        ((step - CHAT_LEN_LONG) as f32 * 0.25).min(NEWLINE_BONUS_CAP)
    }
}

/// Unifies newlines (`\r\n`, `\r` and literal `\n` escapes) and trims the message.
pub fn normalize_message(message: &str) -> String {
    message
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace("\\n", "\n")
        .trim()
        .to_string()
}

impl Occurrences {
    pub fn get(&self, token: usize) -> f32 {
        self.counts.get(&token).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }

    /// Subtracts `presence + frequency * count` from the logit of every seen token.
    pub fn penalize(&self, logits: &mut [f32], presence: f32, frequency: f32) {
        for (&token, &count) in &self.counts {
            if let Some(logit) = logits.get_mut(token) {
                *logit -= presence + frequency * count;
            }
        }
    }

    /// Decays every count by `decay`, then counts one more `token`.
    pub fn record(&mut self, token: usize, decay: f32) {
        for count in self.counts.values_mut() {
            *count *= decay;
        }
        *self.counts.entry(token).or_insert(0.0) += 1.0;
    }
}

impl ConversationState {
    pub fn new(baseline: Vec<f32>, logits_len: usize) -> Self {
        ConversationState {
            state: baseline.clone(),
            baseline: baseline.into_boxed_slice(),
            logits: vec![0f32; logits_len],
            occurrences: Occurrences::default(),
            pieces: Vec::new()
        }
    }

    pub fn baseline(&self) -> &[f32] {
        &self.baseline
    }

    pub fn state(&self) -> &[f32] {
        &self.state
    }

    pub fn logits(&self) -> &[f32] {
        &self.logits
    }

    pub fn occurrences(&self) -> &Occurrences {
        &self.occurrences
    }

    pub fn pieces(&self) -> &[String] {
        &self.pieces
    }

    /// Starts a turn from the prompt baseline; nothing from earlier turns survives.
    fn reset(&mut self) {
        self.state.copy_from_slice(&self.baseline);
        self.occurrences.clear();
        self.pieces.clear();
    }
}

/// Evaluates `tokens`, then shifts the end-of-line logit by `newline_adj` and bans
/// an immediate repeat of the last token when it is avoid-repeat punctuation.
fn run_rnn<E: Engine>(
    model: &ChatModel<E>,
    avoid_repeat: &[usize],
    conversation: &mut ConversationState,
    tokens: &[usize],
    newline_adj: f32,
) -> Result<()> {
    model.eval_sequence(tokens, &mut conversation.state, &mut conversation.logits)?;
    let logits = &mut conversation.logits;
    if let Some(logit) = logits.get_mut(END_OF_LINE) {
        *logit += newline_adj;
    }
    if let Some(&last) = tokens.last() {
        if avoid_repeat.contains(&last) {
            if let Some(logit) = logits.get_mut(last) {
                *logit = f32::NEG_INFINITY;
            }
        }
    }
    Ok(())
}

impl<'m, E: Engine, S: TokenSampler> Chatbot<'m, E, S> {
    /// Creates a chat session and evaluates `prompt` once into the baseline state
    /// every turn starts from.
    pub fn new(model: &'m ChatModel<E>, sampler: S, options: ChatOptions, prompt: &str) -> Result<Self> {
        options.validate()?;
        debug!(phase = ?ChatPhase::Uninitialized, "creating chat session");

        let avoid_repeat = model.encode(AVOID_REPEAT);
        let mut state = model.fresh_state();
        let mut logits = model.new_logits();
        let prompt_tokens = model.encode(prompt);
        model.eval_sequence(&prompt_tokens, &mut state, &mut logits)?;

        let phase = ChatPhase::PromptLoaded;
        info!(?phase, prompt_tokens = prompt_tokens.len(), user = %options.user_name, bot = %options.bot_name, "chat prompt loaded");

        Ok(Chatbot {
            model,
            sampler,
            conversation: ConversationState::new(state, model.engine().logits_len()),
            options,
            avoid_repeat,
            phase
        })
    }

    pub fn phase(&self) -> ChatPhase {
        self.phase
    }

    pub fn options(&self) -> &ChatOptions {
        &self.options
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    /// `"<user>: <message>\n\n<bot>: "` with the message normalized.
    pub fn format_turn(&self, message: &str) -> String {
        format!(
            "{}: {}\n\n{}: ",
            self.options.user_name,
            normalize_message(message),
            self.options.bot_name
        )
    }

    /// Answers `message` and returns the whole reply at once.
    pub fn process(&mut self, message: &str) -> Result<TurnOutput> {
        self.process_stream(message, &mut Discard)
    }

    /// Answers `message`, handing every validated fragment to `sink` as it appears.
    ///
    /// The fragments concatenate to the returned text. An engine error aborts the turn;
    /// fragments already delivered stay valid.
    pub fn process_stream<K: TurnSink + ?Sized>(&mut self, message: &str, sink: &mut K) -> Result<TurnOutput> {
        let text = self.format_turn(message);
        self.phase = ChatPhase::Generating;
        let result = self.generate(&text, sink);
        self.phase = ChatPhase::Idle;
        if let Err(e) = &result {
            warn!(error = %e, "turn aborted");
        }
        result
    }

    /// Answers `message` on a thread of `scope` and returns the fragment stream with the
    /// producer's handle. Dropping or cancelling the receiver ends the turn early.
    pub fn stream<'scope, 'env>(
        &'scope mut self,
        message: &'scope str,
        capacity: usize,
        scope: &'scope Scope<'scope, 'env>,
    ) -> (StreamReceiver, ScopedJoinHandle<'scope, Result<TurnOutput>>)
    where
        Self: Send,
    {
        let (mut tx, rx) = stream_channel(capacity);
        let producer = scope.spawn(move || self.process_stream(message, &mut tx));
        (rx, producer)
    }

    fn generate<K: TurnSink + ?Sized>(&mut self, text: &str, sink: &mut K) -> Result<TurnOutput> {
        let Chatbot { model, sampler, options, avoid_repeat, conversation, .. } = self;
        let model: &'m ChatModel<E> = *model;
        let started_at = Utc::now();

        let input = model.encode(text);
        conversation.reset();
        run_rnn(model, avoid_repeat, conversation, &input, f32::NEG_INFINITY)?;

        let mut assembler = PieceAssembler::new(model.tokenizer(), &options.stop_sequences);
        let mut stop = StopReason::MaxTokens;
        for step in 0..options.max_tokens {
            if sink.cancelled() {
                stop = StopReason::Cancelled;
                break;
            }
            let newline_adj = newline_bias(step);

            conversation.occurrences.penalize(
                &mut conversation.logits,
                options.presence_penalty,
                options.frequency_penalty,
            );
            let token = sampler.sample(&mut conversation.logits)?;
            conversation.occurrences.record(token, options.penalty_decay);
            trace!(step, token, "sampled");

            run_rnn(model, avoid_repeat, conversation, &[token], newline_adj)?;
            // end of text is never honoured, only stop sequences and max_tokens end a turn
            if let Some(logit) = conversation.logits.get_mut(END_OF_TEXT) {
                *logit = f32::NEG_INFINITY;
            }

            if let Some(piece) = assembler.push(token) {
                conversation.pieces.push(piece);
            }
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
        info!(tokens = tokens.len(), chars = text.chars().count(), ?stop, "turn finished");
        Ok(TurnOutput { text, tokens, stop, started_at })
    }
}
