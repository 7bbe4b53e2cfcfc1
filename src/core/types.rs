use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::config::ChatOptions;

// -------------------------------------------------------------------------------------------------
// Tokenizer related structs
// Byte-level longest-match tokenizer: every token is a byte string, and encoding walks a trie
// over the input bytes taking the longest token that matches at each offset.

#[derive(Debug, Default, Clone)]
pub struct TrieNode {
    pub children: Vec<(u8, u32)>,  // sorted by byte, points into Trie::nodes
    pub token: Option<usize>       // first token inserted that ends here
}

#[derive(Debug, Clone)]
pub struct Trie {
    pub nodes: Vec<TrieNode>       // nodes[0] is the root
}

#[derive(Debug)]
pub struct Vocabulary {
    pub pieces: Vec<Option<Box<[u8]>>>,  // token id -> bytes, None for unused ids
    pub trie: Trie,
    pub len: usize,                      // number of defined tokens
    pub max_token_length: usize
}

/// Encode/decode front for a shared [`Vocabulary`]. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    pub vocab: Arc<Vocabulary>
}

// -------------------------------------------------------------------------------------------------
// The Sampler, which takes logits and returns a sampled token
// softmax -> logit bias -> (argmax if temperature is 0) -> top-p -> temperature -> draw

pub struct Sampler<R> {
    pub temperature: f32,
    pub top_p: f32,
    pub sorted: Vec<f32>,  // buffer used in top-p filtering
    pub rng: R             // uniform source for the final draw
}

// -------------------------------------------------------------------------------------------------
// Chat related structs

/// Token id -> decayed occurrence count for the turn being generated.
#[derive(Debug, Default, Clone)]
pub struct Occurrences {
    pub(crate) counts: HashMap<usize, f32>
}

pub struct ConversationState {
    pub(crate) baseline: Box<[f32]>,   // hidden state right after the prompt, never written again
    pub(crate) state: Vec<f32>,        // hidden state of the turn in progress
    pub(crate) logits: Vec<f32>,       // logits produced by the last evaluation
    pub(crate) occurrences: Occurrences,
    pub(crate) pieces: Vec<String>     // validated fragments of the current turn
}

pub struct ChatModel<E> {
    pub(crate) engine: E,
    pub(crate) tokenizer: Tokenizer,
    pub(crate) threads: u32
}

/// Lifecycle of a [`Chatbot`]. A chatbot only exists once its prompt is evaluated, so
/// `Uninitialized` appears in construction logs but is never returned by `phase()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPhase {
    Uninitialized,
    PromptLoaded,
    Generating,
    Idle
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    StopSequence(String),
    MaxTokens,
    Cancelled
}

#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub text: String,
    pub tokens: Vec<usize>,  // every sampled token, including those of a trimmed stop sequence
    pub stop: StopReason,
    pub started_at: DateTime<Utc>
}

/// Free-running context over a model: every call continues from the state the
/// previous one left behind.
pub struct Session<'m, E, S> {
    pub(crate) model: &'m ChatModel<E>,
    pub(crate) sampler: S,
    pub(crate) options: ChatOptions,
    pub(crate) state: Vec<f32>,   // advanced by every input and generated token
    pub(crate) logits: Vec<f32>,  // prediction after the last evaluated token
    pub(crate) evaluated: usize   // tokens fed since the last reset
}

pub struct Chatbot<'m, E, S> {
    pub(crate) model: &'m ChatModel<E>,
    pub(crate) sampler: S,
    pub(crate) options: ChatOptions,
    pub(crate) avoid_repeat: Vec<usize>,
    pub(crate) conversation: ConversationState,
    pub(crate) phase: ChatPhase
}
