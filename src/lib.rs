//! Chat front end for recurrent (RWKV-style) language models.
//!
//! The inference engine is supplied by the caller through [`core::model::Engine`].
//! This crate provides the byte-level trie tokenizer, the nucleus sampler, free-running
//! sessions and the multi-turn chat loop on top of it.

pub mod core;
#[cfg(test)]
mod test;

pub use crate::core::config::ChatOptions;
pub use crate::core::error::{ChatError, Result};
pub use crate::core::model::{Engine, LoadEngine};
pub use crate::core::sampler::TokenSampler;
pub use crate::core::stream::{stream_channel, StreamReceiver, StreamSender, TurnSink};
pub use crate::core::types::{
    ChatModel, ChatPhase, Chatbot, ConversationState, Occurrences, Sampler, Session, StopReason,
    Tokenizer, TurnOutput, Vocabulary,
};
