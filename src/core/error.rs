use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Sampling or generation parameter out of range. Raised before any work is done.
    #[error("invalid parameter `{name}`: {reason}")]
    Parameter { name: &'static str, reason: String },

    /// Malformed dictionary line, literal or declared byte length.
    #[error("corrupt dictionary at line {line}: {reason}")]
    DictionaryCorruption { line: usize, reason: String },

    /// Failure reported by the inference engine during an evaluation.
    /// The recurrent state of the current turn is no longer trustworthy.
    #[error("engine error: {0}")]
    Engine(String),

    #[error("model file not found: {}", .0.display())]
    ResourceNotFound(PathBuf),

    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ChatError {
    pub(crate) fn parameter(name: &'static str, reason: impl Into<String>) -> Self {
        ChatError::Parameter { name, reason: reason.into() }
    }

    pub(crate) fn corrupt(line: usize, reason: impl Into<String>) -> Self {
        ChatError::DictionaryCorruption { line, reason: reason.into() }
    }
}
