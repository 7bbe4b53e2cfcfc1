use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::{ChatError, Result};

/// Generation and conversation settings. Every field has a default so a JSON file
/// only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatOptions {
    pub max_tokens: usize,
    pub stop_sequences: Vec<String>,  // checked in order, the first one found wins
    pub temperature: f32,             // it could be a good idea to increase temperature when top_p is low
    pub top_p: f32,                   // reduce top_p (0.5, 0.2, 0.1) for more focused answers
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub penalty_decay: f32,           // applied to every occurrence count once per generated token
    pub user_name: String,
    pub bot_name: String,
    pub threads: u32
}

impl Default for ChatOptions {
    fn default() -> Self {
        ChatOptions {
            max_tokens: 999,
            stop_sequences: vec!["\n\n".to_string()],
            temperature: 1.2,
            top_p: 0.5,
            presence_penalty: 0.4,
            frequency_penalty: 0.4,
            penalty_decay: 0.996,
            user_name: "User".to_string(),
            bot_name: "Bot".to_string(),
            threads: 2
        }
    }
}

impl ChatOptions {
    /// Parse options from a JSON string and validate them.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: ChatOptions = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load options from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Save options to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(ChatError::parameter("max_tokens", "must be positive"));
        }
        if !(self.temperature >= 0.0) {
            return Err(ChatError::parameter(
                "temperature",
                format!("must be non-negative, got {}", self.temperature),
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(ChatError::parameter("top_p", format!("must be in [0, 1], got {}", self.top_p)));
        }
        if !(self.penalty_decay > 0.0 && self.penalty_decay <= 1.0) {
            return Err(ChatError::parameter(
                "penalty_decay",
                format!("must be in (0, 1], got {}", self.penalty_decay),
            ));
        }
        if self.stop_sequences.iter().any(|s| s.is_empty()) {
            return Err(ChatError::parameter("stop_sequences", "empty stop sequence"));
        }
        if self.threads == 0 {
            return Err(ChatError::parameter("threads", "must be positive"));
        }
        Ok(())
    }
}
