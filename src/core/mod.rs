pub mod chatbot;
pub mod config;
pub mod error;
pub mod model;
pub mod sampler;
pub mod session;
pub mod stream;
pub mod tokenizer;
pub mod types;
pub mod vecops;
