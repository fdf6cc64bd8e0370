pub mod database;
pub mod embeddings;
pub mod error;
pub mod ollama;
pub mod prompt;
pub mod rag;
pub mod search;
pub mod server;
