pub mod embeddings;
pub mod gemini;
pub mod media;
