pub mod image;
pub mod llm;
pub mod media;
pub mod tts;
