//! Conversation core: session orchestration, dialogue, avatar adapter and
//! the dual-stream recorder.

pub mod avatar;
pub mod dialogue;
pub mod error;
pub mod llm;
pub mod media;
pub mod orchestrator;
pub mod persona;
pub mod recorder;
pub mod task;
pub mod transcription;
pub mod voice;

#[cfg(test)]
mod testing;

pub use error::{Error, RecordingError, Result};
