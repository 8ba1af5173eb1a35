pub mod avatar_room;
pub mod config;
pub mod console;
pub mod factory;
pub mod ffmpeg;
pub mod heygen_adapter;
pub mod microphone;
pub mod persona_loader;
pub mod transcriber;
