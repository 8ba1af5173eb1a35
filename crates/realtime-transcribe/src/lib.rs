mod client;
pub mod types;

pub use client::{Client, ClientTx, Config, ConfigBuilder, ServerRx, connect, connect_with_config};
