use crate::types::{Base64EncodedAudioBytes, ClientEvent, ServerEvent, TranscriptionSession};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

mod config;
mod consts;

pub use config::{Config, ConfigBuilder};

pub type ClientTx = tokio::sync::mpsc::Sender<ClientEvent>;
type ServerTx = tokio::sync::broadcast::Sender<ServerEvent>;
pub type ServerRx = tokio::sync::broadcast::Receiver<ServerEvent>;

pub struct Client {
    capacity: usize,
    config: Config,
    c_tx: Option<ClientTx>,
    s_tx: Option<ServerTx>,
}

impl Client {
    fn new(capacity: usize, config: Config) -> Self {
        Self {
            capacity,
            config,
            c_tx: None,
            s_tx: None,
        }
    }

    async fn connect(&mut self) -> Result<()> {
        if self.c_tx.is_some() {
            return Err(anyhow::anyhow!("already connected"));
        }

        let request = self.config.request()?;
        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("failed to connect to realtime transcription")?;
        let (mut write, mut read) = ws_stream.split();

        let (c_tx, mut c_rx) = tokio::sync::mpsc::channel::<ClientEvent>(self.capacity);
        let (s_tx, _) = tokio::sync::broadcast::channel(self.capacity);

        self.c_tx = Some(c_tx);
        self.s_tx = Some(s_tx.clone());

        tokio::spawn(async move {
            while let Some(event) = c_rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            tracing::error!("failed to send message: {}", e);
                        }
                    }
                    Err(e) => {
                        tracing::error!("failed to serialize event: {}", e);
                    }
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let message = match message {
                    Err(e) => {
                        tracing::error!("failed to read message: {}", e);
                        break;
                    }
                    Ok(message) => message,
                };
                match message {
                    Message::Text(text) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(ServerEvent::Unknown) => {
                            tracing::trace!("ignoring server event: {}", text);
                        }
                        Ok(event) => {
                            if let ServerEvent::Error { error } = &event {
                                tracing::error!("transcription error: {}", error.message);
                            }
                            // No subscribers is not fatal; one may subscribe later.
                            let _ = s_tx.send(event);
                        }
                        Err(e) => {
                            tracing::error!("failed to deserialize event: {}, text=> {:?}", e, text);
                        }
                    },
                    Message::Binary(bin) => {
                        tracing::warn!("unexpected binary message ({} bytes)", bin.len());
                    }
                    Message::Close(reason) => {
                        tracing::info!("connection closed: {:?}", reason);
                        let _ = s_tx.send(ServerEvent::Close {
                            reason: reason.map(|v| format!("{:?}", v)),
                        });
                        return;
                    }
                    _ => {}
                }
            }
            let _ = s_tx.send(ServerEvent::Close { reason: None });
        });
        Ok(())
    }

    pub fn server_events(&self) -> Result<ServerRx> {
        match self.s_tx {
            Some(ref tx) => Ok(tx.subscribe()),
            None => Err(anyhow::anyhow!("not connected yet")),
        }
    }

    /// A sender for client events, usable from other tasks.
    pub fn sender(&self) -> Result<ClientTx> {
        self.c_tx
            .clone()
            .ok_or_else(|| anyhow::anyhow!("not connected yet"))
    }

    async fn send_client_event(&self, event: ClientEvent) -> Result<()> {
        match self.c_tx {
            Some(ref tx) => {
                tx.send(event).await?;
                Ok(())
            }
            None => Err(anyhow::anyhow!("not connected yet")),
        }
    }

    /// Requests transcription with the configured model.
    pub async fn configure(&self) -> Result<()> {
        let session = TranscriptionSession::new(self.config.model());
        self.update_session(session).await
    }

    pub async fn update_session(&self, session: TranscriptionSession) -> Result<()> {
        self.send_client_event(ClientEvent::SessionUpdate { session })
            .await
    }

    pub async fn append_input_audio_buffer(&self, audio: Base64EncodedAudioBytes) -> Result<()> {
        self.send_client_event(ClientEvent::InputAudioBufferAppend { audio })
            .await
    }

    pub async fn clear_input_audio_buffer(&self) -> Result<()> {
        self.send_client_event(ClientEvent::InputAudioBufferClear)
            .await
    }
}

pub async fn connect_with_config(capacity: usize, config: Config) -> Result<Client> {
    let mut client = Client::new(capacity, config);
    client.connect().await?;
    Ok(client)
}

pub async fn connect() -> Result<Client> {
    connect_with_config(consts::DEFAULT_CAPACITY, Config::new()).await
}
