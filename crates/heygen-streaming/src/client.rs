use crate::types::{
    Envelope, NewSessionRequest, ServerEvent, SessionData, SessionRequest, TaskRequest, TokenData,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_tungstenite::tungstenite::Message;

mod config;
mod consts;

pub use config::{Config, ConfigBuilder};

type ServerTx = tokio::sync::broadcast::Sender<ServerEvent>;
pub type ServerRx = tokio::sync::broadcast::Receiver<ServerEvent>;

/// The calls an avatar session needs. Implemented by [`Client`]; adapters are
/// generic over it so they can be tested against a mock.
#[async_trait]
pub trait StreamingApi: Send + Sync {
    async fn create_token(&self) -> Result<String>;
    async fn new_session(&self, token: &str, request: NewSessionRequest) -> Result<SessionData>;
    async fn start_session(&self, token: &str, session_id: &str) -> Result<()>;
    async fn send_task(&self, token: &str, request: TaskRequest) -> Result<()>;
    async fn interrupt(&self, token: &str, session_id: &str) -> Result<()>;
    async fn stop_session(&self, token: &str, session_id: &str) -> Result<()>;
    /// Connects to a session's event websocket.
    async fn server_events(&self, endpoint: &str) -> Result<ServerRx>;
}

enum Auth<'a> {
    ApiKey,
    Bearer(&'a str),
}

pub struct Client {
    http: reqwest::Client,
    config: Config,
}

impl Client {
    pub fn new(config: Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn post<B, T>(&self, path: &str, auth: Auth<'_>, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.config.base_url(), path);
        let request = match auth {
            Auth::ApiKey => self
                .http
                .post(&url)
                .header(consts::API_KEY_HEADER, self.config.api_key().expose_secret()),
            Auth::Bearer(token) => self.http.post(&url).bearer_auth(token),
        };

        let response = request
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {path} failed"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("failed to read {path} response"))?;
        if !status.is_success() {
            tracing::error!("{} returned {}: {}", path, status, text);
            anyhow::bail!("{path} returned {status}: {text}");
        }

        let envelope: Envelope = serde_json::from_str(&text)
            .with_context(|| format!("failed to deserialize {path} response"))?;
        if let Some(message) = envelope.message.as_deref() {
            tracing::debug!("{} responded code={:?} message={}", path, envelope.code, message);
        }
        serde_json::from_value(envelope.data)
            .with_context(|| format!("unexpected {path} payload"))
    }
}

#[async_trait]
impl StreamingApi for Client {
    async fn create_token(&self) -> Result<String> {
        let data: TokenData = self
            .post(consts::CREATE_TOKEN_PATH, Auth::ApiKey, &serde_json::json!({}))
            .await?;
        tracing::info!("access token received");
        Ok(data.token)
    }

    async fn new_session(&self, token: &str, request: NewSessionRequest) -> Result<SessionData> {
        tracing::debug!("creating avatar session: {:?}", request);
        self.post(consts::NEW_SESSION_PATH, Auth::Bearer(token), &request)
            .await
    }

    async fn start_session(&self, token: &str, session_id: &str) -> Result<()> {
        let body = SessionRequest {
            session_id: session_id.to_string(),
        };
        let _: serde_json::Value = self
            .post(consts::START_SESSION_PATH, Auth::Bearer(token), &body)
            .await?;
        Ok(())
    }

    async fn send_task(&self, token: &str, request: TaskRequest) -> Result<()> {
        let _: serde_json::Value = self
            .post(consts::TASK_PATH, Auth::Bearer(token), &request)
            .await?;
        Ok(())
    }

    async fn interrupt(&self, token: &str, session_id: &str) -> Result<()> {
        let body = SessionRequest {
            session_id: session_id.to_string(),
        };
        let _: serde_json::Value = self
            .post(consts::INTERRUPT_PATH, Auth::Bearer(token), &body)
            .await?;
        Ok(())
    }

    async fn stop_session(&self, token: &str, session_id: &str) -> Result<()> {
        let body = SessionRequest {
            session_id: session_id.to_string(),
        };
        let _: serde_json::Value = self
            .post(consts::STOP_SESSION_PATH, Auth::Bearer(token), &body)
            .await?;
        Ok(())
    }

    async fn server_events(&self, endpoint: &str) -> Result<ServerRx> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(endpoint)
            .await
            .context("failed to connect to avatar event websocket")?;
        // Outbound traffic on this socket is limited to pongs, which tungstenite
        // answers on its own while the read half is polled.
        let (write, mut read) = ws_stream.split();

        let (s_tx, s_rx): (ServerTx, ServerRx) =
            tokio::sync::broadcast::channel(consts::EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let _write = write;
            while let Some(message) = read.next().await {
                let message = match message {
                    Err(e) => {
                        tracing::error!("failed to read avatar event: {}", e);
                        break;
                    }
                    Ok(message) => message,
                };
                match message {
                    Message::Text(text) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(ServerEvent::Unknown) => {
                            tracing::debug!("ignoring avatar event: {}", text);
                        }
                        Ok(event) => {
                            if s_tx.send(event).is_err() {
                                tracing::debug!("no avatar event subscribers left");
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::error!("failed to deserialize avatar event: {}, text=> {:?}", e, text);
                        }
                    },
                    Message::Binary(bin) => {
                        tracing::warn!("unexpected binary avatar event ({} bytes)", bin.len());
                    }
                    Message::Close(reason) => {
                        tracing::info!("avatar event socket closed: {:?}", reason);
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

        Ok(s_rx)
    }
}
