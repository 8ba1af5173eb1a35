use super::consts;
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;

pub struct Config {
    base_url: String,
    api_key: SecretString,
    model: String,
}

pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.config.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.config.api_key = SecretString::from(api_key.to_string());
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.config.model = model.to_string();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            base_url: consts::BASE_URL.to_string(),
            api_key: std::env::var(consts::OPENAI_API_KEY)
                .unwrap_or_default()
                .into(),
            model: consts::DEFAULT_MODEL.to_string(),
        }
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn api_key(&self) -> &SecretString {
        &self.api_key
    }

    /// The transcription model requested in the session update.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The websocket handshake for a transcription-only session.
    pub(crate) fn request(&self) -> Result<Request> {
        let url = format!("{}/realtime?intent=transcription", self.base_url);
        let mut request = url
            .into_client_request()
            .context("invalid realtime url")?;
        let bearer = format!("Bearer {}", self.api_key.expose_secret());
        let headers = request.headers_mut();
        headers.insert(
            consts::AUTHORIZATION_HEADER,
            HeaderValue::from_str(&bearer).context("api key is not a valid header value")?,
        );
        headers.insert(
            consts::OPENAI_BETA_HEADER,
            HeaderValue::from_static(consts::OPENAI_BETA_VALUE),
        );
        Ok(request)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
