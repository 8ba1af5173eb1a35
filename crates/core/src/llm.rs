//! Chat-completion clients for the two supported providers.
//!
//! Groq is preferred whenever its key is configured; Claude is the fallback.
//! The choice is made once per dialogue service and never re-evaluated.

use crate::dialogue::{LanguageModel, Role, Turn};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

pub const GROQ_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const CLAUDE_URL: &str = "https://api.anthropic.com/v1/messages";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

pub const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_CLAUDE_MODEL: &str = "claude-sonnet-4-20250514";

const MAX_TOKENS: u32 = 1024;
const TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Groq,
    Claude,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Groq => "groq",
            ProviderKind::Claude => "claude",
        }
    }
}

#[derive(Debug)]
pub struct ProviderCredential {
    pub api_key: SecretString,
    pub model: String,
}

impl ProviderCredential {
    pub fn new(api_key: &str, model: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.to_string()),
            model: model.into(),
        }
    }
}

/// Which provider a dialogue service talks to.
#[derive(Debug)]
pub enum ProviderSelection {
    Primary(ProviderCredential),
    Fallback(ProviderCredential),
}

impl ProviderSelection {
    /// Groq when configured, otherwise Claude, otherwise nothing.
    pub fn from_credentials(
        groq: Option<ProviderCredential>,
        claude: Option<ProviderCredential>,
    ) -> Option<Self> {
        groq.map(Self::Primary).or_else(|| claude.map(Self::Fallback))
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderSelection::Primary(_) => ProviderKind::Groq,
            ProviderSelection::Fallback(_) => ProviderKind::Claude,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ProviderSelection::Primary(c) | ProviderSelection::Fallback(c) => &c.model,
        }
    }

    /// Builds a fresh client bound to this provider.
    pub fn build(&self) -> Box<dyn LanguageModel> {
        match self {
            ProviderSelection::Primary(c) => Box::new(GroqClient::new(
                SecretString::from(c.api_key.expose_secret().to_string()),
                c.model.clone(),
            )),
            ProviderSelection::Fallback(c) => Box::new(ClaudeClient::new(
                SecretString::from(c.api_key.expose_secret().to_string()),
                c.model.clone(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeBlock>,
}

#[derive(Debug, Deserialize)]
struct ClaudeBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn transport(e: reqwest::Error) -> Error {
    Error::Provider {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}

async fn post_json(request: reqwest::RequestBuilder, body: &Value) -> Result<reqwest::Response> {
    let resp = request.json(body).send().await.map_err(transport)?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(Error::provider_status(status.as_u16(), text));
    }
    Ok(resp)
}

/// OpenAI-compatible chat completions served by Groq.
pub struct GroqClient {
    client: Client,
    api_key: SecretString,
    model: String,
    url: String,
}

impl GroqClient {
    pub fn new(api_key: SecretString, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            url: GROQ_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn request_body(&self, instructions: &str, turns: &[Turn]) -> Value {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        messages.push(json!({ "role": "system", "content": instructions }));
        messages.extend(
            turns
                .iter()
                .map(|t| json!({ "role": role_name(t.role), "content": t.text })),
        );
        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": MAX_TOKENS,
            "temperature": TEMPERATURE,
        })
    }
}

#[async_trait]
impl LanguageModel for GroqClient {
    fn name(&self) -> &'static str {
        ProviderKind::Groq.as_str()
    }

    async fn complete(&self, instructions: &str, turns: &[Turn]) -> Result<String> {
        let body = self.request_body(instructions, turns);
        let resp = post_json(
            self.client
                .post(&self.url)
                .bearer_auth(self.api_key.expose_secret()),
            &body,
        )
        .await?
        .json::<LlmResponse>()
        .await
        .map_err(transport)?;

        resp.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::provider("no choices in response"))
    }
}

/// Anthropic messages API.
pub struct ClaudeClient {
    client: Client,
    api_key: SecretString,
    model: String,
    url: String,
}

impl ClaudeClient {
    pub fn new(api_key: SecretString, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            url: CLAUDE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn request_body(&self, instructions: &str, turns: &[Turn]) -> Value {
        let messages: Vec<Value> = turns
            .iter()
            .map(|t| json!({ "role": role_name(t.role), "content": t.text }))
            .collect();
        json!({
            "model": self.model,
            "system": instructions,
            "messages": messages,
            "max_tokens": MAX_TOKENS,
            "temperature": TEMPERATURE,
        })
    }
}

#[async_trait]
impl LanguageModel for ClaudeClient {
    fn name(&self) -> &'static str {
        ProviderKind::Claude.as_str()
    }

    async fn complete(&self, instructions: &str, turns: &[Turn]) -> Result<String> {
        let body = self.request_body(instructions, turns);
        let resp = post_json(
            self.client
                .post(&self.url)
                .header("x-api-key", self.api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION),
            &body,
        )
        .await?
        .json::<ClaudeResponse>()
        .await
        .map_err(transport)?;

        resp.content
            .into_iter()
            .find(|b| b.kind == "text")
            .and_then(|b| b.text)
            .ok_or_else(|| Error::provider("no text block in response"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turns() -> Vec<Turn> {
        vec![
            Turn::new(Role::User, "hi"),
            Turn::new(Role::Assistant, "hello"),
            Turn::new(Role::User, "how are you?"),
        ]
    }

    #[test]
    fn groq_wins_when_both_keys_are_present() {
        let selection = ProviderSelection::from_credentials(
            Some(ProviderCredential::new("g", DEFAULT_GROQ_MODEL)),
            Some(ProviderCredential::new("c", DEFAULT_CLAUDE_MODEL)),
        )
        .unwrap();
        assert_eq!(selection.kind(), ProviderKind::Groq);
        assert_eq!(selection.build().name(), "groq");

        let fallback = ProviderSelection::from_credentials(
            None,
            Some(ProviderCredential::new("c", DEFAULT_CLAUDE_MODEL)),
        )
        .unwrap();
        assert_eq!(fallback.kind(), ProviderKind::Claude);
        assert_eq!(fallback.model(), DEFAULT_CLAUDE_MODEL);

        assert!(ProviderSelection::from_credentials(None, None).is_none());
    }

    #[test]
    fn groq_body_puts_instructions_first() {
        let client = GroqClient::new(SecretString::from("k".to_string()), "m".into());
        let body = client.request_body("be Sarah", &turns());

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "be Sarah");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"], "how are you?");
        assert_eq!(body["max_tokens"], 1024);
    }

    #[test]
    fn claude_body_carries_instructions_separately() {
        let client = ClaudeClient::new(SecretString::from("k".to_string()), "m".into());
        let body = client.request_body("be Sarah", &turns());

        assert_eq!(body["system"], "be Sarah");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "user");
    }

    #[tokio::test]
    async fn unreachable_provider_is_a_provider_error() {
        let client = GroqClient::new(SecretString::from("k".to_string()), "m".into())
            .with_base_url("http://127.0.0.1:9/v1/chat/completions");
        let err = client.complete("x", &turns()).await.unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
    }
}
