use std::env;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

const OPENAI_CHAT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
const GROQ_CHAT_ENDPOINT: &str = "https://api.groq.com/openai/v1/chat/completions";
const OLLAMA_DEFAULT_ENDPOINT: &str = "http://127.0.0.1:11434";

const RETRY_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One message in a session's conversation history.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
}

/// Model handle configuration carried by an agent.
#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_retries: u32,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown AI provider '{name}', valid providers are: {valid}")]
    UnknownProvider { name: String, valid: String },
    #[error("missing API key for provider '{provider}', expected environment variable '{env_key}'")]
    MissingApiKey { provider: String, env_key: String },
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: String,
        source: reqwest::Error,
    },
    #[error("{provider} endpoint returned {status}: {detail}")]
    Api {
        provider: String,
        status: u16,
        detail: String,
    },
    #[error("malformed {provider} response: {detail}")]
    MalformedResponse { provider: String, detail: String },
}

impl ProviderError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// A chat-capable model endpoint. The pipeline only ever talks to models
/// through this trait so tests can substitute a scripted client.
pub trait ModelClient: Send + Sync {
    fn invoke(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        input: &str,
    ) -> Result<ModelResponse, ProviderError>;

    fn model_id(&self) -> &str;
}

fn wire_messages(system_prompt: &str, history: &[ChatTurn], input: &str) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(json!({ "role": "system", "content": system_prompt }));
    for turn in history {
        messages.push(json!({ "role": turn.role.as_str(), "content": turn.content }));
    }
    messages.push(json!({ "role": "user", "content": input }));
    messages
}

fn invoke_with_retries<F>(
    provider: &str,
    max_retries: u32,
    request_once: F,
) -> Result<ModelResponse, ProviderError>
where
    F: Fn() -> Result<ModelResponse, ProviderError>,
{
    let mut attempt = 0_u32;
    loop {
        match request_once() {
            Ok(response) => return Ok(response),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                if attempt > max_retries || !err.is_retryable() {
                    return Err(err);
                }
                warn!("{provider} call failed (attempt {attempt}), retrying: {err}");
                thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt)));
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaReply {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: String,
}

/// OpenAI-style chat-completions client. Groq speaks the same wire shape,
/// so both providers share this implementation.
struct OpenAiCompatClient {
    provider: &'static str,
    endpoint: String,
    api_key: Option<String>,
    options: ModelOptions,
    client: Client,
}

impl OpenAiCompatClient {
    fn new(
        provider: &'static str,
        default_endpoint: &str,
        api_key: Option<String>,
        options: ModelOptions,
    ) -> Self {
        let endpoint = options
            .endpoint
            .clone()
            .unwrap_or_else(|| default_endpoint.to_string());
        Self {
            provider,
            endpoint,
            api_key,
            options,
            client: Client::new(),
        }
    }

    fn request_once(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        input: &str,
    ) -> Result<ModelResponse, ProviderError> {
        let mut headers = HeaderMap::new();
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|_| {
                ProviderError::MalformedResponse {
                    provider: self.provider.to_string(),
                    detail: "API key contains non-header characters".to_string(),
                }
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .json(&json!({
                "model": self.options.model,
                "temperature": self.options.temperature,
                "messages": wire_messages(system_prompt, history, input),
            }))
            .send()
            .map_err(|source| ProviderError::Transport {
                provider: self.provider.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(ProviderError::Api {
                provider: self.provider.to_string(),
                status: status.as_u16(),
                detail,
            });
        }

        let completion: ChatCompletion =
            response
                .json()
                .map_err(|err| ProviderError::MalformedResponse {
                    provider: self.provider.to_string(),
                    detail: err.to_string(),
                })?;
        let choice =
            completion
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::MalformedResponse {
                    provider: self.provider.to_string(),
                    detail: "response carried no choices".to_string(),
                })?;
        Ok(ModelResponse {
            content: choice.message.content,
        })
    }
}

impl ModelClient for OpenAiCompatClient {
    fn invoke(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        input: &str,
    ) -> Result<ModelResponse, ProviderError> {
        invoke_with_retries(self.provider, self.options.max_retries, || {
            self.request_once(system_prompt, history, input)
        })
    }

    fn model_id(&self) -> &str {
        &self.options.model
    }
}

/// Client for Ollama's native chat endpoint. No API key required.
struct OllamaChatClient {
    endpoint: String,
    options: ModelOptions,
    client: Client,
}

impl OllamaChatClient {
    fn new(options: ModelOptions) -> Self {
        let base = options
            .endpoint
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_ENDPOINT.to_string());
        let endpoint = format!("{}/api/chat", base.trim_end_matches('/'));
        Self {
            endpoint,
            options,
            client: Client::new(),
        }
    }

    fn request_once(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        input: &str,
    ) -> Result<ModelResponse, ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "model": self.options.model,
                "stream": false,
                "options": { "temperature": self.options.temperature },
                "messages": wire_messages(system_prompt, history, input),
            }))
            .send()
            .map_err(|source| ProviderError::Transport {
                provider: "ollama".to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(ProviderError::Api {
                provider: "ollama".to_string(),
                status: status.as_u16(),
                detail,
            });
        }

        let reply: OllamaReply = response
            .json()
            .map_err(|err| ProviderError::MalformedResponse {
                provider: "ollama".to_string(),
                detail: err.to_string(),
            })?;
        Ok(ModelResponse {
            content: reply.message.content,
        })
    }
}

impl ModelClient for OllamaChatClient {
    fn invoke(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        input: &str,
    ) -> Result<ModelResponse, ProviderError> {
        invoke_with_retries("ollama", self.options.max_retries, || {
            self.request_once(system_prompt, history, input)
        })
    }

    fn model_id(&self) -> &str {
        &self.options.model
    }
}

type ClientFactory = fn(ModelOptions, Option<String>) -> Box<dyn ModelClient>;

pub struct ProviderEntry {
    pub name: &'static str,
    pub key_env: Option<&'static str>,
    factory: ClientFactory,
}

/// String-keyed provider table. Adding a provider means registering one
/// more entry here, not branching on names elsewhere.
pub struct ProviderRegistry {
    entries: Vec<ProviderEntry>,
}

fn openai_factory(options: ModelOptions, api_key: Option<String>) -> Box<dyn ModelClient> {
    Box::new(OpenAiCompatClient::new(
        "openai",
        OPENAI_CHAT_ENDPOINT,
        api_key,
        options,
    ))
}

fn groq_factory(options: ModelOptions, api_key: Option<String>) -> Box<dyn ModelClient> {
    Box::new(OpenAiCompatClient::new(
        "groq",
        GROQ_CHAT_ENDPOINT,
        api_key,
        options,
    ))
}

fn ollama_factory(options: ModelOptions, _api_key: Option<String>) -> Box<dyn ModelClient> {
    Box::new(OllamaChatClient::new(options))
}

impl ProviderRegistry {
    pub fn with_defaults() -> Self {
        Self {
            entries: vec![
                ProviderEntry {
                    name: "openai",
                    key_env: Some("OPENAI_API_KEY"),
                    factory: openai_factory,
                },
                ProviderEntry {
                    name: "groq",
                    key_env: Some("GROQ_API_KEY"),
                    factory: groq_factory,
                },
                ProviderEntry {
                    name: "ollama",
                    key_env: None,
                    factory: ollama_factory,
                },
            ],
        }
    }

    pub fn entry(&self, name: &str) -> Option<&ProviderEntry> {
        let wanted = name.trim().to_lowercase();
        self.entries.iter().find(|entry| entry.name == wanted)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.name).collect()
    }

    pub fn build(&self, options: &ModelOptions) -> Result<Box<dyn ModelClient>, ProviderError> {
        let entry =
            self.entry(&options.provider)
                .ok_or_else(|| ProviderError::UnknownProvider {
                    name: options.provider.clone(),
                    valid: self.names().join(", "),
                })?;

        let api_key = match entry.key_env {
            Some(env_key) => {
                let key = options
                    .api_key
                    .clone()
                    .or_else(|| env::var(env_key).ok())
                    .filter(|key| !key.trim().is_empty());
                match key {
                    Some(key) => Some(key),
                    None => {
                        return Err(ProviderError::MissingApiKey {
                            provider: entry.name.to_string(),
                            env_key: env_key.to_string(),
                        });
                    }
                }
            }
            None => None,
        };

        Ok((entry.factory)(options.clone(), api_key))
    }
}
