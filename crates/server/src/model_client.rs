//! HTTP model client for OpenAI-compatible and Anthropic chat APIs.
//!
//! The invoker owns retry and fallback; this client does one request and
//! classifies the failure: connection errors, timeouts, 429 and 5xx are
//! transient, everything else is fatal and skips to the next candidate.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use liaison_agent::llm::{
    ChatRole, ModelClient, ModelError, ModelRequest, ModelResponse, TokenUsage, ToolCall,
};
use liaison_core::config::{ModelConfig, ModelProvider};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct HttpModelClient {
    http: reqwest::Client,
    provider: ModelProvider,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpModelClient {
    pub fn from_config(config: &ModelConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(config.provider).to_string())
            .trim_end_matches('/')
            .to_string();

        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_secs.max(1)))
                .build()
                .unwrap_or_default(),
            provider: config.provider,
            base_url,
            api_key: config.api_key.clone(),
        }
    }

    fn chat_url(&self) -> String {
        match self.provider {
            ModelProvider::OpenAi | ModelProvider::Ollama => {
                format!("{}/v1/chat/completions", self.base_url)
            }
            ModelProvider::Anthropic => format!("{}/v1/messages", self.base_url),
        }
    }
}

fn default_base_url(provider: ModelProvider) -> &'static str {
    match provider {
        ModelProvider::OpenAi => "https://api.openai.com",
        ModelProvider::Anthropic => "https://api.anthropic.com",
        ModelProvider::Ollama => "http://localhost:11434",
    }
}

fn role_name(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

fn openai_body(request: &ModelRequest) -> Value {
    let messages = request
        .turns
        .iter()
        .map(|turn| json!({ "role": role_name(turn.role), "content": turn.content }))
        .collect::<Vec<_>>();

    let mut body = json!({ "model": request.model, "messages": messages });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        },
                    })
                })
                .collect(),
        );
    }
    body
}

fn anthropic_body(request: &ModelRequest) -> Value {
    // Anthropic takes the system prompt out of band.
    let system = request
        .turns
        .iter()
        .filter(|turn| turn.role == ChatRole::System)
        .map(|turn| turn.content.clone())
        .collect::<Vec<_>>()
        .join("\n\n");
    let messages = request
        .turns
        .iter()
        .filter(|turn| turn.role != ChatRole::System)
        .map(|turn| json!({ "role": role_name(turn.role), "content": turn.content }))
        .collect::<Vec<_>>();

    let mut body = json!({
        "model": request.model,
        "max_tokens": DEFAULT_MAX_TOKENS,
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = Value::String(system);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters,
                    })
                })
                .collect(),
        );
    }
    body
}

fn parse_openai_response(body: &Value) -> Result<ModelResponse, ModelError> {
    let message = body
        .pointer("/choices/0/message")
        .ok_or_else(|| ModelError::Fatal("response has no choices".to_string()))?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    // Arguments arrive as a JSON-encoded string.
                    let arguments = function
                        .get("arguments")
                        .and_then(Value::as_str)
                        .and_then(|raw| serde_json::from_str(raw).ok())
                        .unwrap_or(Value::Null);
                    Some(ToolCall { name, arguments })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ModelResponse { text, tool_calls, usage: usage_from(body, "prompt_tokens", "completion_tokens") })
}

fn parse_anthropic_response(body: &Value) -> Result<ModelResponse, ModelError> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ModelError::Fatal("response has no content blocks".to_string()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(piece) = block.get("text").and_then(Value::as_str) {
                    text.push_str(piece);
                }
            }
            Some("tool_use") => {
                if let Some(name) = block.get("name").and_then(Value::as_str) {
                    tool_calls.push(ToolCall {
                        name: name.to_string(),
                        arguments: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
            }
            _ => {}
        }
    }

    Ok(ModelResponse { text, tool_calls, usage: usage_from(body, "input_tokens", "output_tokens") })
}

fn usage_from(body: &Value, prompt_key: &str, completion_key: &str) -> TokenUsage {
    let read = |key: &str| {
        body.pointer(&format!("/usage/{key}"))
            .and_then(Value::as_u64)
            .unwrap_or_default() as u32
    };
    TokenUsage { prompt_tokens: read(prompt_key), completion_tokens: read(completion_key) }
}

fn classify_status(status: StatusCode, detail: String) -> ModelError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ModelError::Transient(detail)
    } else {
        ModelError::Fatal(detail)
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        let body = match self.provider {
            ModelProvider::OpenAi | ModelProvider::Ollama => openai_body(request),
            ModelProvider::Anthropic => anthropic_body(request),
        };

        let mut outbound = self.http.post(self.chat_url()).json(&body);
        if let Some(key) = &self.api_key {
            outbound = match self.provider {
                ModelProvider::Anthropic => outbound
                    .header("x-api-key", key.expose_secret())
                    .header("anthropic-version", ANTHROPIC_VERSION),
                _ => outbound.bearer_auth(key.expose_secret()),
            };
        }

        let response = outbound
            .send()
            .await
            .map_err(|error| ModelError::Transient(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = format!("{} returned {}", request.model, status);
            return Err(classify_status(status, detail));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|error| ModelError::Fatal(format!("unreadable response body: {error}")))?;

        match self.provider {
            ModelProvider::OpenAi | ModelProvider::Ollama => parse_openai_response(&payload),
            ModelProvider::Anthropic => parse_anthropic_response(&payload),
        }
    }
}
