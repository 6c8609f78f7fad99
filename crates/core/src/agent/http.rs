//! # Chat-Completions Agent
//!
//! [`AgentPort`] backed by any OpenAI-compatible `/chat/completions`
//! endpoint. The role's declared output schema goes into the system prompt,
//! the structured input goes in as the user message, and the first JSON
//! object found in the reply becomes the output.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{AgentPort, AgentRequest, AgentRole};
use crate::error::AgentError;
use crate::models::ModelParameters;
use crate::stages::{self, extract_json_object, strip_code_fences};

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Agent port speaking the OpenAI chat-completions protocol
#[derive(Debug, Clone)]
pub struct ChatCompletionsAgent {
    client: reqwest::Client,
    api_key: String,
}

impl ChatCompletionsAgent {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }

    /// Read the API key from the provider's environment variable
    pub fn from_env(parameters: &ModelParameters) -> Result<Self, AgentError> {
        let key_env = parameters.provider.api_key_env();
        match std::env::var(key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(Self::new(key)),
            _ => Err(AgentError::Auth(format!(
                "{} is not set for provider {}",
                key_env,
                parameters.provider.display_name()
            ))),
        }
    }

    fn system_prompt(role: AgentRole) -> String {
        let spec = stages::spec(role);
        let schema = serde_json::to_string_pretty(&(spec.output_schema)())
            .unwrap_or_else(|_| "{}".to_string());
        format!(
            "You are the {role} agent of a software delivery pipeline.\n\
             Task: {summary}.\n\n\
             Reply with a single JSON object matching this JSON Schema and nothing else:\n{schema}",
            role = role,
            summary = spec.summary,
            schema = schema,
        )
    }

    fn user_prompt(request: &AgentRequest) -> String {
        let input =
            serde_json::to_string_pretty(&request.input).unwrap_or_else(|_| "{}".to_string());
        format!("Input:\n{}", input)
    }

    /// Generators often wrap source in Markdown fences inside the JSON string
    fn clean_output(role: AgentRole, mut output: Value) -> Value {
        if matches!(role, AgentRole::Coding | AgentRole::TestGeneration) {
            if let Some(Value::String(code)) = output.get_mut("code") {
                *code = strip_code_fences(code);
            }
        }
        output
    }
}

/// Map an HTTP status to an error class
pub(crate) fn classify_status(status: StatusCode, body: &str) -> AgentError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::Auth(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            AgentError::Transient(message)
        }
        s if s.is_server_error() => AgentError::Transient(message),
        _ => AgentError::Fatal(message),
    }
}

fn classify_transport(err: &reqwest::Error) -> AgentError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        AgentError::Transient(err.to_string())
    } else {
        AgentError::Fatal(err.to_string())
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl AgentPort for ChatCompletionsAgent {
    async fn invoke(&self, request: &AgentRequest) -> Result<Value, AgentError> {
        let params = &request.parameters;
        let url = format!("{}/chat/completions", params.endpoint());

        debug!(
            provider = params.provider.display_name(),
            model = %params.model,
            role = %request.role,
            "Invoking chat-completions agent"
        );

        let body = ChatRequest {
            model: &params.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: Self::system_prompt(request.role),
                },
                ChatMessage {
                    role: "user",
                    content: Self::user_prompt(request),
                },
            ],
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::MalformedOutput(format!("unreadable response body: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AgentError::MalformedOutput("response has no content".to_string()))?;

        let output = extract_json_object(&content).ok_or_else(|| {
            AgentError::MalformedOutput(format!(
                "no JSON object in reply: {}",
                truncate(&content, 200)
            ))
        })?;

        Ok(Self::clean_output(request.role, output))
    }
}
