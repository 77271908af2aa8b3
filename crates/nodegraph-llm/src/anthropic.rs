use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use nodegraph_core::config::LlmConfig;
use nodegraph_core::error::{NodeGraphError, Result};
use nodegraph_core::llm::{parse_json_reply, LlmBackend, LlmRequest, LlmResponse, ResponseSchema};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// [`LlmBackend`] over the Anthropic Messages API.
pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    endpoint: String,
}

// ── Anthropic Messages API request/response types ──────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

impl AnthropicBackend {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            endpoint: ANTHROPIC_API_URL.to_string(),
        }
    }

    /// Point the backend at a different Messages endpoint (proxies, mocks).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn system_prompt(schema: Option<ResponseSchema>) -> Option<String> {
        schema.map(|schema| {
            format!(
                "Respond with a single JSON object and nothing else. No markdown, no commentary.\n\
                 The object must have this shape:\n{}",
                schema.example()
            )
        })
    }

    fn first_text(response: AnthropicResponse) -> Option<String> {
        response.content.into_iter().find_map(|block| {
            if block.block_type == "text" {
                block.text
            } else {
                None
            }
        })
    }
}

#[async_trait]
impl LlmBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: Self::system_prompt(request.response_format),
            messages: vec![Message {
                role: "user",
                content: &request.query,
            }],
        };

        tracing::debug!(
            model = %self.model,
            schema = ?request.response_format,
            "Sending request to Anthropic API"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| NodeGraphError::Provider(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Ok(LlmResponse::Failure(format!(
                "Anthropic API returned status {status}: {body}"
            )));
        }

        let api_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| NodeGraphError::Provider(format!("Failed to parse API response: {e}")))?;
        let stop_reason = api_response.stop_reason.clone();

        let Some(text) = Self::first_text(api_response) else {
            return Ok(LlmResponse::Failure(
                "No text content block in API response".to_string(),
            ));
        };

        tracing::debug!(
            stop_reason = ?stop_reason,
            response_len = text.len(),
            "Received response from Anthropic API"
        );

        if request.response_format.is_some() {
            if let Some(value) = parse_json_reply(&text) {
                return Ok(LlmResponse::Structured(value));
            }
            tracing::warn!(
                response_len = text.len(),
                "Structured request answered with unparsable text"
            );
        }
        Ok(LlmResponse::Raw(text))
    }
}
