use matsearch_core::{CompletionMessage, CompletionProvider, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Chat-completions client. The key is supplied per call, never stored.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout_ms: Option<u64>,
}

impl OpenAiClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout_ms: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// `None` leaves the call unbounded; outer infrastructure is expected to time out.
    pub fn with_timeout_ms(mut self, ms: Option<u64>) -> Self {
        self.timeout_ms = ms;
        self
    }

    fn endpoint_chat_completions(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait::async_trait]
impl CompletionProvider for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[CompletionMessage], api_key: &str) -> Result<String> {
        let req = ChatCompletionsRequest {
            model: &self.model,
            messages,
        };

        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {api_key}"))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&req);
        if let Some(ms) = self.timeout_ms {
            rb = rb.timeout(std::time::Duration::from_millis(ms));
        }

        let resp = rb
            .send()
            .await
            .map_err(|e| Error::Completion(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Completion(e.to_string()))?;
        // Error bodies are not always JSON; treat anything unparseable as empty.
        let parsed: ChatCompletionsResponse = serde_json::from_slice(&bytes).unwrap_or_default();

        if !status.is_success() {
            return Err(Error::Completion(
                parsed
                    .error
                    .and_then(ProviderError::into_message)
                    .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
            ));
        }

        parsed.into_text().ok_or(Error::EmptyCompletion)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: &'a [CompletionMessage],
}

#[derive(Debug, Default, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ProviderError>,
}

impl ChatCompletionsResponse {
    fn into_text(self) -> Option<String> {
        let text = self
            .choices
            .into_iter()
            .next()?
            .message?
            .content?
            .trim()
            .to_string();
        (!text.is_empty()).then_some(text)
    }
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

impl ProviderError {
    /// Prefers `message`, then `code`; empty values are skipped.
    fn into_message(self) -> Option<String> {
        if let Some(m) = self.message.filter(|m| !m.is_empty()) {
            return Some(m);
        }
        match self.code? {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
