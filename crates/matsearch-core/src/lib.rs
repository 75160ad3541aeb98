use serde::{Deserialize, Serialize};

pub mod context;
pub mod prompt;
pub mod request;

pub use request::{ConversationRequest, MAX_HISTORY};

/// Organic results fed into the context block and surfaced as sources.
pub const MAX_CONTEXT_RESULTS: usize = 8;
/// Results requested from the image search endpoint.
pub const MAX_IMAGE_RESULTS: usize = 4;
/// Images surfaced to the caller when falling back to images embedded in the organic payload.
pub const MAX_IMAGES: usize = 6;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    MissingCredentials(String),
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("search failed: {0}")]
    Search(String),
    #[error("{0}")]
    Completion(String),
    #[error("OpenAI 未回傳文字")]
    EmptyCompletion,
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("telemetry failed: {0}")]
    Telemetry(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Roles a caller may put in conversation history.
    pub fn parse_turn(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One prior turn of caller-supplied history. `role` is never `System`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// A message in the sequence sent to the completion provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: Role,
    pub content: String,
}

impl CompletionMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

impl From<&ChatTurn> for CompletionMessage {
    fn from(t: &ChatTurn) -> Self {
        Self {
            role: t.role,
            content: t.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: usize,
}

/// Organic web hit. Missing provider fields are normalized to empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResult {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    /// Images some providers embed in the organic payload.
    pub images: Vec<ImageResult>,
    pub provider: String,
}

/// Success envelope. Empty `sources`/`images` are omitted rather than serialized as `[]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ImageResult>>,
}

impl ChatResponse {
    pub fn new(text: impl Into<String>, sources: Vec<Source>, images: Vec<ImageResult>) -> Self {
        Self {
            text: text.into(),
            sources: (!sources.is_empty()).then_some(sources),
            images: (!images.is_empty()).then_some(images),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceType {
    Template,
    #[serde(rename = "Free-form")]
    FreeForm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// One experiment round as recorded by the telemetry sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentRecord {
    pub user_id: String,
    pub interface_type: InterfaceType,
    pub input_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_length: Option<usize>,
    pub thought_time: f64,
    pub input_duration: f64,
    #[serde(default)]
    pub click_path: Vec<String>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<ResponseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Client-captured engagement fields that may ride along with a chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentContext {
    pub user_id: String,
    pub interface_type: InterfaceType,
    #[serde(default)]
    pub thought_time: f64,
    #[serde(default)]
    pub input_duration: f64,
    #[serde(default)]
    pub click_path: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Success { length: usize },
    Error { message: String },
}

impl ExperimentContext {
    /// Completes the record once the request outcome is known.
    /// `now` is used only when the client did not stamp the round itself.
    pub fn finish(self, input_text: &str, outcome: ResponseOutcome, now: String) -> ExperimentRecord {
        let (response_status, response_length, error_message) = match outcome {
            ResponseOutcome::Success { length } => (ResponseStatus::Success, length, None),
            ResponseOutcome::Error { message } => (ResponseStatus::Error, 0, Some(message)),
        };
        ExperimentRecord {
            user_id: self.user_id,
            interface_type: self.interface_type,
            input_text: input_text.to_string(),
            input_length: Some(input_text.chars().count()),
            thought_time: self.thought_time,
            input_duration: self.input_duration,
            click_path: self.click_path,
            timestamp: self.timestamp.filter(|s| !s.trim().is_empty()).unwrap_or(now),
            response_status: Some(response_status),
            response_length: Some(response_length),
            error_message,
        }
    }
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse>;
    /// Optional enrichment: implementations report failure as `None`, never as an error.
    async fn search_images(&self, q: &SearchQuery) -> Option<Vec<ImageResult>>;
}

#[async_trait::async_trait]
pub trait CompletionProvider: Send + Sync {
    fn model(&self) -> &str;
    async fn complete(&self, messages: &[CompletionMessage], api_key: &str) -> Result<String>;
}

#[async_trait::async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn record(&self, rec: &ExperimentRecord) -> Result<()>;
}
