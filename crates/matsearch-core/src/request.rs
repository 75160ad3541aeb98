use serde_json::Value;

use crate::{ChatTurn, Error, ExperimentContext, Result, Role};

/// Most recent raw history entries considered per request.
pub const MAX_HISTORY: usize = 20;

const MISSING_MESSAGE: &str = "缺少 message 欄位";
const INVALID_JSON: &str = "Invalid JSON body";

/// A validated `/api/chat` payload. Request-scoped; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRequest {
    /// Trimmed, non-empty.
    pub message: String,
    /// Trimmed, non-empty when present.
    pub api_key: Option<String>,
    pub history: Vec<ChatTurn>,
    pub experiment: Option<ExperimentContext>,
}

impl ConversationRequest {
    pub fn new(message: impl Into<String>) -> Result<Self> {
        let message = message.into().trim().to_string();
        if message.is_empty() {
            return Err(Error::InvalidRequest(MISSING_MESSAGE.to_string()));
        }
        Ok(Self {
            message,
            api_key: None,
            history: Vec::new(),
            experiment: None,
        })
    }

    pub fn from_body(body: &[u8]) -> Result<Self> {
        let v: Value = serde_json::from_slice(body)
            .map_err(|_| Error::InvalidRequest(INVALID_JSON.to_string()))?;
        Self::from_value(&v)
    }

    /// Field types are checked leniently: a non-string `message` counts as missing,
    /// a non-array `history` as empty, and a malformed `experiment` is ignored.
    pub fn from_value(v: &Value) -> Result<Self> {
        let message = v
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidRequest(MISSING_MESSAGE.to_string()))?;

        let api_key = v
            .get("apiKey")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let history = match v.get("history") {
            Some(Value::Array(raw)) => bound_history(raw),
            _ => Vec::new(),
        };

        let experiment = v
            .get("experiment")
            .cloned()
            .and_then(|e| serde_json::from_value::<ExperimentContext>(e).ok());

        Ok(Self {
            message: message.to_string(),
            api_key,
            history,
            experiment,
        })
    }
}

/// Keeps the last [`MAX_HISTORY`] raw entries, then drops any entry whose role is not
/// `user`/`assistant` or whose content is not a non-empty string after trimming.
///
/// The window is applied before filtering, so invalid entries inside the window
/// still count against it.
pub fn bound_history(raw: &[Value]) -> Vec<ChatTurn> {
    let start = raw.len().saturating_sub(MAX_HISTORY);
    raw[start..].iter().filter_map(turn_from_value).collect()
}

fn turn_from_value(v: &Value) -> Option<ChatTurn> {
    let role = v.get("role").and_then(Value::as_str).and_then(Role::parse_turn)?;
    let content = v.get("content").and_then(Value::as_str)?.trim();
    if content.is_empty() {
        return None;
    }
    Some(ChatTurn {
        role,
        content: content.to_string(),
    })
}
