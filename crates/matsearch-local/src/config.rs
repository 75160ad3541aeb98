use std::sync::Arc;

use crate::openai::{self, OpenAiClient};
use crate::serper::{self, SerperClient};
use crate::telemetry::AppsScriptSink;
use crate::Orchestrator;

fn first_set(lookup: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        lookup(*k)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Process-wide settings, resolved once at startup and handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Fallback completion key used when a request carries none.
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub completion_timeout_ms: Option<u64>,
    /// Enables the search stage when set.
    pub serper_api_key: Option<String>,
    pub serper_search_endpoint: String,
    pub serper_images_endpoint: String,
    pub search_timeout_ms: u64,
    pub telemetry_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: openai::DEFAULT_BASE_URL.to_string(),
            openai_model: openai::DEFAULT_MODEL.to_string(),
            completion_timeout_ms: None,
            serper_api_key: None,
            serper_search_endpoint: serper::DEFAULT_SEARCH_ENDPOINT.to_string(),
            serper_images_endpoint: serper::DEFAULT_IMAGES_ENDPOINT.to_string(),
            search_timeout_ms: 20_000,
            telemetry_url: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(env)
    }

    /// Values are trimmed; empty counts as unset. Unparseable timeouts fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let ms = |k: &str| first_set(&lookup, &[k]).and_then(|s| s.parse::<u64>().ok());
        Self {
            openai_api_key: first_set(&lookup, &["MATSEARCH_OPENAI_API_KEY", "OPENAI_API_KEY"]),
            openai_base_url: first_set(&lookup, &["MATSEARCH_OPENAI_BASE_URL"])
                .unwrap_or(d.openai_base_url),
            openai_model: first_set(&lookup, &["MATSEARCH_OPENAI_MODEL"])
                .unwrap_or(d.openai_model),
            completion_timeout_ms: ms("MATSEARCH_COMPLETION_TIMEOUT_MS"),
            serper_api_key: first_set(&lookup, &["MATSEARCH_SERPER_API_KEY", "SERPER_API_KEY"]),
            serper_search_endpoint: first_set(&lookup, &["MATSEARCH_SERPER_SEARCH_ENDPOINT"])
                .unwrap_or(d.serper_search_endpoint),
            serper_images_endpoint: first_set(&lookup, &["MATSEARCH_SERPER_IMAGES_ENDPOINT"])
                .unwrap_or(d.serper_images_endpoint),
            search_timeout_ms: ms("MATSEARCH_SEARCH_TIMEOUT_MS")
                .map(serper::timeout_ms_clamped)
                .unwrap_or(d.search_timeout_ms),
            telemetry_url: first_set(&lookup, &["MATSEARCH_TELEMETRY_URL", "GAS_LOG_URL"]),
        }
    }

    pub fn search_enabled(&self) -> bool {
        self.serper_api_key.is_some()
    }

    pub fn build_orchestrator(&self, client: reqwest::Client) -> Orchestrator {
        let completion = OpenAiClient::new(client.clone())
            .with_base_url(&self.openai_base_url)
            .with_model(&self.openai_model)
            .with_timeout_ms(self.completion_timeout_ms);
        let mut o = Orchestrator::new(Arc::new(completion))
            .with_default_api_key(self.openai_api_key.clone());

        if let Some(key) = &self.serper_api_key {
            let search = SerperClient::new(client.clone(), key)
                .with_endpoints(&self.serper_search_endpoint, &self.serper_images_endpoint)
                .with_timeout_ms(self.search_timeout_ms);
            o = o.with_search(Arc::new(search));
        }
        if let Some(url) = &self.telemetry_url {
            o = o.with_telemetry(Arc::new(AppsScriptSink::new(client, url)));
        }
        o
    }

    /// Diagnostic view. Secrets are reported as booleans only.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "completion": {
                "default_api_key": self.openai_api_key.is_some(),
                "base_url": self.openai_base_url,
                "model": self.openai_model,
                "timeout_ms": self.completion_timeout_ms,
            },
            "search": {
                "enabled": self.search_enabled(),
                "search_endpoint": self.serper_search_endpoint,
                "images_endpoint": self.serper_images_endpoint,
                "timeout_ms": self.search_timeout_ms,
            },
            "telemetry": {
                "enabled": self.telemetry_url.is_some(),
            },
        })
    }
}
