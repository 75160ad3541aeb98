use matsearch_core::{
    Error, ImageResult, Result, SearchProvider, SearchQuery, SearchResponse, SearchResult,
    MAX_IMAGES,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_SEARCH_ENDPOINT: &str = "https://serper.dev/search";
pub const DEFAULT_IMAGES_ENDPOINT: &str = "https://serper.dev/images";

/// Fields that may carry an image URL, in priority order.
pub const IMAGE_URL_FIELDS: &[&str] = &[
    "imageUrl",
    "image",
    "link",
    "url",
    "originalImageUrl",
    "thumbnailUrl",
    "original_image_url",
    "thumbnail_url",
];

/// Fields that may carry an image caption, in priority order.
pub const IMAGE_TITLE_FIELDS: &[&str] = &["title", "snippet", "text", "site_title"];

pub fn timeout_ms_clamped(ms: u64) -> u64 {
    ms.clamp(1_000, 60_000)
}

#[derive(Debug, Clone)]
pub struct SerperClient {
    client: reqwest::Client,
    api_key: String,
    search_endpoint: String,
    images_endpoint: String,
    timeout_ms: u64,
}

impl SerperClient {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            search_endpoint: DEFAULT_SEARCH_ENDPOINT.to_string(),
            images_endpoint: DEFAULT_IMAGES_ENDPOINT.to_string(),
            timeout_ms: 20_000,
        }
    }

    pub fn with_endpoints(mut self, search: impl Into<String>, images: impl Into<String>) -> Self {
        self.search_endpoint = search.into();
        self.images_endpoint = images.into();
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = timeout_ms_clamped(ms);
        self
    }

    async fn post(&self, endpoint: &str, q: &SearchQuery) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(endpoint)
            .header("X-API-KEY", &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&serde_json::json!({ "q": q.query, "num": q.max_results }))
            .timeout(std::time::Duration::from_millis(self.timeout_ms))
            .send()
            .await
    }
}

/// Organic payload read field by field: `null`, missing and non-string values all count
/// as absent, so one odd field never discards the rest of the hits.
#[derive(Debug, Default)]
struct SerperSearchResponse {
    organic: Vec<SearchResult>,
    images: Vec<Value>,
}

impl SerperSearchResponse {
    fn from_value(v: &Value) -> Self {
        let list = |k: &str| v.get(k).and_then(Value::as_array).cloned().unwrap_or_default();
        let text = |o: &Value, k: &str| {
            o.get(k)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let organic = list("organic")
            .iter()
            .filter(|o| o.is_object())
            .map(|o| SearchResult {
                title: text(o, "title"),
                url: text(o, "link"),
                snippet: text(o, "snippet"),
            })
            .collect();
        Self {
            organic,
            images: list("images"),
        }
    }
}

/// The image endpoint answers `{ "images": [...] }`; some deployments return the bare list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SerperImagesResponse {
    List(Vec<Value>),
    Wrapped {
        #[serde(default)]
        images: Vec<Value>,
    },
}

impl SerperImagesResponse {
    fn into_images(self) -> Vec<Value> {
        match self {
            Self::List(v) => v,
            Self::Wrapped { images } => images,
        }
    }
}

/// Provider image record reduced to its non-empty string fields.
#[derive(Debug, Default)]
struct ImageRecord<'a> {
    fields: BTreeMap<&'a str, &'a str>,
}

impl<'a> ImageRecord<'a> {
    fn from_value(v: &'a Value) -> Self {
        let mut fields = BTreeMap::new();
        if let Some(obj) = v.as_object() {
            for (k, v) in obj {
                if let Some(s) = v.as_str().filter(|s| !s.is_empty()) {
                    fields.insert(k.as_str(), s);
                }
            }
        }
        Self { fields }
    }

    fn first_of(&self, rules: &[&str]) -> Option<&'a str> {
        rules.iter().find_map(|k| self.fields.get(*k).copied())
    }

    fn resolve(&self) -> Option<ImageResult> {
        let url = self.first_of(IMAGE_URL_FIELDS)?;
        Some(ImageResult {
            url: url.to_string(),
            title: self.first_of(IMAGE_TITLE_FIELDS).unwrap_or_default().to_string(),
        })
    }
}

/// Takes the first `cap` raw records, then drops those without a resolvable URL.
pub fn normalize_images(raw: &[Value], cap: usize) -> Vec<ImageResult> {
    raw.iter()
        .take(cap)
        .filter_map(|v| ImageRecord::from_value(v).resolve())
        .collect()
}

#[async_trait::async_trait]
impl SearchProvider for SerperClient {
    fn name(&self) -> &'static str {
        "serper"
    }

    async fn search(&self, q: &SearchQuery) -> Result<SearchResponse> {
        let resp = self
            .post(&self.search_endpoint, q)
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Search(format!(
                "serper search HTTP {status}: {body}"
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::Search(e.to_string()))?;
        let parsed = SerperSearchResponse::from_value(&body);

        Ok(SearchResponse {
            results: parsed.organic,
            images: normalize_images(&parsed.images, MAX_IMAGES),
            provider: "serper".to_string(),
        })
    }

    async fn search_images(&self, q: &SearchQuery) -> Option<Vec<ImageResult>> {
        let resp = match self.post(&self.images_endpoint, q).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "serper image search request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            tracing::debug!(status = %resp.status(), "serper image search HTTP error");
            return None;
        }
        let parsed: SerperImagesResponse = resp.json().await.ok()?;
        Some(normalize_images(&parsed.into_images(), q.max_results))
    }
}
