//! Per-request flow for `/api/chat`:
//! validate → search (best-effort) → assemble prompt → complete → shape response.

use matsearch_core::context::{build_context, build_sources};
use matsearch_core::{
    prompt, ChatResponse, CompletionProvider, ConversationRequest, Error, ImageResult,
    ResponseOutcome, Result, SearchProvider, SearchQuery, Source, TelemetrySink,
    MAX_CONTEXT_RESULTS, MAX_IMAGES, MAX_IMAGE_RESULTS,
};
use std::sync::Arc;
use std::time::Instant;

use crate::telemetry;

const MISSING_KEY: &str = "請先設定 API Key（Study Control Bar 儲存至本機後使用）";

/// What the search stage contributes to one request. Empty when search is skipped or fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grounding {
    pub context: String,
    pub sources: Vec<Source>,
    pub images: Vec<ImageResult>,
}

/// Stateless across requests: every field is immutable configuration.
#[derive(Clone)]
pub struct Orchestrator {
    completion: Arc<dyn CompletionProvider>,
    search: Option<Arc<dyn SearchProvider>>,
    default_api_key: Option<String>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl Orchestrator {
    pub fn new(completion: Arc<dyn CompletionProvider>) -> Self {
        Self {
            completion,
            search: None,
            default_api_key: None,
            telemetry: None,
        }
    }

    pub fn with_search(mut self, search: Arc<dyn SearchProvider>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_default_api_key(mut self, key: Option<String>) -> Self {
        self.default_api_key = key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn search_enabled(&self) -> bool {
        self.search.is_some()
    }

    pub fn telemetry(&self) -> Option<Arc<dyn TelemetrySink>> {
        self.telemetry.clone()
    }

    /// Entry point for a raw HTTP call: method check, body parse, then [`Self::handle`].
    pub async fn handle_http(&self, method: &str, body: &[u8]) -> Result<ChatResponse> {
        if method != "POST" {
            return Err(Error::MethodNotAllowed);
        }
        let req = ConversationRequest::from_body(body)?;
        self.handle(req).await
    }

    /// [`Self::answer`], then a background telemetry write if the request carried
    /// experiment fields. The write never delays or alters the returned outcome.
    pub async fn handle(&self, req: ConversationRequest) -> Result<ChatResponse> {
        let t0 = Instant::now();
        let out = self.answer(&req).await;
        match &out {
            Ok(r) => tracing::info!(
                model = self.completion.model(),
                elapsed_ms = t0.elapsed().as_millis() as u64,
                history = req.history.len(),
                sources = r.sources.as_ref().map_or(0, Vec::len),
                images = r.images.as_ref().map_or(0, Vec::len),
                "chat answered"
            ),
            Err(e) => tracing::error!(
                model = self.completion.model(),
                elapsed_ms = t0.elapsed().as_millis() as u64,
                error = %e,
                "chat failed"
            ),
        }
        self.record_round(&req, &out);
        out
    }

    pub async fn answer(&self, req: &ConversationRequest) -> Result<ChatResponse> {
        let api_key = self.resolve_api_key(req)?;

        let grounding = match &self.search {
            Some(search) => Self::search_stage(search.as_ref(), &req.message).await,
            None => {
                tracing::debug!("no search credential configured; answering ungrounded");
                Grounding::default()
            }
        };

        let messages = prompt::assemble(&req.message, &req.history, &grounding.context);
        let text = self.completion.complete(&messages, &api_key).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::EmptyCompletion);
        }

        Ok(ChatResponse::new(text, grounding.sources, grounding.images))
    }

    /// Request key if present, else the configured fallback.
    pub fn resolve_api_key(&self, req: &ConversationRequest) -> Result<String> {
        req.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .or(self.default_api_key.as_deref())
            .map(str::to_string)
            .ok_or_else(|| Error::MissingCredentials(MISSING_KEY.to_string()))
    }

    /// Organic and image search run concurrently and both settle before this returns.
    /// Organic failure discards the whole stage; image failure only drops images.
    pub async fn search_stage(search: &dyn SearchProvider, message: &str) -> Grounding {
        let organic_q = SearchQuery {
            query: message.to_string(),
            max_results: MAX_CONTEXT_RESULTS,
        };
        let images_q = SearchQuery {
            query: message.to_string(),
            max_results: MAX_IMAGE_RESULTS,
        };

        let (organic, images) =
            futures_util::join!(search.search(&organic_q), search.search_images(&images_q));

        let organic = match organic {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    provider = search.name(),
                    error = %e,
                    "search failed; continuing without search context"
                );
                return Grounding::default();
            }
        };

        tracing::debug!(
            provider = %organic.provider,
            results = organic.results.len(),
            inline_images = organic.images.len(),
            "search results received"
        );

        let mut images = images.unwrap_or_default();
        if images.is_empty() {
            images = organic.images;
        }
        images.truncate(MAX_IMAGES);

        Grounding {
            context: build_context(&organic.results, MAX_CONTEXT_RESULTS),
            sources: build_sources(&organic.results, MAX_CONTEXT_RESULTS),
            images,
        }
    }

    fn record_round(&self, req: &ConversationRequest, out: &Result<ChatResponse>) {
        let (Some(sink), Some(ctx)) = (self.telemetry.clone(), req.experiment.clone()) else {
            return;
        };
        let outcome = match out {
            Ok(r) => ResponseOutcome::Success {
                length: r.text.chars().count(),
            },
            Err(e) => ResponseOutcome::Error {
                message: e.to_string(),
            },
        };
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        telemetry::dispatch(sink, ctx.finish(&req.message, outcome, now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matsearch_core::{
        CompletionMessage, ExperimentRecord, InterfaceType, ResponseStatus, Role,
        SearchResponse, SearchResult,
    };
    use std::sync::Mutex;

    /// Completion stub: returns `reply` or `err`, and remembers what it was sent.
    #[derive(Default)]
    struct StubCompletion {
        reply: String,
        err: Option<String>,
        seen: Mutex<Vec<(Vec<CompletionMessage>, String)>>,
    }

    impl StubCompletion {
        fn replying(s: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: s.to_string(),
                ..Default::default()
            })
        }

        fn last_messages(&self) -> Vec<CompletionMessage> {
            self.seen.lock().unwrap().last().unwrap().0.clone()
        }

        fn last_key(&self) -> String {
            self.seen.lock().unwrap().last().unwrap().1.clone()
        }
    }

    #[async_trait::async_trait]
    impl CompletionProvider for StubCompletion {
        fn model(&self) -> &str {
            "stub"
        }

        async fn complete(&self, messages: &[CompletionMessage], api_key: &str) -> Result<String> {
            self.seen
                .lock()
                .unwrap()
                .push((messages.to_vec(), api_key.to_string()));
            match &self.err {
                Some(e) => Err(Error::Completion(e.clone())),
                None => Ok(self.reply.clone()),
            }
        }
    }

    struct StubSearch {
        organic: std::result::Result<Vec<SearchResult>, String>,
        inline_images: Vec<ImageResult>,
        images: Option<Vec<ImageResult>>,
    }

    #[async_trait::async_trait]
    impl SearchProvider for StubSearch {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn search(&self, _q: &SearchQuery) -> Result<SearchResponse> {
            match &self.organic {
                Ok(rs) => Ok(SearchResponse {
                    results: rs.clone(),
                    images: self.inline_images.clone(),
                    provider: "stub".to_string(),
                }),
                Err(e) => Err(Error::Search(e.clone())),
            }
        }

        async fn search_images(&self, _q: &SearchQuery) -> Option<Vec<ImageResult>> {
            self.images.clone()
        }
    }

    struct RecordingSink {
        tx: tokio::sync::mpsc::UnboundedSender<ExperimentRecord>,
    }

    #[async_trait::async_trait]
    impl TelemetrySink for RecordingSink {
        async fn record(&self, rec: &ExperimentRecord) -> Result<()> {
            let _ = self.tx.send(rec.clone());
            Err(Error::Telemetry("sink is down".to_string()))
        }
    }

    fn hit(i: usize) -> SearchResult {
        SearchResult {
            title: format!("Result {i}"),
            url: format!("https://example.com/{i}"),
            snippet: format!("snippet {i}"),
        }
    }

    fn img(u: &str) -> ImageResult {
        ImageResult {
            url: u.to_string(),
            title: String::new(),
        }
    }

    fn req(message: &str) -> ConversationRequest {
        ConversationRequest::new(message).unwrap()
    }

    #[tokio::test]
    async fn ungrounded_answer_without_search_has_no_lists() {
        let stub = StubCompletion::replying("建議使用 6061 鋁合金");
        let o = Orchestrator::new(stub.clone()).with_default_api_key(Some("sk-env".to_string()));

        let r = o.handle(req("需要耐高溫鋁合金")).await.unwrap();
        assert_eq!(r, ChatResponse::new("建議使用 6061 鋁合金", vec![], vec![]));
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            serde_json::json!({ "text": "建議使用 6061 鋁合金" })
        );

        let msgs = stub.last_messages();
        assert_eq!(msgs[0].content, prompt::UNGROUNDED_INSTRUCTION);
        assert_eq!(msgs.last().unwrap().content, "需要耐高溫鋁合金");
        assert_eq!(stub.last_key(), "sk-env");
    }

    #[tokio::test]
    async fn request_key_wins_over_fallback() {
        let stub = StubCompletion::replying("ok");
        let o = Orchestrator::new(stub.clone()).with_default_api_key(Some("sk-env".to_string()));
        let mut r = req("x");
        r.api_key = Some("sk-user".to_string());
        o.answer(&r).await.unwrap();
        assert_eq!(stub.last_key(), "sk-user");
    }

    #[tokio::test]
    async fn missing_credentials_is_fatal_and_skips_completion() {
        let stub = StubCompletion::replying("never");
        let o = Orchestrator::new(stub.clone()).with_default_api_key(Some("   ".to_string()));
        let err = o.answer(&req("x")).await.unwrap_err();
        assert!(matches!(err, Error::MissingCredentials(_)));
        assert!(stub.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_post_is_method_not_allowed() {
        let o = Orchestrator::new(StubCompletion::replying("ok"));
        let err = o.handle_http("GET", br#"{"message":"x"}"#).await.unwrap_err();
        assert!(matches!(err, Error::MethodNotAllowed));

        // Methods are case-sensitive; `post` is an extension method, not POST.
        let err = o.handle_http("post", br#"{"message":"x"}"#).await.unwrap_err();
        assert!(matches!(err, Error::MethodNotAllowed));
    }

    #[tokio::test]
    async fn grounded_answer_surfaces_sources_and_images() {
        let stub = StubCompletion::replying("  according to [Result 0](https://example.com/0)  ");
        let search = Arc::new(StubSearch {
            organic: Ok((0..3).map(hit).collect()),
            inline_images: vec![img("https://inline/ignored.png")],
            images: Some(vec![img("https://img/1.png"), img("https://img/2.png")]),
        });
        let o = Orchestrator::new(stub.clone())
            .with_default_api_key(Some("sk".to_string()))
            .with_search(search);

        let r = o.answer(&req("耐候鋼")).await.unwrap();
        assert_eq!(r.text, "according to [Result 0](https://example.com/0)");
        let sources = r.sources.unwrap();
        assert_eq!(sources.len(), 3);
        assert_eq!(sources[2].title, "Result 2");
        assert_eq!(sources[2].url, "https://example.com/2");
        let images = r.images.unwrap();
        assert_eq!(
            images.iter().map(|i| i.url.as_str()).collect::<Vec<_>>(),
            vec!["https://img/1.png", "https://img/2.png"]
        );

        let msgs = stub.last_messages();
        assert!(msgs[0].content.starts_with(prompt::GROUNDED_INSTRUCTION));
        assert!(msgs[0].content.contains("[3] 標題: Result 2"));
        assert_eq!(msgs[1].content, prompt::grounded_user("耐候鋼"));
    }

    #[tokio::test]
    async fn inline_images_fill_in_when_image_search_fails() {
        let search = Arc::new(StubSearch {
            organic: Ok(vec![hit(0)]),
            inline_images: (0..9).map(|i| img(&format!("https://inline/{i}"))).collect(),
            images: None,
        });
        let g = Orchestrator::search_stage(search.as_ref(), "q").await;
        assert_eq!(g.images.len(), MAX_IMAGES);
        assert_eq!(g.images[0].url, "https://inline/0");
    }

    #[tokio::test]
    async fn search_failure_degrades_to_ungrounded() {
        let stub = StubCompletion::replying("plain answer");
        let search = Arc::new(StubSearch {
            organic: Err("HTTP 403 Forbidden".to_string()),
            inline_images: vec![],
            images: Some(vec![img("https://img/1.png")]),
        });
        let o = Orchestrator::new(stub.clone())
            .with_default_api_key(Some("sk".to_string()))
            .with_search(search);

        let r = o.answer(&req("q")).await.unwrap();
        assert_eq!(r, ChatResponse::new("plain answer", vec![], vec![]));
        assert_eq!(stub.last_messages()[0].content, prompt::UNGROUNDED_INSTRUCTION);
    }

    #[tokio::test]
    async fn empty_search_results_stay_ungrounded() {
        let stub = StubCompletion::replying("ok");
        let search = Arc::new(StubSearch {
            organic: Ok(vec![]),
            inline_images: vec![],
            images: Some(vec![]),
        });
        let o = Orchestrator::new(stub.clone())
            .with_default_api_key(Some("sk".to_string()))
            .with_search(search);
        let r = o.answer(&req("q")).await.unwrap();
        assert!(r.sources.is_none() && r.images.is_none());
        assert_eq!(stub.last_messages()[1].content, "q");
    }

    #[tokio::test]
    async fn blank_completion_is_empty_completion_error() {
        let o = Orchestrator::new(StubCompletion::replying(" \n "))
            .with_default_api_key(Some("sk".to_string()));
        let err = o.answer(&req("q")).await.unwrap_err();
        assert!(matches!(err, Error::EmptyCompletion));
    }

    #[tokio::test]
    async fn completion_error_message_is_passed_through() {
        let stub = Arc::new(StubCompletion {
            err: Some("Incorrect API key provided".to_string()),
            ..Default::default()
        });
        let o = Orchestrator::new(stub).with_default_api_key(Some("sk".to_string()));
        let err = o.answer(&req("q")).await.unwrap_err();
        assert_eq!(err.to_string(), "Incorrect API key provided");
    }

    #[tokio::test]
    async fn identical_requests_yield_identical_text() {
        let o = Orchestrator::new(StubCompletion::replying("deterministic"))
            .with_default_api_key(Some("sk".to_string()));
        let a = o.answer(&req("same")).await.unwrap();
        let b = o.answer(&req("same")).await.unwrap();
        assert_eq!(a.text, b.text);
    }

    #[tokio::test]
    async fn history_is_forwarded_between_system_and_user() {
        let stub = StubCompletion::replying("ok");
        let o = Orchestrator::new(stub.clone()).with_default_api_key(Some("sk".to_string()));
        let body = serde_json::json!({
            "message": "follow-up",
            "history": [
                { "role": "user", "content": "first" },
                { "role": "system", "content": "ignored" },
                { "role": "assistant", "content": "reply" }
            ]
        });
        o.handle_http("POST", body.to_string().as_bytes()).await.unwrap();
        let msgs = stub.last_messages();
        let roles: Vec<_> = msgs.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
    }

    #[tokio::test]
    async fn experiment_round_is_recorded_and_sink_failure_is_ignored() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let o = Orchestrator::new(StubCompletion::replying("四個字元"))
            .with_default_api_key(Some("sk".to_string()))
            .with_telemetry(Arc::new(RecordingSink { tx }));

        let body = serde_json::json!({
            "message": "耐候鋼",
            "experiment": {
                "userId": "P07",
                "interfaceType": "Template",
                "thoughtTime": 2.0,
                "inputDuration": 4.5,
                "clickPath": ["template:weathering-steel"]
            }
        });
        let r = o.handle_http("POST", body.to_string().as_bytes()).await.unwrap();
        assert_eq!(r.text, "四個字元");

        let rec = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.user_id, "P07");
        assert_eq!(rec.interface_type, InterfaceType::Template);
        assert_eq!(rec.input_text, "耐候鋼");
        assert_eq!(rec.response_status, Some(ResponseStatus::Success));
        assert_eq!(rec.response_length, Some(4));
        assert!(!rec.timestamp.is_empty());
    }
}
