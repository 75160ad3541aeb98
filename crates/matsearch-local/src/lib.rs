use matsearch_core::{Error, Result};
use std::time::Duration;

pub mod config;
pub mod openai;
pub mod orchestrator;
pub mod serper;
pub mod telemetry;

pub use config::Config;
pub use openai::OpenAiClient;
pub use orchestrator::Orchestrator;
pub use serper::SerperClient;
pub use telemetry::AppsScriptSink;

/// Shared HTTP client for all outbound provider calls.
///
/// Only the connect phase is bounded here; each adapter applies its own request
/// timeout (or none, for completions unless configured).
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("matsearch-local/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| Error::NotConfigured(e.to_string()))
}
