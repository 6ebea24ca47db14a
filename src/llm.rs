//! Completion client behind the `ai` and `sentiment` SQL functions.
//!
//! The engine invokes scalar functions synchronously per row, so the client
//! contract is a plain blocking call. `OpenAiClient` talks to any
//! OpenAI-compatible `/chat/completions` endpoint; `Memoized` wraps a client
//! with a bounded cache so repeated identical inputs short-circuit to the
//! cached answer instead of paying another network round-trip.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::cache::LruCache;

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// A completion backend. `None` means the endpoint answered with an empty
/// message body and maps to SQL null.
pub trait LlmClient: Send + Sync {
    fn complete(&self, system: Option<&str>, text: &str) -> Result<Option<String>>;
}

/// Client for OpenAI-compatible chat-completion endpoints.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiClient {
    /// Reads `OPENAI_API_KEY` (required) and `OPENAI_BASE_URL` (optional).
    pub fn from_env() -> Result<Self> {
        let api_key =
            std::env::var("OPENAI_API_KEY").map_err(|_| anyhow!("OPENAI_API_KEY is not set"))?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::new(api_key, base_url))
    }

    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn send(&self, url: &str, payload: &serde_json::Value) -> Result<Option<String>> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .context("completion request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("completion endpoint returned {status}: {body}");
        }
        let body: ChatResponse = response
            .json()
            .await
            .context("malformed completion response")?;
        Ok(body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content))
    }
}

impl LlmClient for OpenAiClient {
    fn complete(&self, system: Option<&str>, text: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": text}));
        let payload = json!({"model": self.model, "messages": messages});
        debug!(model = %self.model, "issuing completion request");

        // The engine calls this from inside its own async runtime; run the
        // request on a scoped thread with a private runtime rather than
        // nesting block_on on an executor worker.
        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .context("failed to build completion runtime")?;
                    runtime.block_on(self.send(&url, &payload))
                })
                .join()
                .map_err(|_| anyhow!("completion request thread panicked"))?
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Memoizing decorator keyed by the exact `(system, text)` pair.
///
/// The cache is bounded and owned by whoever constructs the decorator, so its
/// lifetime follows the owner rather than the process.
pub struct Memoized {
    inner: Arc<dyn LlmClient>,
    cache: Mutex<LruCache<(Option<String>, String), Option<String>>>,
}

impl Memoized {
    pub fn new(inner: Arc<dyn LlmClient>, capacity: usize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl LlmClient for Memoized {
    fn complete(&self, system: Option<&str>, text: &str) -> Result<Option<String>> {
        let key = (system.map(str::to_string), text.to_string());
        if let Some(hit) = self.cache.lock().get(&key) {
            return Ok(hit.clone());
        }
        // The lock is not held across the network call; a concurrent miss on
        // the same key may duplicate one request, which is harmless.
        let value = self.inner.complete(system, text)?;
        self.cache.lock().insert(key, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    impl LlmClient for Counting {
        fn complete(&self, system: Option<&str>, text: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(format!("{}:{text}", system.unwrap_or("-"))))
        }
    }

    #[test]
    fn identical_inputs_hit_the_cache() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let memo = Memoized::new(inner.clone(), 16);
        assert_eq!(
            memo.complete(None, "hello").unwrap(),
            Some("-:hello".to_string())
        );
        assert_eq!(
            memo.complete(None, "hello").unwrap(),
            Some("-:hello".to_string())
        );
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn system_prompt_is_part_of_the_key() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let memo = Memoized::new(inner.clone(), 16);
        memo.complete(None, "hello").unwrap();
        memo.complete(Some("be brief"), "hello").unwrap();
        memo.complete(Some("be brief"), "hello").unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn distinct_inputs_each_call_through() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
        });
        let memo = Memoized::new(inner.clone(), 16);
        memo.complete(None, "a").unwrap();
        memo.complete(None, "b").unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
