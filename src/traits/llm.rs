//! The LLM client contract and a deterministic in-memory fake for tests.

use async_trait::async_trait;

use crate::error::Result;

/// Capability interface for a text-completion LLM.
///
/// `complete` returns free text; `complete_json` additionally signals to the
/// provider (via prompt construction, which is the caller's responsibility)
/// that a JSON object is expected, and returns the raw response text for the
/// caller to parse. Neither method performs parsing itself — tolerant
/// recovery of malformed JSON lives in the extractor, never here.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate free text from a prompt.
    async fn complete(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String>;

    /// Generate a response expected to be a JSON document.
    async fn complete_json(
        &self,
        prompt: &str,
        system: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String>;

    /// A short name for logging (provider/model identifier).
    fn name(&self) -> &str;
}

/// A canned-response fake used throughout the test suite in place of a real
/// network-calling provider.
///
/// Responses are consumed in FIFO order from an internal queue; calling past
/// the end of the queue repeats the last response, so a test that only cares
/// about the first call need not account for every subsequent one.
pub struct FakeLlmClient {
    responses: parking_lot::Mutex<std::collections::VecDeque<String>>,
    last: parking_lot::Mutex<Option<String>>,
}

impl FakeLlmClient {
    /// Construct a fake that always returns the same response.
    #[must_use]
    pub fn with_response(response: impl Into<String>) -> Self {
        Self::with_responses(vec![response.into()])
    }

    /// Construct a fake that returns each response in order, then repeats
    /// the last one for any further calls.
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: parking_lot::Mutex::new(responses.into()),
            last: parking_lot::Mutex::new(None),
        }
    }

    fn next_response(&self) -> String {
        let mut queue = self.responses.lock();
        if let Some(r) = queue.pop_front() {
            *self.last.lock() = Some(r.clone());
            r
        } else {
            self.last
                .lock()
                .clone()
                .unwrap_or_else(|| "{}".to_string())
        }
    }
}

#[async_trait]
impl LlmClient for FakeLlmClient {
    async fn complete(
        &self,
        _prompt: &str,
        _system: Option<&str>,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String> {
        Ok(self.next_response())
    }

    async fn complete_json(
        &self,
        _prompt: &str,
        _system: Option<&str>,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String> {
        Ok(self.next_response())
    }

    fn name(&self) -> &str {
        "fake-llm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_llm_serves_responses_in_order_then_repeats_last() {
        let client = FakeLlmClient::with_responses(vec!["a".into(), "b".into()]);
        assert_eq!(client.complete("p", None, 0.0, 10).await.unwrap(), "a");
        assert_eq!(client.complete("p", None, 0.0, 10).await.unwrap(), "b");
        assert_eq!(client.complete("p", None, 0.0, 10).await.unwrap(), "b");
    }

    #[tokio::test]
    async fn fake_llm_with_single_response_always_returns_it() {
        let client = FakeLlmClient::with_response("{}");
        assert_eq!(client.complete_json("p", None, 0.0, 10).await.unwrap(), "{}");
        assert_eq!(client.complete_json("p", None, 0.0, 10).await.unwrap(), "{}");
    }
}
