use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Boundary to the autonomous-ai collaborator. All "intelligence" in the
/// system is delegated through this seam; tests substitute a mock.
#[async_trait]
pub trait AiInvoker: Send + Sync {
    /// Invoke the collaborator with a request kind and an opaque payload,
    /// returning its raw JSON reply.
    async fn invoke(&self, kind: &str, payload: Value) -> Result<Value>;
}

#[derive(Clone)]
pub struct AiClient {
    api_url: String,
    api_key: Option<String>,
    model: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct AiRequest<'a> {
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    payload: Value,
}

impl AiClient {
    pub fn new(api_url: String, api_key: Option<String>, model: Option<String>) -> Self {
        Self {
            api_url,
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AiInvoker for AiClient {
    async fn invoke(&self, kind: &str, payload: Value) -> Result<Value> {
        let request = AiRequest {
            kind,
            model: self.model.as_deref(),
            payload,
        };

        let mut req = self.client.post(&self.api_url).json(&request);

        // API key header is optional (not needed for a local backend function)
        if let Some(key) = self.api_key.as_deref() {
            if !key.is_empty() {
                req = req.header("Authorization", format!("Bearer {}", key));
            }
        }

        let response = req
            .send()
            .await
            .with_context(|| format!("Failed to send '{}' request to AI collaborator", kind))?;

        // Surface the response body on HTTP errors for debugging
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("AI collaborator returned error {} for '{}': {}", status, kind, body);
        }

        let reply: Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse '{}' reply as JSON", kind))?;

        Ok(reply)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Mock invoker: records every call and replies with a canned value
    /// (or an error when `fail_with` is set).
    pub struct MockInvoker {
        pub calls: Mutex<Vec<(String, Value)>>,
        pub invocations: AtomicUsize,
        pub reply: Value,
        pub fail_with: Option<String>,
        pub delay: Option<std::time::Duration>,
    }

    impl MockInvoker {
        pub fn replying(reply: Value) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                invocations: AtomicUsize::new(0),
                reply,
                fail_with: None,
                delay: None,
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                invocations: AtomicUsize::new(0),
                reply: Value::Null,
                fail_with: Some(message.to_string()),
                delay: None,
            }
        }

        /// Hold each call open for `delay` before answering.
        pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn call_count(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }

        pub fn kinds(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(kind, _)| kind.clone())
                .collect()
        }
    }

    #[async_trait]
    impl AiInvoker for MockInvoker {
        async fn invoke(&self, kind: &str, payload: Value) -> Result<Value> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push((kind.to_string(), payload));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = &self.fail_with {
                anyhow::bail!("{}", message);
            }
            Ok(self.reply.clone())
        }
    }
}
