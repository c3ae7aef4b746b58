use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use kestrel_core::errors::ProviderError;
use kestrel_core::messages::{ContentBlock, Message};
use kestrel_core::provider::{CompleteOptions, ModelProvider, ModelResponse, Usage};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Reply(ModelResponse),
    Error(ProviderError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Reply(ModelResponse {
            content: vec![ContentBlock::text(text)],
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: text.split_whitespace().count() as u64,
            }),
        })
    }

    pub fn tool_use(id: &str, name: &str, input: Value) -> Self {
        Self::tool_uses(vec![(id, name, input)])
    }

    pub fn tool_uses(calls: Vec<(&str, &str, Value)>) -> Self {
        Self::Reply(ModelResponse {
            content: calls
                .into_iter()
                .map(|(id, name, input)| ContentBlock::tool_use(id, name, input))
                .collect(),
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 5,
            }),
        })
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence and
/// records every request it sees.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<(Vec<Message>, CompleteOptions)>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, response: MockResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<(Vec<Message>, CompleteOptions)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &CompleteOptions,
    ) -> Result<ModelResponse, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push((messages.to_vec(), options.clone()));

        let Some(mut current) = self.responses.lock().pop_front() else {
            return Err(ProviderError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };
        debug!(call = idx, "mock provider responding");

        loop {
            match current {
                MockResponse::Reply(response) => return Ok(response),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}
