//! Shared test helpers: scripted completion providers.

use std::collections::VecDeque;
use std::sync::Mutex;

use flowbot_core::error::ProviderError;
use flowbot_core::provider::{CompletionProvider, CompletionRequest, CompletionResponse, Usage};

/// A mock provider that replays a script of replies and records every request.
///
/// Panics if more calls are made than replies provided.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(replies.into_iter().map(|r| Ok(r.into())))
    }

    /// Replies and failures, in call order.
    pub fn with_script(script: impl IntoIterator<Item = Result<String, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// System prompts sent so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.system_prompt.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted_mock"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len()
        };
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(make_response(&text)),
            Some(Err(e)) => Err(e),
            None => panic!("ScriptedProvider: no more replies (call #{call})"),
        }
    }
}

/// A model that never settles: every reply requests a section not seen before.
pub struct EndlessDirectiveProvider {
    calls: Mutex<usize>,
}

impl EndlessDirectiveProvider {
    pub fn new() -> Self {
        Self { calls: Mutex::new(0) }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl CompletionProvider for EndlessDirectiveProvider {
    fn name(&self) -> &str {
        "endless_mock"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        Ok(make_response(&format!("Un momento 🧩seccion_{}🧩", *calls)))
    }
}

pub fn make_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        text: text.to_string(),
        model: Some("mock-model".into()),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
    }
}
