//! Onion-model middleware pipeline wrapping the raw LLM call: the first
//! middleware registered is the outermost layer.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::harness::context::ContextMessage;
use crate::harness::types::LLMResponse;

#[derive(Debug, Clone)]
pub struct LLMRequest {
    pub messages: Vec<ContextMessage>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub tools: Option<Vec<Value>>,
    pub tool_choice: Option<String>,
    pub context_length: u32,
    pub metadata: serde_json::Map<String, Value>,
}

impl LLMRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ContextMessage>) -> Self {
        Self {
            messages,
            model: model.into(),
            max_tokens: 4096,
            temperature: 0.3,
            tools: None,
            tool_choice: None,
            context_length: 0,
            metadata: serde_json::Map::new(),
        }
    }
}

/// The rest of the chain. A plain `Fn`, not `FnOnce`, so a middleware can
/// retry by invoking it more than once per `process` call.
pub type Next = Arc<dyn Fn(LLMRequest) -> BoxFuture<'static, Result<LLMResponse>> + Send + Sync>;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn process(&self, request: LLMRequest, next: Next) -> Result<LLMResponse>;
}

/// Anything that can make the raw call at the center of the onion.
#[async_trait]
pub trait LlmCaller: Send + Sync {
    async fn call(&self, request: LLMRequest) -> Result<LLMResponse>;
}

pub struct MiddlewarePipeline {
    client: Arc<dyn LlmCaller>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new(client: Arc<dyn LlmCaller>) -> Self {
        Self { client, middlewares: Vec::new() }
    }

    /// Register a middleware. The first one registered wraps every other
    /// layer, including the raw client call.
    pub fn use_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub async fn execute(&self, request: LLMRequest) -> Result<LLMResponse> {
        let client = self.client.clone();
        let base: Next = Arc::new(move |req| {
            let client = client.clone();
            Box::pin(async move { client.call(req).await })
        });

        let chain = self.middlewares.iter().rev().cloned().fold(base, |next, mw| -> Next {
            Arc::new(move |req| {
                let next = next.clone();
                let mw = mw.clone();
                Box::pin(async move { mw.process(req, next).await })
            })
        });

        chain(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoClient;

    #[async_trait]
    impl LlmCaller for EchoClient {
        async fn call(&self, request: LLMRequest) -> Result<LLMResponse> {
            Ok(LLMResponse { content: request.model, ..Default::default() })
        }
    }

    struct Tag(&'static str, Arc<std::sync::Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Middleware for Tag {
        async fn process(&self, request: LLMRequest, next: Next) -> Result<LLMResponse> {
            self.1.lock().unwrap().push(self.0);
            next(request).await
        }
    }

    #[tokio::test]
    async fn first_registered_runs_outermost() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut pipeline = MiddlewarePipeline::new(Arc::new(EchoClient));
        pipeline.use_middleware(Arc::new(Tag("A", order.clone())));
        pipeline.use_middleware(Arc::new(Tag("B", order.clone())));

        let request = LLMRequest::new("test-model", vec![]);
        let response = pipeline.execute(request).await.unwrap();
        assert_eq!(response.content, "test-model");
        assert_eq!(*order.lock().unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn defaults_match_reference() {
        let request = LLMRequest::new("m", vec![]);
        assert_eq!(request.max_tokens, 4096);
        assert!((request.temperature - 0.3).abs() < f64::EPSILON);
        assert_eq!(request.context_length, 0);
    }
}
