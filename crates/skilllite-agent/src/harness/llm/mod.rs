pub mod client;
pub mod error_recovery;
pub mod middleware;
pub mod prompt_optimizer;
pub mod response_parser;
pub mod router;

pub use client::{ApiType, AsyncLlmClient, LlmTransportError, ProfileSpec};
pub use middleware::{LLMRequest, Middleware, MiddlewarePipeline};
pub use router::ModelRouter;
