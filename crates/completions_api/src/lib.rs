//! Transport-only client primitives for OpenAI-compatible chat completions.
//!
//! This crate owns request building, header construction, retry, and SSE
//! parsing for the streaming `/chat/completions` endpoint shared by OpenAI,
//! OpenRouter, and Gemini's compatibility layer. It also carries the single
//! non-streaming Gemini `generateContent` call used for grounded web search.
//!
//! Tool-call argument fragments are surfaced as raw text deltas; assembling
//! and validating them is the caller's job.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod grounding;
pub mod headers;
pub mod payload;
pub mod retry;
pub mod sse;
pub mod url;

pub use client::{CancellationSignal, CompletionsApiClient};
pub use config::CompletionsApiConfig;
pub use error::CompletionsApiError;
pub use events::{CompletionFinishReason, CompletionStreamEvent, CompletionUsage};
pub use grounding::{GroundedSearchRequest, GroundedSearchResponse};
pub use payload::ChatCompletionRequest;
pub use sse::SseStreamParser;
pub use url::{normalize_completions_url, normalize_generate_content_url};
