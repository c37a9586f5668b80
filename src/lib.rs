//! Chat-turn orchestration for a diagram assistant.
//!
//! Invariant: every turn ends its event stream with exactly one `finish` or
//! `error` event, and generation never runs more than
//! [`orchestrator::MAX_STEPS`] steps.
//!
//! # Public API Overview
//! - Load settings with [`ServerConfig`] and serve them with [`server::serve`].
//! - Run a turn without HTTP through [`ChatService::prepare`] and
//!   [`ChatService::execute`].
//! - Pick providers with [`resolver::resolve`]; swap backends through
//!   [`BackendFactory`].
//! - Recover malformed tool input with [`repair::recover_tool_input`].

#![allow(clippy::too_many_arguments, clippy::type_complexity)]

pub mod config;
pub mod logging;

pub mod cache;
pub mod error;
pub mod instructions;
pub mod message;
pub mod mode;
pub mod orchestrator;
pub mod prompt;
pub mod repair;
pub mod resolver;
pub mod server;
pub mod service;
pub mod stream;
pub mod tools;

pub use crate::cache::CacheTable;
pub use crate::config::{ConfigError, ProviderKind, ServerConfig};
pub use crate::error::{ChatError, EnhanceError};
pub use crate::message::{ChatMessage, ChatRequest, MessagePart};
pub use crate::resolver::{
    BackendFactory, ClientOverrides, DefaultBackendFactory, ProviderSelection,
};
pub use crate::service::{ChatService, TurnHeaders, TurnStart};
pub use crate::stream::UiEvent;
