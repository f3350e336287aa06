//! Protocol module for relayed request/response structures
//!
//! This module defines the canonical data models the relay works with.
//! These structures are:
//! - Provider-agnostic
//! - Shared by unary and streaming paths
//! - The only input to token and cost accounting

pub mod types;

pub use types::{
    ChatRequest, ChatResponse, ChatStreamChunk, CompletionUsage, Message, MessageDelta,
    MessageRole, ResponseChoice,
};
