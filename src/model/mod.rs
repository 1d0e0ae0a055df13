//! Model-backed patch proposals over an OpenAI-compatible chat endpoint.

pub mod client;
pub mod prompt;

pub use client::{normalize_endpoint, ModelClient, ModelClientError, ModelClientOptions};
pub use prompt::{build_prompt, PromptContext, SYSTEM_PROMPT};

/// Anything that turns a prompt into raw text expected to hold a JSON Patch.
pub trait PatchBackend: Send + Sync {
    fn request_patch(&self, prompt: &str) -> Result<String, ModelClientError>;
}
