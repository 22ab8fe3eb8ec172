//! Injected I/O ports.
//!
//! The core is an orchestration runtime, not an adapter library: concrete
//! LLM, HTTP, filesystem, and code-execution backends are provided by the
//! embedder. Handlers suspend only on these ports.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::person::Message;
use crate::types::{MessageId, PersonId, Result};

/// Provider-agnostic LLM persona configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct LlmConfig {
    pub service: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Tools a person job may expose to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ToolSelection {
    None,
    Image,
    Websearch,
}

/// One completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub person: PersonId,
    pub config: LlmConfig,
    /// Memory view presented to the model, oldest first.
    pub messages: Vec<Message>,
    /// The task prompt appended after the memory view.
    pub prompt: String,
    /// Structured output schema, if the node requests one.
    pub structured_schema: Option<Value>,
    pub tools: Vec<ToolSelection>,
    /// Overrides the persona temperature when set.
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub structured: Option<Value>,
    pub usage: TokenUsage,
}

/// One memory-selection call made by the dual-persona selector.
///
/// `person` is the transient selector facet (`{person_id}.__selector`); the
/// observable contract is the returned id list and the 0.1 temperature. The
/// prompt phrasing belongs to the adapter.
#[derive(Debug, Clone)]
pub struct MemorySelectionRequest {
    pub person: PersonId,
    pub config: LlmConfig,
    pub candidates: Vec<Message>,
    pub task_preview: String,
    pub criterion: String,
    pub at_most: Option<usize>,
    pub temperature: f32,
}

/// LLM completion port.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Return the ids of candidate messages relevant to the criterion.
    /// Unknown ids in the response are dropped by the caller.
    async fn select_memories(&self, request: MemorySelectionRequest) -> Result<Vec<MessageId>>;
}

/// File storage port.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Bytes>;
    async fn write(&self, path: &str, payload: Bytes) -> Result<()>;
    async fn append(&self, path: &str, payload: Bytes) -> Result<()>;
    async fn delete(&self, path: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// HTTP client port.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Languages an embedded executor may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CodeLanguage {
    Python,
    Typescript,
    Bash,
    Shell,
}

/// Embedded code execution port. The embedder owns the interpreters; the
/// core passes inputs as a JSON map and receives a raw result that it wraps
/// without rewriting.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn run(&self, language: CodeLanguage, code: &str, inputs: Value) -> Result<Value>;
}

/// Bundle of the injected ports handed to every execution.
#[derive(Clone)]
pub struct Ports {
    pub llm: Arc<dyn LLMClient>,
    pub files: Arc<dyn FileStore>,
    pub http: Arc<dyn HttpClient>,
    pub code: Arc<dyn CodeExecutor>,
}

impl fmt::Debug for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ports").finish_non_exhaustive()
    }
}
