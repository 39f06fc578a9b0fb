//! Claudette: adaptive middleware between an application and several LLM
//! backends (OpenAI, Anthropic, Qwen-compatible, and local Ollama).
//!
//! The library surface is [`lifecycle::Runtime`]: `initialize` once, then
//! call `optimize`/`status`/`config`/`validate_config`/`metrics`/`cleanup`.
//! Everything else — the router, breaker, pool, cache, RAG orchestrator,
//! health monitor, and traffic log — is an implementation detail reached
//! through the runtime.

pub mod api;
pub mod backends;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod health;
pub mod http_error;
pub mod lifecycle;
pub mod model;
pub mod observability;
pub mod pool;
pub mod rag;
pub mod router;
pub mod traffic;

pub use config::Config;
pub use error::{ClaudetteError, ErrorKind};
pub use lifecycle::Runtime;
pub use model::{FileRef, Request, RequestOptions, Response};
