//! RAG orchestrator: provider registry, ordered fallback chain, and prompt
//! enrichment.
//!
//! `enhance` walks the configured chain the same way the router walks its
//! backend fallback order — skip-on-unhealthy, first-success-wins, graceful
//! degrade on exhaustion.

pub mod providers;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::{ClaudetteError, ErrorKind};
use crate::model::{ContextStrategy, RagContextResult, RagStatus, Request};

pub use providers::StaticRagProvider;

/// Query sent to a [`RagProvider`]. Mirrors the `{query, maxResults?,
/// threshold?, context?, metadata?}` shape every provider accepts.
#[derive(Debug, Clone)]
pub struct RagQuery {
    pub query: String,
    pub max_results: Option<usize>,
    pub threshold: Option<f32>,
    pub context: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl RagQuery {
    pub fn from_request(request: &Request) -> Self {
        Self {
            query: request.options.rag_query.clone().unwrap_or_else(|| request.prompt.clone()),
            max_results: None,
            threshold: None,
            context: None,
            metadata: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Connected,
    Disconnected,
    Degraded,
}

/// One retrieval backend. External collaborators (vector stores, graph
/// databases, hybrid search) implement this; the crate ships only
/// [`StaticRagProvider`] so the orchestrator is testable standalone.
#[async_trait]
pub trait RagProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn query(&self, request: &RagQuery) -> Result<RagContextResult, ClaudetteError>;
    async fn health_check(&self) -> bool;
    async fn connect(&self) -> Result<(), ClaudetteError>;
    async fn disconnect(&self) -> Result<(), ClaudetteError>;
    fn status(&self) -> ProviderStatus;
}

/// Providers keyed by the unique name they're registered under in
/// `[rag.providers.<name>]`.
#[derive(Default, Clone)]
pub struct RagRegistry {
    providers: std::collections::HashMap<String, Arc<dyn RagProvider>>,
}

impl RagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn RagProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RagProvider>> {
        self.providers.get(name).cloned()
    }
}

/// Outcome of [`enhance`]: the (possibly rewritten) prompt plus metadata the
/// caller attaches to the final response.
#[derive(Debug)]
pub struct RagEnhancement {
    pub prompt: String,
    pub status: RagStatus,
    pub sources: Vec<String>,
    /// Whether the result came from anything other than the first provider
    /// in the walked chain — feeds `rag_fallbacks_total`.
    pub fallback_used: bool,
}

/// Walk `fallback_chain` in order, skipping unhealthy providers, returning
/// on the first success (including a zero-result success). `request.prompt`
/// passes through unchanged when RAG is not requested, when the chain is
/// empty, or — unless `rag_strict` is set — when every provider fails.
pub async fn enhance(request: &Request, registry: &RagRegistry, fallback_chain: &[String]) -> Result<RagEnhancement, ClaudetteError> {
    if !request.options.use_rag {
        return Ok(RagEnhancement { prompt: request.prompt.clone(), status: RagStatus::NotRequested, sources: Vec::new(), fallback_used: false });
    }

    let chain: Vec<&String> = match &request.options.rag_provider {
        Some(pinned) => vec![pinned],
        None => fallback_chain.iter().collect(),
    };

    let query = RagQuery::from_request(request);
    for (index, name) in chain.into_iter().enumerate() {
        let Some(provider) = registry.get(name) else { continue };
        if !provider.health_check().await {
            continue;
        }
        match provider.query(&query).await {
            Ok(result) => {
                let prompt = apply_context_strategy(&request.prompt, &result, request.options.context_strategy);
                let sources = result.results.iter().map(|r| r.source.clone()).collect();
                return Ok(RagEnhancement { prompt, status: RagStatus::Ok, sources, fallback_used: index > 0 });
            }
            Err(_) => continue,
        }
    }

    if request.options.rag_strict {
        return Err(ClaudetteError::new(ErrorKind::RagUnavailable, "no RAG provider in the fallback chain returned context"));
    }
    Ok(RagEnhancement { prompt: request.prompt.clone(), status: RagStatus::Error, sources: Vec::new(), fallback_used: false })
}

fn apply_context_strategy(prompt: &str, result: &RagContextResult, strategy: ContextStrategy) -> String {
    if result.results.is_empty() {
        return prompt.to_string();
    }
    let numbered = result
        .results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {} [source: {}]", i + 1, r.content, r.source))
        .collect::<Vec<_>>()
        .join("\n");

    match strategy {
        ContextStrategy::Prepend => format!("Context:\n{numbered}\n\n{prompt}"),
        ContextStrategy::Append => format!("{prompt}\n\nContext:\n{numbered}"),
        ContextStrategy::Inject => {
            if prompt.contains("{context}") {
                prompt.replacen("{context}", &numbered, 1)
            } else {
                format!("Context:\n{numbered}\n\n{prompt}")
            }
        }
    }
}

/// Wall-clock helper for providers timing their own `processing_ms`.
pub fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RequestOptions, StrategySource};

    fn request_with_rag(strict: bool) -> Request {
        Request::new("Answer: {context}").with_options(RequestOptions { use_rag: true, rag_strict: strict, ..Default::default() })
    }

    #[tokio::test]
    async fn rag_disabled_passes_prompt_through_unchanged() {
        let registry = RagRegistry::new();
        let request = Request::new("hello");
        let enhancement = enhance(&request, &registry, &[]).await.unwrap();
        assert_eq!(enhancement.prompt, "hello");
        assert_eq!(enhancement.status, crate::model::RagStatus::NotRequested);
    }

    #[tokio::test]
    async fn empty_chain_degrades_to_unchanged_prompt_with_ok_status_absent() {
        let registry = RagRegistry::new();
        let request = request_with_rag(false);
        let enhancement = enhance(&request, &registry, &[]).await.unwrap();
        assert_eq!(enhancement.status, crate::model::RagStatus::Error);
        assert_eq!(enhancement.prompt, "Answer: {context}");
    }

    #[tokio::test]
    async fn strict_mode_surfaces_rag_unavailable_on_exhaustion() {
        let registry = RagRegistry::new();
        let request = request_with_rag(true);
        let err = enhance(&request, &registry, &["missing".to_string()]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RagUnavailable);
    }

    #[tokio::test]
    async fn inject_strategy_replaces_context_token() {
        let mut registry = RagRegistry::new();
        registry.register(Arc::new(StaticRagProvider::new(
            "docs",
            vec![crate::model::RagResult { content: "the answer is 4".into(), score: 1.0, source: "docs".into(), metadata: Default::default() }],
            StrategySource::Vector,
        )));
        let request = request_with_rag(false);
        let enhancement = enhance(&request, &registry, &["docs".to_string()]).await.unwrap();
        assert!(enhancement.prompt.contains("the answer is 4"));
        assert!(!enhancement.prompt.contains("{context}"));
    }

    #[tokio::test]
    async fn unhealthy_provider_is_skipped_in_favor_of_next() {
        let mut registry = RagRegistry::new();
        registry.register(Arc::new(StaticRagProvider::unhealthy("down")));
        registry.register(Arc::new(StaticRagProvider::new(
            "backup",
            vec![crate::model::RagResult { content: "fallback context".into(), score: 0.5, source: "backup".into(), metadata: Default::default() }],
            StrategySource::Hybrid,
        )));
        let request = Request::new("q").with_options(RequestOptions { use_rag: true, ..Default::default() });
        let enhancement = enhance(&request, &registry, &["down".to_string(), "backup".to_string()]).await.unwrap();
        assert!(enhancement.prompt.contains("fallback context"));
    }
}
