//! The one concrete [`RagProvider`] the crate ships: a canned-snippet
//! source, so the orchestrator is exercisable and testable without wiring
//! up a real vector or graph store (those are external collaborators per
//! the library's scope).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;

use crate::error::ClaudetteError;
use crate::model::{RagContextResult, RagResult, StrategySource};

use super::{elapsed_ms, ProviderStatus, RagProvider, RagQuery};

pub struct StaticRagProvider {
    name: String,
    results: Vec<RagResult>,
    strategy_source: StrategySource,
    healthy: AtomicBool,
}

impl StaticRagProvider {
    pub fn new(name: impl Into<String>, results: Vec<RagResult>, strategy_source: StrategySource) -> Self {
        Self { name: name.into(), results, strategy_source, healthy: AtomicBool::new(true) }
    }

    /// Convenience constructor for a provider that always reports unhealthy
    /// — used to exercise the fallback chain's skip-on-unhealthy path.
    pub fn unhealthy(name: impl Into<String>) -> Self {
        Self { name: name.into(), results: Vec::new(), strategy_source: StrategySource::Vector, healthy: AtomicBool::new(false) }
    }
}

#[async_trait]
impl RagProvider for StaticRagProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, request: &RagQuery) -> Result<RagContextResult, ClaudetteError> {
        let started = Instant::now();
        let threshold = request.threshold.unwrap_or(0.0);
        let mut results: Vec<RagResult> = self.results.iter().filter(|r| r.score >= threshold).cloned().collect();
        if let Some(max) = request.max_results {
            results.truncate(max);
        }
        Ok(RagContextResult {
            total_results: results.len(),
            results,
            processing_ms: elapsed_ms(started),
            strategy_source: self.strategy_source,
        })
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn connect(&self) -> Result<(), ClaudetteError> {
        self.healthy.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClaudetteError> {
        self.healthy.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn status(&self) -> ProviderStatus {
        if self.healthy.load(Ordering::Relaxed) {
            ProviderStatus::Connected
        } else {
            ProviderStatus::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snippet(content: &str, score: f32) -> RagResult {
        RagResult { content: content.into(), score, source: "static".into(), metadata: Default::default() }
    }

    #[tokio::test]
    async fn query_filters_by_threshold() {
        let provider = StaticRagProvider::new("docs", vec![snippet("low", 0.1), snippet("high", 0.9)], StrategySource::Vector);
        let result = provider
            .query(&RagQuery { query: "q".into(), max_results: None, threshold: Some(0.5), context: None, metadata: Default::default() })
            .await
            .unwrap();
        assert_eq!(result.total_results, 1);
        assert_eq!(result.results[0].content, "high");
    }

    #[tokio::test]
    async fn connect_and_disconnect_toggle_health() {
        let provider = StaticRagProvider::unhealthy("docs");
        assert!(!provider.health_check().await);
        provider.connect().await.unwrap();
        assert!(provider.health_check().await);
        provider.disconnect().await.unwrap();
        assert!(!provider.health_check().await);
    }
}
