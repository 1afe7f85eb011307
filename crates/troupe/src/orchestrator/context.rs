//! External context resolution seam.
//!
//! Workers ask for ambient context ("project summary", a sibling's recent
//! output, ...) through `multi_session_get_context`. Where that content comes
//! from is not an orchestration concern, so it sits behind a trait. Resolver
//! failures degrade to an error string in the response content; the worker
//! keeps operating with degraded context.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Resolved context content plus optional metadata.
#[derive(Debug, Clone)]
pub struct ResolvedContext {
    pub content: String,
    pub metadata: Option<Value>,
}

/// Resolves a source/query pair into free-text context.
#[async_trait]
pub trait ContextResolver: Send + Sync {
    async fn resolve(
        &self,
        source: &str,
        query: &str,
        sibling_role: Option<&str>,
    ) -> Result<ResolvedContext>;
}

/// Default resolver for deployments with no context provider wired in.
pub struct NullResolver;

#[async_trait]
impl ContextResolver for NullResolver {
    async fn resolve(
        &self,
        source: &str,
        _query: &str,
        _sibling_role: Option<&str>,
    ) -> Result<ResolvedContext> {
        anyhow::bail!("no context resolver configured for source '{}'", source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_resolver_errors() {
        let err = NullResolver
            .resolve("project", "summary", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("project"));
    }
}
