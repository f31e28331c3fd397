use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use qproxy_common::ProviderKind;
use qproxy_protocol::{CanonicalResponse, EmbeddingResponse};
use qproxy_provider::{ChatRequest, Provider};

pub type RouteResult<T> = Result<T, RouteError>;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("all providers failed: {0}")]
    AllProvidersFailed(String),
}

/// Primary-plus-fallback selection over the configured adapters.
pub struct ProviderRouter {
    providers: Vec<Arc<dyn Provider>>,
    by_name: HashMap<String, Arc<dyn Provider>>,
    primary: ProviderKind,
    embedding_primary: ProviderKind,
    allow_override: bool,
}

impl ProviderRouter {
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        primary: ProviderKind,
        embedding_primary: ProviderKind,
        allow_override: bool,
    ) -> Self {
        let by_name = providers
            .iter()
            .map(|provider| (provider.name().to_string(), provider.clone()))
            .collect();
        Self {
            providers,
            by_name,
            primary,
            embedding_primary,
            allow_override,
        }
    }

    /// Admission-time selection. A request-named provider is honored only
    /// when overrides are enabled and the name is configured; unknown names
    /// coerce to the default, never an error.
    pub fn select_provider(&self, requested: Option<&str>) -> String {
        if self.allow_override {
            if let Some(name) = requested {
                let name = name.trim().to_ascii_lowercase();
                if self.by_name.contains_key(&name) {
                    return name;
                }
            }
        }
        self.primary.as_str().to_string()
    }

    pub fn embedding_provider(&self, requested: Option<&str>) -> String {
        if self.allow_override {
            if let Some(name) = requested {
                let name = name.trim().to_ascii_lowercase();
                if self.by_name.contains_key(&name) {
                    return name;
                }
            }
        }
        self.embedding_primary.as_str().to_string()
    }

    fn fallback_for(&self, primary: &str) -> Option<&Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|provider| provider.name() != primary && provider.has_credentials())
    }

    /// Call the primary adapter; on any failure, retry once against the
    /// first alternative that has credentials.
    pub async fn dispatch(
        &self,
        primary: &str,
        request: &ChatRequest,
    ) -> RouteResult<(String, CanonicalResponse)> {
        let primary_err = match self.by_name.get(primary) {
            Some(provider) => match provider.invoke(request).await {
                Ok(response) => return Ok((primary.to_string(), response)),
                Err(err) => err.to_string(),
            },
            None => format!("provider {primary} is not configured"),
        };
        warn!(event = "provider_failed", provider = %primary, error = %primary_err);

        let Some(fallback) = self.fallback_for(primary) else {
            return Err(RouteError::AllProvidersFailed(primary_err));
        };
        match fallback.invoke(request).await {
            Ok(response) => Ok((fallback.name().to_string(), response)),
            Err(err) => {
                warn!(event = "provider_failed", provider = %fallback.name(), error = %err);
                Err(RouteError::AllProvidersFailed(format!(
                    "{primary_err}; fallback {}: {err}",
                    fallback.name()
                )))
            }
        }
    }

    /// Same algorithm over the embedding endpoints; no queueing.
    pub async fn dispatch_embed(
        &self,
        primary: &str,
        inputs: &[String],
    ) -> RouteResult<(String, EmbeddingResponse)> {
        let primary_err = match self.by_name.get(primary) {
            Some(provider) => match provider.embed(inputs).await {
                Ok(response) => return Ok((primary.to_string(), response)),
                Err(err) => err.to_string(),
            },
            None => format!("provider {primary} is not configured"),
        };
        warn!(event = "provider_failed", provider = %primary, error = %primary_err);

        let Some(fallback) = self.fallback_for(primary) else {
            return Err(RouteError::AllProvidersFailed(primary_err));
        };
        match fallback.embed(inputs).await {
            Ok(response) => Ok((fallback.name().to_string(), response)),
            Err(err) => {
                warn!(event = "provider_failed", provider = %fallback.name(), error = %err);
                Err(RouteError::AllProvidersFailed(format!(
                    "{primary_err}; fallback {}: {err}",
                    fallback.name()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use qproxy_protocol::Usage;
    use qproxy_provider::{ProviderError, ProviderResult};

    struct StubProvider {
        name: &'static str,
        credentialed: bool,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn new(name: &'static str, credentialed: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                credentialed,
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn has_credentials(&self) -> bool {
            self.credentialed
        }

        async fn invoke(&self, _request: &ChatRequest) -> ProviderResult<CanonicalResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Upstream {
                    status: 401,
                    body: "bad key".to_string(),
                });
            }
            Ok(CanonicalResponse::from_text(
                format!("from {}", self.name),
                Usage::default(),
            ))
        }

        async fn embed(&self, _inputs: &[String]) -> ProviderResult<EmbeddingResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::MissingCredentials(self.name));
            }
            Ok(EmbeddingResponse {
                object: "list".to_string(),
                data: Vec::new(),
                model: "stub".to_string(),
                usage: Default::default(),
            })
        }
    }

    fn router_with(providers: Vec<Arc<dyn Provider>>, allow_override: bool) -> ProviderRouter {
        ProviderRouter::new(
            providers,
            ProviderKind::OpenAi,
            ProviderKind::OpenAi,
            allow_override,
        )
    }

    fn request() -> ChatRequest {
        ChatRequest::new(vec![qproxy_protocol::ChatMessage::text(
            qproxy_protocol::Role::User,
            "hi",
        )])
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let openai = StubProvider::new("openai", true, false);
        let gemini = StubProvider::new("gemini", true, false);
        let router = router_with(vec![openai.clone(), gemini.clone()], false);

        let (served_by, _) = router.dispatch("openai", &request()).await.unwrap();
        assert_eq!(served_by, "openai");
        assert_eq!(openai.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gemini.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn primary_failure_invokes_credentialed_fallback_exactly_once() {
        let gemini = StubProvider::new("gemini", true, true);
        let openai = StubProvider::new("openai", true, false);
        let router = router_with(vec![gemini.clone(), openai.clone()], false);

        let (served_by, response) = router.dispatch("gemini", &request()).await.unwrap();
        assert_eq!(served_by, "openai");
        assert_eq!(response.first_text(), Some("from openai"));
        assert_eq!(gemini.calls.load(Ordering::SeqCst), 1);
        assert_eq!(openai.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn uncredentialed_fallback_is_never_invoked() {
        let gemini = StubProvider::new("gemini", true, true);
        let openai = StubProvider::new("openai", false, false);
        let router = router_with(vec![gemini.clone(), openai.clone()], false);

        let err = router.dispatch("gemini", &request()).await.unwrap_err();
        assert!(matches!(err, RouteError::AllProvidersFailed(_)));
        assert_eq!(openai.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn both_failing_is_all_providers_failed() {
        let gemini = StubProvider::new("gemini", true, true);
        let openai = StubProvider::new("openai", true, true);
        let router = router_with(vec![gemini, openai], false);

        let err = router.dispatch("gemini", &request()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("all providers failed"));
        assert!(message.contains("fallback openai"));
    }

    #[test]
    fn selection_honors_override_gate_and_coerces_unknown_names() {
        let providers: Vec<Arc<dyn Provider>> = vec![
            StubProvider::new("openai", true, false),
            StubProvider::new("gemini", true, false),
        ];
        let gated = router_with(providers.clone(), false);
        assert_eq!(gated.select_provider(Some("gemini")), "openai");

        let open = router_with(providers, true);
        assert_eq!(open.select_provider(Some("gemini")), "gemini");
        assert_eq!(open.select_provider(Some("Mistral")), "openai");
        assert_eq!(open.select_provider(None), "openai");
    }
}
