use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use qproxy_common::{ProviderKind, Settings};
use qproxy_core::{AppState, ProviderRouter};
use qproxy_kv::{KvStore as _, RedisStore};
use qproxy_provider::{
    GeminiConfig, GeminiProvider, OpenAiConfig, OpenAiProvider, Provider,
};

#[derive(Debug, Clone, Parser)]
#[command(name = "qproxy", version, about = "Multi-tenant LLM proxy with per-tenant queueing")]
struct CliArgs {
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    #[arg(long, env = "REDIS_HOST", default_value = "127.0.0.1")]
    redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    redis_port: u16,

    #[arg(long, env = "OPENAI_API_KEY")]
    openai_api_key: Option<String>,

    #[arg(long, env = "GEMINI_API_KEY")]
    gemini_api_key: Option<String>,

    /// Service-to-service key; auth is enforced only when set.
    #[arg(long, env = "SERVICE_API_KEY")]
    service_api_key: Option<String>,

    #[arg(long, env = "PRIMARY_LLM_PROVIDER", default_value = "openai")]
    primary_provider: String,

    #[arg(long, env = "EMBEDDING_PROVIDER", default_value = "openai")]
    embedding_provider: String,

    /// The literal string "true" enables per-request provider overrides.
    #[arg(long, env = "ALLOW_PROVIDER_OVERRIDE")]
    allow_provider_override: Option<String>,

    #[arg(long, env = "WEBHOOK_BASE_URL")]
    webhook_base_url: Option<String>,

    #[arg(long, env = "WEBHOOK_SECRET")]
    webhook_secret: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com")]
    openai_base_url: String,

    #[arg(long, env = "OPENAI_CHAT_MODEL", default_value = "gpt-4o-mini")]
    openai_chat_model: String,

    #[arg(long, env = "OPENAI_VISION_MODEL", default_value = "gpt-4o")]
    openai_vision_model: String,

    #[arg(long, env = "OPENAI_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    openai_embedding_model: String,

    #[arg(
        long,
        env = "GEMINI_BASE_URL",
        default_value = "https://generativelanguage.googleapis.com"
    )]
    gemini_base_url: String,

    #[arg(long, env = "GEMINI_MODEL", default_value = "gemini-2.0-flash")]
    gemini_model: String,

    #[arg(long, env = "GEMINI_EMBEDDING_MODEL", default_value = "text-embedding-004")]
    gemini_embedding_model: String,
}

impl CliArgs {
    fn into_settings(self) -> Settings {
        Settings {
            port: self.port,
            redis_host: self.redis_host,
            redis_port: self.redis_port,
            openai_api_key: self.openai_api_key,
            gemini_api_key: self.gemini_api_key,
            service_api_key: self.service_api_key,
            primary_provider: ProviderKind::parse(&self.primary_provider)
                .unwrap_or(ProviderKind::OpenAi),
            embedding_provider: ProviderKind::parse(&self.embedding_provider)
                .unwrap_or(ProviderKind::OpenAi),
            allow_provider_override: self.allow_provider_override.as_deref() == Some("true"),
            webhook_base_url: self.webhook_base_url,
            webhook_secret: self.webhook_secret,
            openai_base_url: self.openai_base_url,
            openai_chat_model: self.openai_chat_model,
            openai_vision_model: self.openai_vision_model,
            openai_embedding_model: self.openai_embedding_model,
            gemini_base_url: self.gemini_base_url,
            gemini_model: self.gemini_model,
            gemini_embedding_model: self.gemini_embedding_model,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = CliArgs::parse().into_settings();

    let kv = Arc::new(
        RedisStore::connect(&settings.redis_url())
            .await
            .context("connect redis")?,
    );

    let openai = Arc::new(
        OpenAiProvider::new(OpenAiConfig {
            api_key: settings.openai_api_key.clone(),
            base_url: settings.openai_base_url.clone(),
            chat_model: settings.openai_chat_model.clone(),
            vision_model: settings.openai_vision_model.clone(),
            embedding_model: settings.openai_embedding_model.clone(),
        })
        .context("build openai provider")?,
    );
    let gemini = Arc::new(
        GeminiProvider::new(GeminiConfig {
            api_key: settings.gemini_api_key.clone(),
            base_url: settings.gemini_base_url.clone(),
            model: settings.gemini_model.clone(),
            embedding_model: settings.gemini_embedding_model.clone(),
        })
        .context("build gemini provider")?,
    );
    let providers: Vec<Arc<dyn Provider>> = vec![openai.clone(), gemini];

    let router = ProviderRouter::new(
        providers,
        settings.primary_provider,
        settings.embedding_provider,
        settings.allow_provider_override,
    );
    let state = Arc::new(AppState::new(settings.clone(), kv, router, openai));

    let app = qproxy_router::api_router(state.clone());
    let bind = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(
        event = "listening",
        bind = %bind,
        primary_provider = settings.primary_provider.as_str(),
        override_enabled = settings.allow_provider_override
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    state.kv.close().await.context("close kv connections")?;
    info!(event = "shutdown_complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(event = "shutdown_signal");
}
