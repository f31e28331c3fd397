use std::sync::Arc;

use qproxy_common::Settings;
use qproxy_kv::KvStore;
use qproxy_provider::OpenAiProvider;

use crate::router::ProviderRouter;
use crate::worker::WorkerRegistry;

/// Shared application state handed to workers and HTTP handlers.
pub struct AppState {
    pub settings: Settings,
    pub kv: Arc<dyn KvStore>,
    pub router: ProviderRouter,
    pub workers: WorkerRegistry,
    /// Concrete OpenAI adapter for the audio/OCR endpoints, which are
    /// OpenAI-specific and bypass the chat router.
    pub openai: Arc<OpenAiProvider>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        kv: Arc<dyn KvStore>,
        router: ProviderRouter,
        openai: Arc<OpenAiProvider>,
    ) -> Self {
        Self {
            settings,
            kv,
            router,
            workers: WorkerRegistry::new(),
            openai,
        }
    }
}
