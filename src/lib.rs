pub mod auth;
pub mod config;
pub mod error;
pub mod indexer;
pub mod orchestrator;
pub mod provider;
pub mod publisher;
pub mod reasoner;
pub mod review;
pub mod storage;
pub mod webhook;
pub mod worker;

use std::sync::Arc;

use auth::TokenManager;
use config::ReviewdConfig;
use orchestrator::Orchestrator;
use provider::ProviderClient;
use reasoner::ReasonerClient;
use storage::Storage;

/// Shared application state passed to the webhook handlers and background
/// tasks.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ReviewdConfig>,
    pub storage: Arc<Storage>,
    pub orchestrator: Arc<Orchestrator>,
    pub auth: Arc<TokenManager>,
    pub provider: Arc<dyn ProviderClient>,
    pub reasoner: Arc<dyn ReasonerClient>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wire the full pipeline from configuration plus already-opened storage.
    /// Provider and reasoner clients are injected so tests can substitute
    /// in-memory fakes.
    pub fn new(
        config: Arc<ReviewdConfig>,
        storage: Arc<Storage>,
        provider: Arc<dyn ProviderClient>,
        reasoner: Arc<dyn ReasonerClient>,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(&storage, config.jobs.clone()));
        let auth = Arc::new(TokenManager::new(
            Arc::clone(&provider),
            config.provider.token_refresh_margin_mins,
        ));
        Self {
            config,
            storage,
            orchestrator,
            auth,
            provider,
            reasoner,
            started_at: std::time::Instant::now(),
        }
    }

    /// Build one worker over this context's components.
    pub fn worker(&self) -> worker::Worker {
        let indexer = indexer::Indexer::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.provider),
            Arc::clone(&self.reasoner),
            Arc::clone(&self.auth),
        );
        let engine = review::ReviewEngine::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.provider),
            Arc::clone(&self.reasoner),
            Arc::clone(&self.auth),
            self.config.model.max_context_bytes,
        );
        let publisher = publisher::Publisher::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.provider),
            Arc::clone(&self.auth),
        );
        worker::Worker::new(
            Arc::clone(&self.config),
            Arc::clone(&self.storage),
            Arc::clone(&self.orchestrator),
            indexer,
            engine,
            publisher,
        )
    }
}
