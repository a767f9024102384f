//! Application state: the grading service, the admin harness and the
//! catalog they share, wired from runtime configuration.

use anyhow::{Context, Result};
use assessor_common::config::{Config, SandboxMode};
use assessor_engine::catalog::{Catalog, CatalogDocument};
use assessor_engine::clock::{Clock, SystemClock};
use assessor_engine::dispatcher::Dispatcher;
use assessor_engine::harness::AdminHarness;
use assessor_engine::languages::LanguageRegistry;
use assessor_engine::sandbox::{CodeSandbox, DockerSandbox, UnavailableSandbox};
use assessor_engine::session::SessionManager;
use assessor_engine::store::{MemoryStore, ProgressStore, RedisStore};
use assessor_engine::tracker::GradingService;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub grading: GradingService,
    pub harness: AdminHarness,
}

pub struct Parts {
    pub catalog: Arc<Catalog>,
    pub store: Arc<dyn ProgressStore>,
    pub sandbox: Arc<dyn CodeSandbox>,
    pub languages: Arc<LanguageRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn from_parts(parts: Parts, config: &Config) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher::new(parts.sandbox, config.dispatch));
        let sessions = SessionManager::new(parts.store.clone(), parts.clock.clone(), config.session);
        let grading = GradingService::new(
            parts.catalog.clone(),
            parts.store,
            sessions,
            dispatcher.clone(),
            parts.languages.clone(),
            parts.clock,
        );
        let harness = AdminHarness::new(parts.catalog.clone(), dispatcher, parts.languages);
        Arc::new(Self {
            catalog: parts.catalog,
            grading,
            harness,
        })
    }

    pub async fn build(config: &Config) -> Result<Arc<Self>> {
        let languages = Arc::new(
            LanguageRegistry::load_or_builtin(&config.languages_config)
                .context("failed to load language registry")?,
        );

        let store: Arc<dyn ProgressStore> = match &config.redis_url {
            Some(url) => Arc::new(
                RedisStore::connect(url)
                    .await
                    .context("failed to connect to Redis")?,
            ),
            None => {
                warn!("REDIS_URL not set; candidate state is kept in memory and lost on restart");
                Arc::new(MemoryStore::new())
            }
        };

        let sandbox: Arc<dyn CodeSandbox> = match config.sandbox {
            SandboxMode::Docker => match DockerSandbox::connect(languages.clone()).await {
                Ok(docker) => Arc::new(docker),
                Err(e) => {
                    warn!(error = %e, "Docker unavailable; code execution will fail until it is reachable");
                    Arc::new(UnavailableSandbox::new(e.to_string()))
                }
            },
            SandboxMode::Disabled => Arc::new(UnavailableSandbox::new("sandbox disabled by configuration")),
        };

        let catalog = match &config.catalog_path {
            Some(path) => Arc::new(load_catalog(path)?),
            None => {
                warn!("CATALOG_PATH not set; starting with an empty catalog");
                Arc::new(Catalog::default())
            }
        };

        info!(
            store = store.name(),
            sandbox = sandbox.name(),
            languages = ?languages.list_languages(),
            "grading services ready"
        );

        Ok(Self::from_parts(
            Parts {
                catalog,
                store,
                sandbox,
                languages,
                clock: Arc::new(SystemClock),
            },
            config,
        ))
    }
}

fn load_catalog(path: &Path) -> Result<Catalog> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog {}", path.display()))?;
    let document: CatalogDocument = serde_json::from_str(&raw)
        .with_context(|| format!("catalog {} is not valid JSON", path.display()))?;
    Catalog::from_document(document).with_context(|| format!("catalog {} is invalid", path.display()))
}
