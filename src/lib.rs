//! Knowledge & coordination core for a local-first engineering workbench.
//!
//! The crate owns persistence, search, invariants, and cross-process
//! coordination for tasks, docs, and learnings: a migrated SQLite store, a
//! JSONL operation log with last-writer-wins merge, hybrid BM25 + vector
//! retrieval, content-addressed source anchors with a bounded-concurrency
//! batch verifier, lease-based task claims, and a versioned doc graph with
//! machine-checkable invariants. CLI, HTTP, and agent-tool surfaces sit on
//! top as external collaborators; `api` carries the payload and error types
//! they share.

use std::path::Path;
use std::sync::Arc;

pub mod api;
pub mod config;
pub mod coord;
pub mod docs;
pub mod error;
pub mod ids;
pub mod model;
pub mod obs;
pub mod pathsafe;
pub mod search;
pub mod store;
pub mod sync;
pub mod verify;

pub use error::{Result, TxError};
pub use store::Store;

use config::EnvConfig;
use docs::DocService;
use search::{EmbeddingProvider, NoopEmbedding, SearchService};
use search::embedding::EmbeddingService;
use sync::JsonlSync;
use sync::autosync::AutoSync;
use verify::AnchorVerifier;

/// Process-wide wiring: the store, the sync log, and the services built on
/// them. One explicit initializer (`open`) and tear-down (`shutdown`) pair;
/// everything else hangs off this.
pub struct Core {
    pub store: Arc<Store>,
    pub sync: Arc<JsonlSync>,
    pub search: SearchService,
    pub embeddings: EmbeddingService,
    pub verifier: AnchorVerifier,
    pub docs: DocService,
    pub telemetry: obs::Telemetry,
    autosync: Option<Arc<AutoSync>>,
}

impl Core {
    /// Open the workbench rooted at a project directory using the `TX_*`
    /// environment plus `.tx/config.toml` for paths.
    pub fn open(project_root: &Path, env: &EnvConfig) -> Result<Self> {
        Self::open_with_provider(project_root, env, Arc::new(NoopEmbedding))
    }

    pub fn open_with_provider(
        project_root: &Path,
        env: &EnvConfig,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let db_path = if env.db_path.is_absolute() {
            env.db_path.clone()
        } else {
            project_root.join(&env.db_path)
        };
        let store = Arc::new(Store::open(&db_path)?);

        let file_config = config::TxConfig::load(&project_root.join(config::DEFAULT_CONFIG_PATH))?;
        let docs_dir = file_config
            .docs_path()
            .map(|p| project_root.join(p))
            .unwrap_or_else(|| project_root.join(config::DEFAULT_DOCS_DIR));

        let sync = Arc::new(
            JsonlSync::new(
                Arc::clone(&store),
                project_root.join(config::DEFAULT_JSONL_PATH),
            )
            .with_auto_sync(true),
        );
        let autosync = Arc::new(AutoSync::start(Arc::clone(&sync))?);
        store.set_after_mutation(Some(autosync.hook()));

        let search = SearchService::new(Arc::clone(&store), Arc::clone(&provider));
        let embeddings = EmbeddingService::new(Arc::clone(&store), provider);
        let verifier = AnchorVerifier::new(
            Arc::clone(&store),
            project_root.to_path_buf(),
            env.anchor_cache_ttl_secs,
        );
        let docs = DocService::new(Arc::clone(&store), docs_dir, project_root.to_path_buf());
        let telemetry = obs::Telemetry::store_backed(Arc::clone(&store));

        Ok(Self {
            store,
            sync,
            search,
            embeddings,
            verifier,
            docs,
            telemetry,
            autosync: Some(autosync),
        })
    }

    /// Stop background work: unhook mutations and flush the auto-sync
    /// thread. The store itself closes on drop.
    pub fn shutdown(mut self) {
        self.store.set_after_mutation(None);
        self.autosync.take();
    }
}
