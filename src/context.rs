//! Shared handles for one running knowledge base.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::answer::Composer;
use crate::config::Config;
use crate::connector_fs::Scanner;
use crate::embedding::{create_embedder, Embedder};
use crate::extract::ExtractorRegistry;
use crate::generation::{create_generator, Generator};
use crate::index::VectorIndex;
use crate::queue::JobQueue;

/// Everything the watcher, workers, composer and server share. Cheap to
/// clone.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub index: VectorIndex,
    pub queue: JobQueue,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub extractors: Arc<ExtractorRegistry>,
    pub scanner: Arc<Scanner>,
}

impl AppContext {
    /// Connect to the database, make sure the schema exists and build the
    /// configured providers.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = crate::db::connect(config).await?;
        crate::migrate::apply_schema(&pool).await?;
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        Self::from_parts(config, pool, embedder, generator)
    }

    /// Assemble a context around an existing pool and providers.
    pub fn from_parts(
        config: &Config,
        pool: SqlitePool,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        Ok(Self {
            config: Arc::new(config.clone()),
            index: VectorIndex::new(pool.clone()),
            queue: JobQueue::new(pool.clone(), &config.queue),
            pool,
            embedder,
            generator,
            extractors: Arc::new(ExtractorRegistry::from_config(&config.parser)),
            scanner: Arc::new(Scanner::from_config(config)?),
        })
    }

    pub fn composer(&self) -> Composer {
        Composer::new(
            self.index.clone(),
            self.embedder.clone(),
            self.generator.clone(),
            self.config.retrieval.clone(),
        )
    }
}
