//! Application state shared across all handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

use crate::config::Config;
use crate::crud::{CalendarService, CrudService, CustomFieldService, PgUniqueChecker};
use crate::db;
use crate::entity::{Entity, EntityRegistry, load_definitions};
use crate::error::{AppError, AppResult};
use crate::file::{FileService, LocalFileStorage};
use crate::query::ListingService;

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// PostgreSQL connection pool.
    db: PgPool,

    /// Validated entity metadata.
    registry: Arc<EntityRegistry>,

    listing: ListingService,
    crud: CrudService,
    calendar: CalendarService,
    custom_fields: Arc<CustomFieldService>,
    files: Arc<FileService>,
}

impl AppState {
    /// Load entity definitions, connect to the database and run migrations.
    pub async fn new(config: &Config) -> Result<Self> {
        let dir = &config.entities_dir;
        let definitions = load_definitions(dir)
            .with_context(|| format!("failed to load entities from {}", dir.display()))?;
        let registry = EntityRegistry::builder()
            .entities(definitions)
            .build()
            .context("invalid entity metadata")?;

        Self::with_registry(config, registry).await
    }

    /// Connect using a registry built by the caller, for applications that
    /// register search/order overrides or custom rules.
    pub async fn with_registry(config: &Config, registry: EntityRegistry) -> Result<Self> {
        let pool = db::create_pool(config)
            .await
            .context("failed to create database pool")?;
        db::run_migrations(&pool)
            .await
            .context("failed to run migrations")?;
        info!("database connected and migrated");

        Ok(Self::from_parts(pool, registry, config))
    }

    /// Assemble the services around an existing pool.
    pub fn from_parts(pool: PgPool, registry: EntityRegistry, config: &Config) -> Self {
        let registry = Arc::new(registry);
        let storage = Arc::new(LocalFileStorage::new(config.uploads_dir.clone()));
        let files = Arc::new(FileService::new(storage, config.file_encryption_key));
        let custom_fields = Arc::new(CustomFieldService::new(pool.clone()));
        let unique = Arc::new(PgUniqueChecker::new(pool.clone()));

        let listing =
            ListingService::new(pool.clone(), registry.clone(), config.max_items_per_page);
        let crud = CrudService::new(
            pool.clone(),
            registry.clone(),
            files.clone(),
            custom_fields.clone(),
            unique,
        );
        let calendar = CalendarService::new(pool.clone(), registry.clone());

        Self {
            inner: Arc::new(AppStateInner {
                db: pool,
                registry,
                listing,
                crud,
                calendar,
                custom_fields,
                files,
            }),
        }
    }

    /// Get the database pool.
    pub fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.inner.registry
    }

    /// Look up an entity by route name.
    pub fn entity(&self, name: &str) -> AppResult<&Entity> {
        self.inner.registry.get(name).ok_or(AppError::NotFound)
    }

    pub fn listing(&self) -> &ListingService {
        &self.inner.listing
    }

    pub fn crud(&self) -> &CrudService {
        &self.inner.crud
    }

    pub fn calendar(&self) -> &CalendarService {
        &self.inner.calendar
    }

    pub fn custom_fields(&self) -> &CustomFieldService {
        &self.inner.custom_fields
    }

    pub fn files(&self) -> &FileService {
        &self.inner.files
    }

    /// Check if PostgreSQL is healthy.
    pub async fn postgres_healthy(&self) -> bool {
        db::check_health(&self.inner.db).await
    }
}
