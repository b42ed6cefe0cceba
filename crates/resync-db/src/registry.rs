//! Lookup from destination `type` tags to adapter constructors.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use resync_core::adapter::{DestinationAdapter, PlatformAdapter};
use resync_core::config::DbConfig;
use resync_core::error::AppError;
use resync_core::models::DestinationConfig;

use crate::devnull::DevNullDestination;
use crate::hooks::DestinationHooks;
use crate::memory::MemoryDestination;
use crate::postgres::PostgresDestination;

/// Everything a constructor needs to build one destination.
#[derive(Clone)]
pub struct DestinationContext {
    pub config: DestinationConfig,
    pub platform: Arc<dyn PlatformAdapter>,
    pub db: DbConfig,
}

pub type DestinationFuture = BoxFuture<'static, Result<Arc<dyn DestinationAdapter>, AppError>>;

pub type DestinationConstructor = fn(DestinationContext) -> DestinationFuture;

fn build_postgres(ctx: DestinationContext) -> DestinationFuture {
    async move {
        let pg = PostgresDestination::connect(
            &ctx.config.name,
            &ctx.config.config,
            &ctx.db,
            ctx.platform,
        )
        .await?;
        Ok(Arc::new(pg) as Arc<dyn DestinationAdapter>)
    }
    .boxed()
}

fn build_memory(ctx: DestinationContext) -> DestinationFuture {
    async move {
        let hooks = DestinationHooks::from_options(&ctx.config.config);
        let memory = MemoryDestination::new(ctx.config.name, hooks, ctx.platform);
        Ok(Arc::new(memory) as Arc<dyn DestinationAdapter>)
    }
    .boxed()
}

fn build_devnull(ctx: DestinationContext) -> DestinationFuture {
    async move { Ok(Arc::new(DevNullDestination::new(ctx.config.name)) as Arc<dyn DestinationAdapter>) }
        .boxed()
}

/// Registry of destination kinds.
///
/// # Examples
///
/// ```
/// use resync_db::DestinationRegistry;
///
/// let registry = DestinationRegistry::with_builtins();
/// assert!(registry.contains("postgres"));
/// assert!(!registry.contains("mysql"));
/// ```
pub struct DestinationRegistry {
    constructors: BTreeMap<String, DestinationConstructor>,
}

impl DestinationRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry holding `postgres`, `memory` and `devnull`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("postgres", build_postgres);
        registry.register("memory", build_memory);
        registry.register("devnull", build_devnull);
        registry
    }

    pub fn register(&mut self, tag: impl Into<String>, constructor: DestinationConstructor) {
        self.constructors.insert(tag.into(), constructor);
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }

    pub fn tags(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Fails on the first unknown tag, before anything connects.
    pub fn validate(&self, configs: &[DestinationConfig]) -> Result<(), AppError> {
        for config in configs {
            if !self.contains(&config.kind) {
                return Err(AppError::Config(format!(
                    "destination {}: unknown type '{}' (known: {})",
                    config.name,
                    config.kind,
                    self.tags().join(", ")
                )));
            }
        }
        Ok(())
    }

    pub async fn build(
        &self,
        config: &DestinationConfig,
        platform: Arc<dyn PlatformAdapter>,
        db: &DbConfig,
    ) -> Result<Arc<dyn DestinationAdapter>, AppError> {
        let constructor = self.constructors.get(&config.kind).ok_or_else(|| {
            AppError::Config(format!(
                "destination {}: unknown type '{}'",
                config.name, config.kind
            ))
        })?;
        constructor(DestinationContext {
            config: config.clone(),
            platform,
            db: db.clone(),
        })
        .await
    }

    /// Validates every tag, then builds the destinations in order.
    pub async fn build_all(
        &self,
        configs: &[DestinationConfig],
        platform: Arc<dyn PlatformAdapter>,
        db: &DbConfig,
    ) -> Result<Vec<Arc<dyn DestinationAdapter>>, AppError> {
        self.validate(configs)?;
        let mut built = Vec::with_capacity(configs.len());
        for config in configs {
            built.push(self.build(config, platform.clone(), db).await?);
        }
        Ok(built)
    }
}

impl Default for DestinationRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
