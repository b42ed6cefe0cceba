//! resync core - replication pipeline, storage contracts and configuration.

pub mod adapter;
pub mod batch;
pub mod collector;
pub mod config;
pub mod error;
pub mod fields;
pub mod indexes;
pub mod loader;
pub mod metadata;
pub mod models;
pub mod pipeline;
pub mod purge;
pub mod reconcile;
pub mod scheduler;
pub mod sync;

pub use adapter::{DestinationAdapter, PlatformAdapter, Timestamps, UpstreamClient};
pub use batch::{BatchFile, BatchId, BatchKind, BatchStore, DoneMode};
pub use config::{
    default_config_path, default_data_dir, load_sources_config, DbConfig, HttpConfig,
    SourcesConfig,
};
pub use error::AppError;
pub use indexes::{Index, IndexCatalog, Indexes};
pub use metadata::{Metadata, Property};
pub use models::{
    AuthToken, Credentials, DestinationConfig, DestinationOptions, MlsResource, MlsSource,
    Operation, Page, Record,
};
pub use pipeline::{ResourceSnapshot, SourcePipeline};
pub use reconcile::ListingRow;
pub use scheduler::Scheduler;
pub use sync::{ResourceStats, RunStats, RunSummary, SourceRunResult};
