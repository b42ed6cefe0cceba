//! resync db - destination adapters
//!
//! This crate provides:
//!
//! - [`postgres`] - PostgreSQL tables kept in step with upstream metadata
//! - [`memory`] - an in-process store for dry runs and tests
//! - [`devnull`] - a sink that discards everything
//! - [`registry`] - construction of destinations from their `type` tag
//!
//! Naming hooks and type mapping live in [`hooks`] and [`types`].

pub mod devnull;
pub mod hooks;
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod types;

pub use devnull::DevNullDestination;
pub use hooks::DestinationHooks;
pub use memory::MemoryDestination;
pub use postgres::PostgresDestination;
pub use registry::{DestinationContext, DestinationRegistry};
pub use types::{column_type, ColumnType, PlatformDataAdapter};
