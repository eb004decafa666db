//! pgshift: replicate PostgreSQL tables into a Redshift-compatible warehouse.
//!
//! Each cycle dumps the selected source tables as gzip-compressed delimited
//! files into an object store stage, then reloads every destination table from
//! its staged file. A destination table is swapped in atomically, so readers
//! see either the previous contents or the new ones.
//!
//! # Example
//!
//! ```ignore
//! use pgshift::{Config, Overrides, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("pgshift.yaml", Overrides::default())?;
//!     let stats = run_pipeline(config).await?;
//!     println!("Replicated {} tables", stats.tables);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod group;
pub mod metrics;
pub mod pg;
pub mod pipeline;
pub mod refresh;
pub mod schema;
pub mod source;
pub mod storage;
pub mod warehouse;

// Re-export main types
pub use config::{Config, Overrides};
pub use group::{Aggregate, MultiError, TaskGroup};
pub use pipeline::{PipelineStats, run_pipeline};
pub use refresh::Refresher;
pub use storage::StorageProvider;
