//! regrade-core - Core library for regrade
//!
//! Fetches the regrade request threads of a Gradescope assignment, caches them
//! in SQLite, and infers whether each request was accepted.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod pipeline;
pub mod platform;
pub mod session;
pub mod stats;

pub use cache::RegradeCache;
pub use classifier::{ChainOutcomeClassifier, EntailmentModel};
pub use config::{Metric, RegradeConfig};
pub use error::{CoreError, RunReport};
pub use fetcher::{FetchOptions, RequestFetcher};
pub use pipeline::{ClassifierStatus, Pipeline, PipelineOutput};
pub use session::{Credentials, Session, SessionStore};
