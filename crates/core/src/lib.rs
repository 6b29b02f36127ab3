//! # Foundry Core
//!
//! Turns a free-form request into a deployed domain-expert resource by
//! driving it through six gated phases. Research and build work is
//! delegated to opaque workers; this crate owns routing, gating, merging,
//! deployment and the audit trail.
//!
//! ## Architecture
//!
//! - `tools/` - Classifier, registry gate, router, acquirer, merge, format validator
//! - `workers/` - Worker interface, artifact schemas, work-orders, build delegation
//! - `pipeline/` - Phase gate, delegation engine, deploy, report, coordinator
//! - `state/` - SQLite registry, interactions, run archive, runtime files
//!
//! ## Usage
//!
//! ```rust,ignore
//! use foundry_core::config::PipelineConfig;
//! use foundry_core::pipeline::Coordinator;
//!
//! let config = PipelineConfig::load(&PipelineConfig::default_path()).await?;
//! let mut coordinator = Coordinator::new(config, registry, worker)?;
//! let report = coordinator.run("create agent for kubernetes-security").await;
//! println!("{}", report.to_markdown());
//! ```

pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod state;
pub mod tools;
pub mod workers;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use error::{FailureKind, PipelineError, PipelineResult};
pub use pipeline::{CompletionReport, Coordinator};
