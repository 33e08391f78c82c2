//! Node-local agent preparing GPU devices for Kubernetes resource claims.
//!
//! - [`prepare::PrepareService`]: checkpointed prepare/unprepare of claims
//! - [`checkpoint`]: checkpoint persistence and result reconstruction
//! - [`backend`]: MIG and VFIO backends
//! - [`cdi`]: CDI descriptor writer
//! - [`lock`]: node-wide lock

pub mod attributes;
pub mod backend;
pub mod cdi;
pub mod checkpoint;
pub mod config;
pub mod error;
mod fs;
pub mod lock;
pub mod mig;
pub mod mock;
pub mod prepare;

pub use error::AgentError;
pub use error::AgentResult;
pub use prepare::PrepareService;
pub use prepare::ServiceConfig;
