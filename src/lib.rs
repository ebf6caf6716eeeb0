//! # Parasol
//!
//! Checkpoint-based protection and restore orchestration for graphs of
//! interdependent cloud resources (instances, attached volumes, networks).
//!
//! ## Overview
//!
//! Parasol walks a tree of resources, delegates per-resource-type backup,
//! delete, and restore logic to pluggable protection handlers, and persists
//! all progress and artifacts in a prefix-addressable key/value store (the
//! "bank"). Restores execute as an ordered task graph that recreates
//! resources, submits a provisioning stack to an external orchestration
//! service, and synchronizes its status until a terminal state.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use parasol::bank::{Bank, MemoryBankDriver};
//! use parasol::checkpoint::Checkpoint;
//! use parasol::resource::{Resource, ResourceTree, ResourceType};
//! use serde_json::json;
//!
//! # async fn example() -> parasol::Result<()> {
//! let bank = Bank::new(Arc::new(MemoryBankDriver::new()));
//! let checkpoint = Checkpoint::new(bank);
//!
//! let mut tree = ResourceTree::new(Resource::new("vm_1", ResourceType::Server, "web"));
//! tree.add_child(tree.root(), Resource::new("vol_1", ResourceType::Volume, "data"))?;
//!
//! // Every resource gets its own isolated bank section for this run.
//! let section = checkpoint.resource_section("vm_1");
//! section.create("status", json!("protecting")).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`bank`]: prefix-addressable key/value storage abstraction
//! - [`resource`]: typed resources and the dependency tree
//! - [`checkpoint`]: identity and namespace of one protection run
//! - [`protection`]: plugin contract, concrete plugins, and the orchestrator
//! - [`restore`]: restore task graph and stack status synchronization
//! - [`services`]: interfaces to external resource/orchestration services
//! - [`identity`]: credential delegation boundary
//! - [`schema`]: structural validation of plugin options

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for parasol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for parasol operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bank storage error.
    #[error("bank error: {0}")]
    Bank(#[from] bank::BankError),

    /// Resource tree construction error.
    #[error("resource error: {0}")]
    Resource(#[from] resource::ResourceError),

    /// Protection plugin or orchestration error.
    #[error("protection error: {0}")]
    Protection(#[from] protection::ProtectionError),

    /// Restore flow construction or execution error.
    #[error("flow error: {0}")]
    Flow(#[from] restore::FlowError),

    /// Credential delegation or endpoint resolution error.
    #[error("auth error: {0}")]
    Auth(#[from] identity::AuthError),

    /// External service call error.
    #[error("service error: {0}")]
    Service(#[from] services::ServiceError),

    /// Schema validation error.
    #[error("schema error: {0}")]
    Schema(#[from] schema::SchemaError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Join error from async tasks.
    #[error("async join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Prefix-addressable key/value storage for protection state and artifacts.
pub mod bank;

/// Checkpoints scoping one protection run.
pub mod checkpoint;

/// Engine configuration.
pub mod config;

/// Credential delegation boundary.
pub mod identity;

/// Protection plugins and the orchestrator driving them.
pub mod protection;

/// Typed resources and the dependency tree of protected resources.
pub mod resource;

/// Restore flow engine: task graph and status synchronization.
pub mod restore;

/// Structural schemas for plugin option validation.
pub mod schema;

/// External service client interfaces.
pub mod services;
