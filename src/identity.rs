//! Credential delegation boundary.
//!
//! The engine never issues tokens or trusts itself. It relies on a
//! [`TrustBroker`] collaborator to delegate the caller's credentials to the
//! service identity for long-running operations and to resolve service
//! endpoints. Implementations wrap whatever identity service the deployment
//! uses; tests plug in fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from credential delegation or endpoint resolution.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The identity service rejected or failed the request.
    #[error("authorization failure: {0}")]
    AuthorizationFailure(String),
}

/// The authenticated caller on whose behalf the engine acts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// Id of the calling user.
    pub user_id: String,
    /// Project the operation is scoped to.
    pub project_id: String,
    /// The caller's auth token.
    pub auth_token: String,
    /// Roles to delegate when creating a trust.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl RequestContext {
    /// Build a caller context.
    pub fn new(
        user_id: impl Into<String>,
        project_id: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
            auth_token: auth_token.into(),
            roles: Vec::new(),
        }
    }

    /// Attach delegated roles.
    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }
}

/// Handle to a delegated credential issued by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustId(pub String);

impl fmt::Display for TrustId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity-service collaborator for trusts and endpoint lookup.
#[async_trait]
pub trait TrustBroker: Send + Sync {
    /// Delegate `ctx`'s credentials to the service identity, returning a
    /// long-lived trust the engine can act under.
    async fn create_trust(&self, ctx: &RequestContext) -> Result<TrustId, AuthError>;

    /// Revoke a previously created trust.
    async fn delete_trust(&self, trust_id: &TrustId) -> Result<(), AuthError>;

    /// Resolve the endpoint of a named service for a region and interface.
    async fn get_endpoint(
        &self,
        service_name: &str,
        service_type: &str,
        region_id: &str,
        interface: &str,
    ) -> Result<String, AuthError>;
}
