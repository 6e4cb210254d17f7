use thiserror::Error;

use crate::ports::BoxFuture;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("email already in use")]
    EmailAlreadyInUse,
    #[error("invalid email")]
    InvalidEmail,
    #[error("credential rejected as weak")]
    WeakCredential,
    #[error("identity not found")]
    NotFound,
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// External account system. Identity ids double as member ids.
pub trait IdentityProvider: Send + Sync {
    fn create_identity(
        &self,
        email: &str,
        credential: &str,
    ) -> BoxFuture<'_, Result<String, IdentityError>>;

    fn update_credential(
        &self,
        identity_id: &str,
        credential: &str,
    ) -> BoxFuture<'_, Result<(), IdentityError>>;

    fn delete_identity(&self, identity_id: &str) -> BoxFuture<'_, Result<(), IdentityError>>;

    /// Ends any session the provider opened as a side effect of
    /// `create_identity`.
    fn sign_out(&self, identity_id: &str) -> BoxFuture<'_, Result<(), IdentityError>>;
}
