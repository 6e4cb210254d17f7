pub mod credentials;
pub mod delivery;
pub mod diagnostics;
pub mod error;
pub mod identity;
pub mod mail;
pub mod members;
pub mod notifications;
pub mod outbox;
pub mod ports;
pub mod roles;
pub mod sweep;
pub mod templates;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
