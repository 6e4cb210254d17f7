use super::BoxFuture;
use crate::DomainResult;

/// Reachability probe for the backing document store, used by operator
/// tooling before it starts mutating anything.
pub trait StoreProbe: Send + Sync {
    fn backend(&self) -> &'static str;
    fn health_check(&self) -> BoxFuture<'_, DomainResult<()>>;
}
