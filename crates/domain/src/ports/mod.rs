use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod identity;
pub mod members;
pub mod notifications;
pub mod outbox;
pub mod relay;
pub mod store;
