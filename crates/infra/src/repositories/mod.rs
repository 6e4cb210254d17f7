mod memory;
mod surreal;

pub use memory::{
    InMemoryIdentityProvider, InMemoryMailOutbox, InMemoryMemberRepository,
    InMemoryNotificationRepository,
};
pub use surreal::{
    SurrealIdentityProvider, SurrealMailOutboxRepository, SurrealMemberRepository,
    SurrealNotificationRepository, ensure_schema,
};
