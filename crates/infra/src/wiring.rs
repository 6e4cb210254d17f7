use std::sync::Arc;

use crm_domain::ports::identity::IdentityProvider;
use crm_domain::ports::members::MemberRepository;
use crm_domain::ports::notifications::NotificationRepository;
use crm_domain::ports::outbox::{MailOutboxRepository, OutboxChangeFeed};
use crm_domain::ports::store::StoreProbe;

use crate::config::AppConfig;
use crate::db::{self, DbConfig, MemoryProbe, SurrealProbe};
use crate::repositories::{
    InMemoryIdentityProvider, InMemoryMailOutbox, InMemoryMemberRepository,
    InMemoryNotificationRepository, SurrealIdentityProvider, SurrealMailOutboxRepository,
    SurrealMemberRepository, SurrealNotificationRepository, ensure_schema,
};

/// Every storage port the worker and the tooling need, backed by one store.
#[derive(Clone)]
pub struct Backends {
    pub members: Arc<dyn MemberRepository>,
    pub identity: Arc<dyn IdentityProvider>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub outbox: Arc<dyn MailOutboxRepository>,
    pub legacy_outbox: Arc<dyn MailOutboxRepository>,
    pub changes: Arc<dyn OutboxChangeFeed>,
    pub probe: Arc<dyn StoreProbe>,
}

impl Backends {
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        if config.uses_surreal() {
            Self::surreal(config).await
        } else {
            tracing::warn!("data backend is in-memory; state is lost on exit");
            Ok(Self::memory(config))
        }
    }

    pub fn memory(config: &AppConfig) -> Self {
        let outbox = Arc::new(InMemoryMailOutbox::new(config.outbox_collection.clone()));
        Self {
            members: Arc::new(InMemoryMemberRepository::new()),
            identity: Arc::new(InMemoryIdentityProvider::new()),
            notifications: Arc::new(InMemoryNotificationRepository::new()),
            legacy_outbox: Arc::new(InMemoryMailOutbox::new(
                config.legacy_outbox_collection.clone(),
            )),
            changes: outbox.clone(),
            outbox,
            probe: Arc::new(MemoryProbe),
        }
    }

    async fn surreal(config: &AppConfig) -> anyhow::Result<Self> {
        let db_config = DbConfig::from_app_config(config);
        let client = db::connect(&db_config).await?;
        ensure_schema(
            &client,
            &[
                config.outbox_collection.as_str(),
                config.legacy_outbox_collection.as_str(),
            ],
        )
        .await?;
        let outbox = Arc::new(SurrealMailOutboxRepository::with_client(
            client.clone(),
            config.outbox_collection.clone(),
        )?);
        let legacy_outbox = Arc::new(SurrealMailOutboxRepository::with_client(
            client.clone(),
            config.legacy_outbox_collection.clone(),
        )?);
        Ok(Self {
            members: Arc::new(SurrealMemberRepository::with_client(client.clone())),
            identity: Arc::new(SurrealIdentityProvider::with_client(client.clone())),
            notifications: Arc::new(SurrealNotificationRepository::with_client(client)),
            changes: outbox.clone(),
            outbox,
            legacy_outbox,
            probe: Arc::new(SurrealProbe::new(db_config)),
        })
    }
}
