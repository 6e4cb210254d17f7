use std::sync::Arc;
use std::time::Duration;

use crm_domain::DomainResult;
use crm_domain::error::DomainError;
use crm_domain::ports::BoxFuture;
use crm_domain::ports::store::StoreProbe;
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl DbConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.surreal_endpoint.clone(),
            namespace: config.surreal_ns.clone(),
            database: config.surreal_db.clone(),
            username: config.surreal_user.clone(),
            password: config.surreal_pass.clone(),
        }
    }
}

/// Opens one authenticated connection shared by every Surreal repository.
pub async fn connect(config: &DbConfig) -> anyhow::Result<Arc<Surreal<Client>>> {
    let db = Surreal::<Client>::init();
    db.connect::<Ws>(config.endpoint.as_str()).await?;
    db.signin(Root {
        username: config.username.clone(),
        password: config.password.clone(),
    })
    .await?;
    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await?;
    tracing::info!(
        endpoint = %config.endpoint,
        namespace = %config.namespace,
        database = %config.database,
        "connected to surrealdb"
    );
    Ok(Arc::new(db))
}

#[derive(Debug, Clone)]
pub struct SurrealProbe {
    config: DbConfig,
}

impl SurrealProbe {
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }
}

impl StoreProbe for SurrealProbe {
    fn backend(&self) -> &'static str {
        "surrealdb"
    }

    fn health_check(&self) -> BoxFuture<'_, DomainResult<()>> {
        let endpoint = self.config.endpoint.clone();
        Box::pin(async move {
            let address = socket_address(&endpoint)?;
            timeout(Duration::from_secs(2), TcpStream::connect(&address))
                .await
                .map_err(|_| DomainError::Unavailable(format!("connect to {address} timed out")))?
                .map_err(|err| {
                    DomainError::Unavailable(format!("connect to {address} failed: {err}"))
                })?;
            tracing::debug!(%address, "surreal endpoint reachable");
            Ok(())
        })
    }
}

/// Always healthy; the in-memory backend lives inside the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryProbe;

impl StoreProbe for MemoryProbe {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn health_check(&self) -> BoxFuture<'_, DomainResult<()>> {
        Box::pin(async { Ok(()) })
    }
}

fn socket_address(endpoint: &str) -> DomainResult<String> {
    let normalized = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("ws://{endpoint}")
    };
    let parsed = Url::parse(&normalized).map_err(|err| {
        DomainError::Unavailable(format!("invalid surreal endpoint '{endpoint}': {err}"))
    })?;
    let host = parsed.host_str().ok_or_else(|| {
        DomainError::Unavailable(format!("missing host in surreal endpoint '{endpoint}'"))
    })?;
    let port = match parsed.scheme() {
        "ws" | "wss" | "http" | "https" => parsed.port().unwrap_or(8000),
        _ => parsed.port_or_known_default().unwrap_or(8000),
    };
    Ok(format!("{host}:{port}"))
}
