use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub log_level: String,
    pub log_format: String,
    pub data_backend: String,
    pub surreal_endpoint: String,
    pub surreal_ns: String,
    pub surreal_db: String,
    pub surreal_user: String,
    pub surreal_pass: String,
    pub outbox_collection: String,
    pub legacy_outbox_collection: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub smtp_starttls: bool,
    pub mail_from: String,
    pub relay_timeout_ms: u64,
    pub migrate_batch_size: usize,
    pub send_test_wait_ms: u64,
    pub welcome_sweep_interval_ms: u64,
    pub login_url: String,
    pub company_name: String,
    pub metrics_enabled: bool,
    pub metrics_listen_addr: String,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("log_level", "info")?
            .set_default("log_format", "auto")?
            .set_default("data_backend", "memory")?
            .set_default("surreal_endpoint", "ws://127.0.0.1:8000")?
            .set_default("surreal_ns", "crm")?
            .set_default("surreal_db", "notifications")?
            .set_default("surreal_user", "root")?
            .set_default("surreal_pass", "root")?
            .set_default("outbox_collection", "mails")?
            .set_default("legacy_outbox_collection", "mail")?
            .set_default("smtp_host", "127.0.0.1")?
            .set_default("smtp_port", 1025)?
            .set_default("smtp_username", "")?
            .set_default("smtp_password", "")?
            .set_default("smtp_starttls", false)?
            .set_default("mail_from", "Narratives <noreply@example.com>")?
            .set_default("relay_timeout_ms", 30_000)?
            .set_default("migrate_batch_size", 500)?
            .set_default("send_test_wait_ms", 30_000)?
            .set_default("welcome_sweep_interval_ms", 30_000)?
            .set_default("login_url", "http://localhost:5173/login")?
            .set_default("company_name", "Narratives")?
            .set_default("metrics_enabled", true)?
            .set_default("metrics_listen_addr", "0.0.0.0:9464")?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn uses_surreal(&self) -> bool {
        self.data_backend.eq_ignore_ascii_case("surreal")
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }

    pub fn send_test_wait(&self) -> Duration {
        Duration::from_millis(self.send_test_wait_ms)
    }

    pub fn welcome_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.welcome_sweep_interval_ms.max(1_000))
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        app_env: "test".into(),
        log_level: "debug".into(),
        log_format: "compact".into(),
        data_backend: "memory".into(),
        surreal_endpoint: "ws://127.0.0.1:8000".into(),
        surreal_ns: "crm".into(),
        surreal_db: "notifications".into(),
        surreal_user: "root".into(),
        surreal_pass: "root".into(),
        outbox_collection: "mails".into(),
        legacy_outbox_collection: "mail".into(),
        smtp_host: "127.0.0.1".into(),
        smtp_port: 1025,
        smtp_username: String::new(),
        smtp_password: String::new(),
        smtp_starttls: false,
        mail_from: "Narratives <noreply@example.com>".into(),
        relay_timeout_ms: 30_000,
        migrate_batch_size: 500,
        send_test_wait_ms: 30_000,
        welcome_sweep_interval_ms: 30_000,
        login_url: "http://localhost:5173/login".into(),
        company_name: "Narratives".into(),
        metrics_enabled: false,
        metrics_listen_addr: "127.0.0.1:9464".into(),
    }
}
