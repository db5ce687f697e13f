use serde::Deserialize;

/// Immutable service settings, loaded once at startup.
///
/// Every field maps to an environment variable of the same name in upper
/// case (`DB_URL`, `HMAC_SECRET`, ...). Secrets have no defaults; startup
/// fails loudly when they are absent or malformed.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub hmac_secret: String,
    pub admin_token: String,
    pub default_retention_days: i64,
    pub max_payload_bytes: usize,
    pub max_events_per_post: usize,
    pub rate_limit_per_minute: i64,
    pub rate_limit_per_ip: i64,
    pub db_op_timeout_secs: u64,
    pub auth_lookup_timeout_secs: u64,
}

/// Minimum length for shared secrets (HMAC secret and admin token).
pub const MIN_SECRET_LEN: usize = 32;

pub fn load_config() -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .set_default("db_url", "sqlite:spillway.db")?
        .set_default("server_host", "127.0.0.1")?
        .set_default("server_port", 8300)?
        .set_default("default_retention_days", 3)?
        .set_default("max_payload_bytes", 524_288)?
        .set_default("max_events_per_post", 250)?
        .set_default("rate_limit_per_minute", 5000)?
        .set_default("rate_limit_per_ip", 100)?
        .set_default("db_op_timeout_secs", 10)?
        .set_default("auth_lookup_timeout_secs", 10)?
        .add_source(config::Environment::default())
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.hmac_secret.len() < MIN_SECRET_LEN {
        anyhow::bail!("HMAC_SECRET must be at least {} characters", MIN_SECRET_LEN);
    }

    if cfg.admin_token.len() < MIN_SECRET_LEN {
        anyhow::bail!("ADMIN_TOKEN must be at least {} characters", MIN_SECRET_LEN);
    }

    if cfg.default_retention_days < 1 {
        anyhow::bail!("DEFAULT_RETENTION_DAYS must be at least 1");
    }

    if cfg.max_events_per_post == 0 {
        anyhow::bail!("MAX_EVENTS_PER_POST must be at least 1");
    }

    if cfg.max_payload_bytes == 0 {
        anyhow::bail!("MAX_PAYLOAD_BYTES must be at least 1");
    }

    if cfg.rate_limit_per_minute < 1 || cfg.rate_limit_per_ip < 1 {
        anyhow::bail!("rate limit caps must be at least 1");
    }

    if cfg.db_op_timeout_secs == 0 || cfg.auth_lookup_timeout_secs == 0 {
        anyhow::bail!("store timeouts must be at least 1 second");
    }

    Ok(())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        db_url: "sqlite::memory:".to_string(),
        server_host: "127.0.0.1".to_string(),
        server_port: 8300,
        hmac_secret: "0123456789abcdef0123456789abcdef".to_string(),
        admin_token: "fedcba9876543210fedcba9876543210".to_string(),
        default_retention_days: 3,
        max_payload_bytes: 524_288,
        max_events_per_post: 250,
        rate_limit_per_minute: 5000,
        rate_limit_per_ip: 100,
        db_op_timeout_secs: 10,
        auth_lookup_timeout_secs: 10,
    }
}
