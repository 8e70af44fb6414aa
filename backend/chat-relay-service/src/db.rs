use db_pool::{apply_schema, create_pool, DbConfig, DbPoolError, PgPool};

const SERVICE_NAME: &str = "chat-relay-service";
const SCHEMA: &str = include_str!("../migrations/0001_chat_relay.sql");

pub async fn init_pool(database_url: &str) -> Result<PgPool, DbPoolError> {
    let cfg = DbConfig::from_env(SERVICE_NAME)
        .unwrap_or_else(|_| DbConfig::with_url(SERVICE_NAME, database_url));
    cfg.log_config();
    let pool = create_pool(cfg).await?;
    apply_schema(&pool, "chat_relay", SCHEMA).await?;
    Ok(pool)
}
