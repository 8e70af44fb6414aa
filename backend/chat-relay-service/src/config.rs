use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LSERVER: &str = "duolicious.app";
pub const DEFAULT_PUSH_ENDPOINT: &str = "https://exp.host/--/api/v2/push/send?useFcmV1=true";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    /// Domain part of every JID the relay hands out
    pub lserver: String,
    pub max_message_len: usize,
    pub presence_ttl: Duration,
    pub online_refresh_interval: Duration,
    pub push_endpoint: String,
    pub audio_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| crate::error::AppError::Config("DATABASE_URL missing".into()))?;
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5443);
        let lserver = env::var("LSERVER").unwrap_or_else(|_| DEFAULT_LSERVER.into());
        let max_message_len = env::var("MAX_MESSAGE_LEN")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        let presence_ttl_secs = env::var("PRESENCE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(7 * 24 * 60 * 60);
        let online_refresh_secs = env::var("ONLINE_REFRESH_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4 * 60);
        let push_endpoint =
            env::var("PUSH_ENDPOINT").unwrap_or_else(|_| DEFAULT_PUSH_ENDPOINT.into());
        let audio_dir = env::var("AUDIO_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./audio"));

        if online_refresh_secs == 0 {
            return Err(crate::error::AppError::Config(
                "ONLINE_REFRESH_SECS must be positive".into(),
            ));
        }

        Ok(Self {
            database_url,
            redis_url,
            port,
            lserver,
            max_message_len,
            presence_ttl: Duration::from_secs(presence_ttl_secs),
            online_refresh_interval: Duration::from_secs(online_refresh_secs),
            push_endpoint,
            audio_dir,
        })
    }

    /// Defaults without touching the environment.
    pub fn test_defaults() -> Self {
        Self {
            database_url: "postgres://localhost/chat_relay_test".into(),
            redis_url: "redis://127.0.0.1:6379".into(),
            port: 0,
            lserver: DEFAULT_LSERVER.into(),
            max_message_len: 5000,
            presence_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            online_refresh_interval: Duration::from_secs(4 * 60),
            push_endpoint: DEFAULT_PUSH_ENDPOINT.into(),
            audio_dir: PathBuf::from("./audio"),
        }
    }

    pub fn jid(&self, username: &uuid::Uuid) -> String {
        format!("{}@{}", username, self.lserver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "DATABASE_URL",
            "REDIS_URL",
            "PORT",
            "LSERVER",
            "MAX_MESSAGE_LEN",
            "PRESENCE_TTL_SECS",
            "ONLINE_REFRESH_SECS",
            "PUSH_ENDPOINT",
            "AUDIO_DIR",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        env::set_var("DATABASE_URL", "postgres://localhost/chat");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.database_url, "postgres://localhost/chat");
        assert_eq!(cfg.port, 5443);
        assert_eq!(cfg.lserver, "duolicious.app");
        assert_eq!(cfg.max_message_len, 5000);
        assert_eq!(cfg.presence_ttl, Duration::from_secs(604_800));
        assert_eq!(cfg.online_refresh_interval, Duration::from_secs(240));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var("DATABASE_URL", "postgres://localhost/chat");
        env::set_var("PORT", "6000");
        env::set_var("MAX_MESSAGE_LEN", "10");
        env::set_var("LSERVER", "example.org");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.max_message_len, 10);
        assert_eq!(cfg.lserver, "example.org");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        clear_env();
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_jid() {
        let cfg = Config::test_defaults();
        let u = uuid::Uuid::nil();
        assert_eq!(
            cfg.jid(&u),
            "00000000-0000-0000-0000-000000000000@duolicious.app"
        );
    }
}
