use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,

    // Web server
    pub web_host: String,
    pub web_port: u16,

    // Worker pool defaults
    pub default_worker_count: usize,
    pub default_concurrency: usize,
    /// Consecutive fetch failures before a lane gives up and reports `error`.
    pub max_consecutive_failures: u32,
    /// Per-request fetch timeout in seconds.
    pub fetch_timeout_secs: u64,

    // Scheduler
    /// Seconds between scheduler ticks.
    pub scheduler_tick_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            web_host: env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: env::var("WEB_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .expect("WEB_PORT must be a number"),
            default_worker_count: parse_env("DEFAULT_WORKER_COUNT", 1),
            default_concurrency: parse_env("DEFAULT_CONCURRENCY", 2),
            max_consecutive_failures: parse_env("MAX_CONSECUTIVE_FAILURES", 3),
            fetch_timeout_secs: parse_env("FETCH_TIMEOUT_SECS", 15),
            scheduler_tick_secs: parse_env("SCHEDULER_TICK_SECS", 10),
        }
    }

    /// Log the effective configuration without leaking credentials.
    pub fn log_redacted(&self) {
        let db = match url::Url::parse(&self.database_url) {
            Ok(u) => format!(
                "{}://{}@{}/{}",
                u.scheme(),
                u.username(),
                u.host_str().unwrap_or("?"),
                u.path().trim_start_matches('/')
            ),
            Err(_) => "<unparseable>".to_string(),
        };
        tracing::info!(
            database = db.as_str(),
            host = self.web_host.as_str(),
            port = self.web_port,
            workers = self.default_worker_count,
            concurrency = self.default_concurrency,
            "Configuration loaded"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a valid number")),
        Err(_) => default,
    }
}
