use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

/// Local registry store
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

/// Query execution, pooling and metadata caching limits.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub query_timeout_secs: u64,
    pub default_limit: u64,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_pool_size: usize,
    pub metadata_ttl_secs: u64,
}

impl EngineConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Environment variable -> config key. Values are parsed on deserialize.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("DATABASE_URL", "database.url"),
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("LLM_GATEWAY_URL", "llm.gateway_url"),
    ("LLM_MODEL", "llm.model"),
    ("QUERY_TIMEOUT_SECS", "engine.query_timeout_secs"),
    ("DEFAULT_LIMIT", "engine.default_limit"),
    ("ENGINE_IDLE_TIMEOUT_SECS", "engine.idle_timeout_secs"),
    ("ENGINE_SWEEP_INTERVAL_SECS", "engine.sweep_interval_secs"),
    ("CONNECT_TIMEOUT_SECS", "engine.connect_timeout_secs"),
    ("MAX_POOL_SIZE", "engine.max_pool_size"),
    ("METADATA_TTL_SECS", "engine.metadata_ttl_secs"),
    ("RUST_LOG", "logging.level"),
];

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        let mut builder = config::Config::builder()
            .set_default("database.url", "./db_query.db")?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("llm.gateway_url", "")?
            .set_default("llm.model", "glm-4-flash")?
            .set_default("engine.query_timeout_secs", 30)?
            .set_default("engine.default_limit", 1000)?
            .set_default("engine.idle_timeout_secs", 3600)?
            .set_default("engine.sweep_interval_secs", 300)?
            .set_default("engine.connect_timeout_secs", 10)?
            .set_default("engine.max_pool_size", (num_cpus::get() * 2) as u64)?
            .set_default("engine.metadata_ttl_secs", 3600)?
            .set_default("logging.level", "info")?;

        for (var, key) in ENV_OVERRIDES {
            if let Ok(value) = env::var(var) {
                builder = builder.set_override(*key, value)?;
            }
        }

        if let Ok(api_key) = env::var("LLM_API_KEY") {
            builder = builder.set_override("llm.api_key", Some(api_key))?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
