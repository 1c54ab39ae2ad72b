//! Environment-driven configuration for both binaries.
//!
//! All variables carry the `PLEIADES_` prefix. Booleans accept `true`/`1`.

use std::env;
use std::net::SocketAddr;

pub const DEFAULT_ENDPOINT: &str = "https://stream.wikimedia.org/v2/stream/recentchange";
const DEFAULT_EVENT_DIR: &str = "./events";
const DEFAULT_REDIS_ADDR: &str = "localhost:6379";

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => {
            let v = v.to_lowercase();
            v == "true" || v == "1"
        }
        Err(_) => false,
    }
}

fn metrics_addr() -> Result<Option<SocketAddr>, ConfigError> {
    match env::var("PLEIADES_METRICS_ADDR") {
        Ok(addr) => addr
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(format!("bad PLEIADES_METRICS_ADDR: {}", addr))),
        Err(_) => Ok(None),
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVariable(name.to_string()))
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub broker: String,
    pub topic: String,
}

impl KafkaConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            broker: required("PLEIADES_KAFKA_BROKER")?,
            topic: required("PLEIADES_KAFKA_TOPIC")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct IngesterConfig {
    pub endpoint: String,
    /// Ask enabled sinks for a resume token before starting the reader.
    pub resume: bool,
    pub channel_buffer: usize,
    /// Destination directory for the file sink; `None` disables it.
    pub file_destination: Option<String>,
    /// Broker/topic for the kafka sink; `None` disables it.
    pub kafka: Option<KafkaConfig>,
    pub metrics_addr: Option<SocketAddr>,
}

impl IngesterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint =
            env::var("PLEIADES_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

        let channel_buffer = env::var("PLEIADES_CHANNEL_BUFFER")
            .unwrap_or_else(|_| "1000".to_string())
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::InvalidValue("PLEIADES_CHANNEL_BUFFER must be an integer".to_string())
            })?;

        let file_destination = if env_flag("PLEIADES_FILE_ENABLE") {
            Some(
                env::var("PLEIADES_FILE_DESTINATION")
                    .unwrap_or_else(|_| DEFAULT_EVENT_DIR.to_string()),
            )
        } else {
            None
        };

        let kafka = if env_flag("PLEIADES_KAFKA_ENABLE") {
            Some(KafkaConfig::from_env()?)
        } else {
            None
        };

        if file_destination.is_none() && kafka.is_none() {
            return Err(ConfigError::InvalidValue(
                "no sink enabled; set PLEIADES_FILE_ENABLE or PLEIADES_KAFKA_ENABLE".to_string(),
            ));
        }

        Ok(Self {
            endpoint,
            resume: env_flag("PLEIADES_RESUME"),
            channel_buffer,
            file_destination,
            kafka,
            metrics_addr: metrics_addr()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    File,
    Kafka,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub source: SourceType,
    pub file_source: String,
    pub kafka: Option<KafkaConfig>,
    pub redis_addr: String,
    pub metrics_addr: Option<SocketAddr>,
}

impl AggregatorConfig {
    /// Source selection comes from `--source file|kafka`; everything else
    /// from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let source = Self::parse_source_from_args();

        let kafka = match source {
            SourceType::Kafka => Some(KafkaConfig::from_env()?),
            SourceType::File => None,
        };

        Ok(Self {
            source,
            file_source: env::var("PLEIADES_FILE_SOURCE")
                .unwrap_or_else(|_| DEFAULT_EVENT_DIR.to_string()),
            kafka,
            redis_addr: env::var("PLEIADES_REDIS_ADDR")
                .unwrap_or_else(|_| DEFAULT_REDIS_ADDR.to_string()),
            metrics_addr: metrics_addr()?,
        })
    }

    pub fn parse_source_from_args() -> SourceType {
        let args: Vec<String> = env::args().collect();
        if let Some(idx) = args.iter().position(|a| a == "--source") {
            match args.get(idx + 1).map(|s| s.as_str()) {
                Some("kafka") => return SourceType::Kafka,
                Some("file") => return SourceType::File,
                _ => {}
            }
        }
        SourceType::File
    }
}
