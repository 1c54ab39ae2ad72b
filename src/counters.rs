//! Counter-store client.
//!
//! The aggregation side keeps all derived counters in Redis. Every call
//! carries its own short timeout; a connection is validated once with a ping
//! at construction and never re-validated after that.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const OP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum CounterError {
    /// The per-call timeout elapsed. Carries the operation name.
    Timeout(&'static str),
    Redis(redis::RedisError),
}

impl std::fmt::Display for CounterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterError::Timeout(op) => write!(f, "counter store {} timed out", op),
            CounterError::Redis(e) => write!(f, "counter store error: {}", e),
        }
    }
}

impl std::error::Error for CounterError {}

impl From<redis::RedisError> for CounterError {
    fn from(err: redis::RedisError) -> Self {
        CounterError::Redis(err)
    }
}

/// Increment/read surface of the counter store. Keys are plain strings,
/// values are signed 64-bit integers.
#[async_trait]
pub trait Counters: Send + Sync {
    async fn ping(&self) -> Result<(), CounterError>;
    async fn incr(&self, key: &str) -> Result<i64, CounterError>;
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CounterError>;
}

pub struct RedisCounters {
    conn: ConnectionManager,
}

impl RedisCounters {
    /// Connect to Redis at `addr` (host:port) and validate the connection
    /// with a ping before returning.
    pub async fn connect(addr: &str) -> Result<Self, CounterError> {
        let client = redis::Client::open(format!("redis://{}/", addr))?;
        let conn = timeout(CONNECT_TIMEOUT, client.get_connection_manager())
            .await
            .map_err(|_| CounterError::Timeout("connect"))??;
        let counters = Self { conn };
        timeout(CONNECT_TIMEOUT, counters.ping_inner())
            .await
            .map_err(|_| CounterError::Timeout("ping"))??;
        log::debug!("connected to Redis at {}", addr);
        Ok(counters)
    }

    async fn ping_inner(&self) -> Result<(), CounterError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Counters for RedisCounters {
    async fn ping(&self) -> Result<(), CounterError> {
        timeout(OP_TIMEOUT, self.ping_inner())
            .await
            .map_err(|_| CounterError::Timeout("ping"))?
    }

    async fn incr(&self, key: &str) -> Result<i64, CounterError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("INCR");
        cmd.arg(key);
        let fut = cmd.query_async(&mut conn);
        let value: i64 = timeout(OP_TIMEOUT, fut)
            .await
            .map_err(|_| CounterError::Timeout("incr"))??;
        Ok(value)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CounterError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("INCRBY");
        cmd.arg(key).arg(delta);
        let fut = cmd.query_async(&mut conn);
        let value: i64 = timeout(OP_TIMEOUT, fut)
            .await
            .map_err(|_| CounterError::Timeout("incrby"))??;
        Ok(value)
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory stand-in used by the aggregation tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryCounters {
        values: Mutex<HashMap<String, i64>>,
        pub fail_increments: std::sync::atomic::AtomicBool,
    }

    impl MemoryCounters {
        pub fn get(&self, key: &str) -> i64 {
            *self.values.lock().unwrap().get(key).unwrap_or(&0)
        }

        fn bump(&self, key: &str, delta: i64) -> Result<i64, CounterError> {
            if self.fail_increments.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(CounterError::Timeout("incr"));
            }
            let mut values = self.values.lock().unwrap();
            let value = values.entry(key.to_string()).or_insert(0);
            *value += delta;
            Ok(*value)
        }
    }

    #[async_trait]
    impl Counters for MemoryCounters {
        async fn ping(&self) -> Result<(), CounterError> {
            Ok(())
        }

        async fn incr(&self, key: &str) -> Result<i64, CounterError> {
            self.bump(key, 1)
        }

        async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CounterError> {
            self.bump(key, delta)
        }
    }

    // Lets tests keep a handle on the store after handing it to a source.
    #[async_trait]
    impl Counters for std::sync::Arc<MemoryCounters> {
        async fn ping(&self) -> Result<(), CounterError> {
            self.as_ref().ping().await
        }

        async fn incr(&self, key: &str) -> Result<i64, CounterError> {
            self.as_ref().incr(key).await
        }

        async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CounterError> {
            self.as_ref().incr_by(key, delta).await
        }
    }
}
