//! Redis-based backend.
//!
//! One implementation serves every Redis topology; only the connection type
//! differs:
//!
//! - single node: [`ConnectionManager`] (reconnects automatically)
//! - cluster: [`ClusterConnection`] over all configured nodes
//! - sentinel: the master reported by the first reachable sentinel, then a
//!   [`ConnectionManager`] to it
//!
//! # Atomicity
//!
//! - `set_if_absent` is `SET key value NX PX ttl`
//! - `compare_and_delete` / `compare_and_expire` are Lua scripts, so the value
//!   check and the mutation run as one server-side step
//! - `has_at_least_n` probes `LINDEX key n-1` instead of counting the list

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ::redis::aio::{ConnectionLike, ConnectionManager};
use ::redis::cluster::ClusterClient;
use ::redis::cluster_async::ClusterConnection;
use ::redis::{AsyncCommands, Script};
use tracing::{debug, warn};

use super::{Backend, NO_EXPIRY_TTL_MILLIS};
use crate::config::RedisSettings;
use crate::error::BackendError;

/// Deletes KEYS[1] only while it still holds ARGV[1].
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Sets a millisecond TTL on KEYS[1] only while it still holds ARGV[1].
const COMPARE_AND_EXPIRE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis backend generic over the async connection type.
#[derive(Clone)]
pub struct RedisBackend<C> {
    conn: C,
    compare_and_delete: Script,
    compare_and_expire: Script,
}

impl<C> RedisBackend<C> {
    /// Wraps an existing connection.
    ///
    /// Useful when sharing a connection across multiple components.
    pub fn from_connection(conn: C) -> Self {
        Self {
            conn,
            compare_and_delete: Script::new(COMPARE_AND_DELETE_SCRIPT),
            compare_and_expire: Script::new(COMPARE_AND_EXPIRE_SCRIPT),
        }
    }
}

impl RedisBackend<ConnectionManager> {
    /// Connects to a single Redis node (the first configured host).
    ///
    /// # Errors
    ///
    /// Returns `BackendError::ConnectionFailed` if the connection fails.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, BackendError> {
        let (host, port) = first_node(settings)?;
        let url = redis_url(&host, port, settings.password.as_deref(), settings.database);
        let conn = with_timeout(settings.timeout(), open_manager(&url)).await?;
        debug!(host = %host, port = port, "Connected to Redis");
        Ok(Self::from_connection(conn))
    }

    /// Resolves the current master through sentinel and connects to it.
    ///
    /// Sentinels are queried in the configured order; the first one that
    /// knows the master wins.
    pub async fn connect_sentinel(settings: &RedisSettings) -> Result<Self, BackendError> {
        let sentinels = settings
            .nodes()
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;

        for (host, port) in &sentinels {
            let url = redis_url(host, *port, None, 0);
            match with_timeout(
                settings.timeout(),
                query_master(&url, &settings.sentinel_master),
            )
            .await
            {
                Ok(Some((master_host, master_port))) => {
                    debug!(
                        sentinel = %host,
                        master = %master_host,
                        port = master_port,
                        "Sentinel resolved master"
                    );
                    let master_url = redis_url(
                        &master_host,
                        master_port,
                        settings.password.as_deref(),
                        settings.database,
                    );
                    let conn = with_timeout(settings.timeout(), open_manager(&master_url)).await?;
                    return Ok(Self::from_connection(conn));
                }
                Ok(None) => {
                    warn!(sentinel = %host, master = %settings.sentinel_master, "Sentinel does not know master");
                }
                Err(e) => {
                    warn!(sentinel = %host, error = %e, "Sentinel unreachable");
                }
            }
        }

        Err(BackendError::ConnectionFailed(format!(
            "no sentinel could resolve master '{}'",
            settings.sentinel_master
        )))
    }
}

impl RedisBackend<ClusterConnection> {
    /// Connects to a Redis Cluster using every configured node as a seed.
    pub async fn connect_cluster(settings: &RedisSettings) -> Result<Self, BackendError> {
        let nodes: Vec<String> = settings
            .nodes()
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?
            .into_iter()
            .map(|(host, port)| redis_url(&host, port, settings.password.as_deref(), 0))
            .collect();

        let client = ClusterClient::new(nodes)
            .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;
        let conn = with_timeout(settings.timeout(), async {
            client
                .get_async_connection()
                .await
                .map_err(|e| BackendError::ConnectionFailed(e.to_string()))
        })
        .await?;

        Ok(Self::from_connection(conn))
    }
}

#[async_trait]
impl<C> Backend for RedisBackend<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn append_to_list(&self, key: &str, values: &[String]) -> Result<(), BackendError> {
        if values.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(key, values).await?;
        Ok(())
    }

    async fn peek_first_n(&self, key: &str, n: usize) -> Result<Vec<String>, BackendError> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.lrange(key, 0, n as isize - 1).await?;
        Ok(values)
    }

    async fn trim_first_n(&self, key: &str, n: usize) -> Result<(), BackendError> {
        if n == 0 {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        conn.ltrim::<_, ()>(key, n as isize, -1).await?;
        Ok(())
    }

    async fn count(&self, key: &str) -> Result<usize, BackendError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn has_at_least_n(&self, key: &str, n: usize) -> Result<bool, BackendError> {
        if n == 0 {
            return Ok(true);
        }

        let mut conn = self.conn.clone();
        let value: Option<String> = conn.lindex(key, n as isize - 1).await?;
        Ok(value.is_some())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }

        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let updated: i64 = self
            .compare_and_expire
            .key(key)
            .arg(expected)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated > 0)
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let mut conn = self.conn.clone();
        let mut keys: Vec<String> = conn.keys(pattern).await?;
        keys.sort();
        Ok(keys)
    }

    async fn time_to_live_millis(&self, key: &str) -> Result<u64, BackendError> {
        let mut conn = self.conn.clone();
        let ttl: i64 = ::redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(match ttl {
            -1 => NO_EXPIRY_TTL_MILLIS,
            t if t < 0 => 0,
            t => t as u64,
        })
    }

    async fn delete_key(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = conn.del(key).await?;
        Ok(deleted > 0)
    }

    async fn flush_all(&self) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("FLUSHDB")
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Builds a `redis://` URL, percent-encoding the password.
fn redis_url(host: &str, port: u16, password: Option<&str>, database: i64) -> String {
    match password.filter(|p| !p.is_empty()) {
        Some(password) => format!(
            "redis://:{}@{}:{}/{}",
            urlencoding::encode(password),
            host,
            port,
            database
        ),
        None => format!("redis://{}:{}/{}", host, port, database),
    }
}

fn first_node(settings: &RedisSettings) -> Result<(String, u16), BackendError> {
    settings
        .nodes()
        .map_err(|e| BackendError::ConnectionFailed(e.to_string()))?
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::ConnectionFailed("no Redis host configured".to_string()))
}

async fn open_manager(url: &str) -> Result<ConnectionManager, BackendError> {
    let client =
        ::redis::Client::open(url).map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;
    ConnectionManager::new(client)
        .await
        .map_err(|e| BackendError::ConnectionFailed(e.to_string()))
}

/// Asks one sentinel for the address of `master`.
async fn query_master(url: &str, master: &str) -> Result<Option<(String, u16)>, BackendError> {
    let client =
        ::redis::Client::open(url).map_err(|e| BackendError::ConnectionFailed(e.to_string()))?;
    let mut conn = client.get_multiplexed_async_connection().await?;

    let reply: Option<Vec<String>> = ::redis::cmd("SENTINEL")
        .arg("get-master-addr-by-name")
        .arg(master)
        .query_async(&mut conn)
        .await?;

    Ok(match reply.as_deref() {
        Some([host, port]) => port.parse().ok().map(|port| (host.clone(), port)),
        _ => None,
    })
}

async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| BackendError::Timeout(limit))?,
        None => fut.await,
    }
}
