use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::LimitsConfig;

use super::{LimitError, RateLimiter};

/// Redis key holding the set of active connection ids
const ACTIVE_SET: &str = "connections:active";

const CONNECTION_WINDOW_SECS: i64 = 60;
const COMMAND_WINDOW_SECS: i64 = 3600;

fn connections_key(ip: &str) -> String {
    format!("ratelimit:connections:{}", ip)
}

fn commands_key(key: &str) -> String {
    format!("ratelimit:commands:{}", key)
}

fn metadata_key(connection_id: &str) -> String {
    format!("connection:{}:metadata", connection_id)
}

/// Redis-backed rate limiter. When the store is unreachable (at startup
/// or mid-operation) every check degrades open so terminal access never
/// depends on the store being up.
pub struct RedisRateLimiter {
    conn: Option<ConnectionManager>,
    max_connections: u32,
    max_commands: u32,
    degraded: AtomicU64,
}

impl RedisRateLimiter {
    pub async fn connect(url: &str, limits: &LimitsConfig) -> Self {
        let conn = match redis::Client::open(url) {
            Ok(client) => {
                match tokio::time::timeout(
                    Duration::from_secs(2),
                    client.get_connection_manager(),
                )
                .await
                {
                    Ok(Ok(conn)) => {
                        tracing::info!(url = %url, "Connected to rate-limit store");
                        Some(conn)
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(url = %url, error = %e, "Rate-limit store unavailable, rate limiting disabled");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(url = %url, "Rate-limit store connect timed out, rate limiting disabled");
                        None
                    }
                }
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Invalid rate-limit store url, rate limiting disabled");
                None
            }
        };

        Self {
            conn,
            max_connections: limits.rate_limit_connections,
            max_commands: limits.rate_limit_commands,
            degraded: AtomicU64::new(0),
        }
    }

    fn degrade(&self, what: &str) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(operation = what, "Rate-limit store unavailable, allowing");
    }

    /// INCR the key and set its TTL on first use. Returns the
    /// post-increment count.
    async fn bump(
        conn: &mut ConnectionManager,
        key: &str,
        ttl_secs: i64,
    ) -> redis::RedisResult<i64> {
        let count: i64 = conn.incr(key, 1).await?;
        if count == 1 {
            let _: () = conn.expire(key, ttl_secs).await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check_connection(&self, ip: &str) -> Result<(), LimitError> {
        let Some(conn) = &self.conn else {
            self.degrade("check_connection");
            return Ok(());
        };

        let mut conn = conn.clone();
        match Self::bump(&mut conn, &connections_key(ip), CONNECTION_WINDOW_SECS).await {
            Ok(count) if count > self.max_connections as i64 => {
                tracing::warn!(ip = %ip, count = count, "Connection rate limit exceeded");
                Err(LimitError::LimitExceeded)
            }
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!(error = %e, "Connection rate limit check failed");
                self.degrade("check_connection");
                Ok(())
            }
        }
    }

    async fn check_command(&self, key: &str) -> bool {
        let Some(conn) = &self.conn else {
            self.degrade("check_command");
            return true;
        };

        let mut conn = conn.clone();
        match Self::bump(&mut conn, &commands_key(key), COMMAND_WINDOW_SECS).await {
            Ok(count) => count <= self.max_commands as i64,
            Err(e) => {
                tracing::debug!(error = %e, "Command rate limit check failed");
                self.degrade("check_command");
                true
            }
        }
    }

    async fn track(&self, connection_id: &str, ip: &str, user_agent: &str) {
        let Some(conn) = &self.conn else {
            return;
        };

        let mut conn = conn.clone();
        let result: redis::RedisResult<()> = async {
            let _: () = conn.sadd(ACTIVE_SET, connection_id).await?;
            let _: () = conn
                .hset_multiple(
                    metadata_key(connection_id),
                    &[("ip", ip), ("user_agent", user_agent)],
                )
                .await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(connection = %connection_id, error = %e, "Failed to track connection");
        }
    }

    async fn untrack(&self, connection_id: &str) {
        let Some(conn) = &self.conn else {
            return;
        };

        let mut conn = conn.clone();
        let result: redis::RedisResult<()> = async {
            let _: () = conn.srem(ACTIVE_SET, connection_id).await?;
            let _: () = conn.del(metadata_key(connection_id)).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(connection = %connection_id, error = %e, "Failed to untrack connection");
        }
    }

    async fn active_count(&self) -> u64 {
        let Some(conn) = &self.conn else {
            return 0;
        };

        let mut conn = conn.clone();
        match conn.scard::<_, u64>(ACTIVE_SET).await {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "Failed to count active connections");
                0
            }
        }
    }

    fn degraded_count(&self) -> u64 {
        self.degraded.load(Ordering::Relaxed)
    }
}
