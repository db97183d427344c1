pub mod redis;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LimitError {
    #[error("Too many connections. Please try again later.")]
    LimitExceeded,
}

/// Contract over the shared rate-limit store. Implementations degrade
/// open: a store failure allows the operation, logs a warning, and bumps
/// the degraded counter.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Per-IP connection ceiling over a 60 s window.
    async fn check_connection(&self, ip: &str) -> Result<(), LimitError>;

    /// Per-connection command ceiling over a 3600 s window. Returns
    /// `true` when the command is within the ceiling.
    async fn check_command(&self, key: &str) -> bool;

    /// Record an active connection with audit metadata. Idempotent.
    async fn track(&self, connection_id: &str, ip: &str, user_agent: &str);

    /// Remove a connection record. Idempotent.
    async fn untrack(&self, connection_id: &str);

    /// Number of currently tracked connections.
    async fn active_count(&self) -> u64;

    /// How many checks were allowed because the store was unavailable.
    fn degraded_count(&self) -> u64;
}
