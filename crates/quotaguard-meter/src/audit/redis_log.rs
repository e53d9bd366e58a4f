//! Redis audit log
//!
//! Entries are JSON documents LPUSHed onto `{prefix}:audit:{tenant}`, so the
//! head of the list is always the newest entry.

use std::sync::Arc;

use async_trait::async_trait;
use quotaguard_common::{Feature, TenantId};
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use super::{AuditEntry, AuditError, UsageAuditLog};

/// Entries fetched per LRANGE while filtering
const PAGE_SIZE: isize = 200;

/// Redis-list audit log
pub struct RedisAuditLog {
    client: Client,
    connection: Arc<RwLock<Option<MultiplexedConnection>>>,
    prefix: String,
}

impl RedisAuditLog {
    pub async fn new(redis_url: &str) -> Result<Self, AuditError> {
        let client = Client::open(redis_url)
            .map_err(|e| AuditError::Unavailable(format!("Failed to create Redis client: {}", e)))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AuditError::Unavailable(format!("Failed to connect to Redis: {}", e)))?;

        info!("Connected audit log to Redis");

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(Some(connection))),
            prefix: "quotaguard".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    fn key(&self, tenant: &TenantId) -> String {
        format!("{}:audit:{}", self.prefix, tenant)
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection, AuditError> {
        let guard = self.connection.read().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        drop(guard);

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AuditError::Unavailable(format!("Failed to reconnect to Redis: {}", e)))?;

        *guard = Some(connection.clone());
        Ok(connection)
    }
}

#[async_trait]
impl UsageAuditLog for RedisAuditLog {
    #[instrument(skip(self, entry), fields(tenant = %entry.tenant_id, action = ?entry.action))]
    async fn record(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let payload = serde_json::to_string(&entry)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;
        let mut conn = self.get_connection().await?;

        let _: i64 = conn
            .lpush(self.key(&entry.tenant_id), payload)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    async fn history(
        &self,
        tenant: &TenantId,
        feature: Option<Feature>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, AuditError> {
        let mut conn = self.get_connection().await?;
        let key = self.key(tenant);
        let mut entries = Vec::new();
        let mut offset: isize = 0;

        while entries.len() < limit {
            let page: Vec<String> = conn
                .lrange(&key, offset, offset + PAGE_SIZE - 1)
                .await
                .map_err(unavailable)?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as isize;

            for raw in page {
                match serde_json::from_str::<AuditEntry>(&raw) {
                    Ok(entry) if entry.matches(feature) => {
                        entries.push(entry);
                        if entries.len() == limit {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Skipping undecodable audit entry: {}", e),
                }
            }
        }

        Ok(entries)
    }
}

fn unavailable(err: redis::RedisError) -> AuditError {
    warn!("Redis audit log error: {}", err);
    AuditError::Unavailable(err.to_string())
}
