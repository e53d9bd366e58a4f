//! Redis usage store
//!
//! Each tenant's record is a hash at `{prefix}:usage:{tenant}`. Every mutation
//! is a Lua script, which Redis runs atomically, so the ceiling check, the
//! period guard and the add can never interleave with another writer.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use quotaguard_common::{BillingPeriod, Counter, Limit, StoreError, TenantId, UsageRecord};
use redis::{aio::MultiplexedConnection, AsyncCommands, Client, Script};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::{IncrementOutcome, ResetOutcome, UsageStore};

const FIELD_TENANT: &str = "tenant_id";
const FIELD_PERIOD_START: &str = "period_start";
const FIELD_PERIOD_END: &str = "period_end";
const FIELD_LAST_UPDATED: &str = "last_updated";

// Script status codes
const MISSING: i64 = -3;
const STALE: i64 = -2;
const EXCEEDED: i64 = -1;

const CREATE_IF_ABSENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1],
  'tenant_id', ARGV[1],
  'ai_credits', 0, 'ai_edits', 0, 'api_calls', 0,
  'social_sets', 0, 'storage_gb', 0, 'context_files', 0,
  'period_start', ARGV[2], 'period_end', ARGV[3], 'last_updated', ARGV[4])
return 1
"#;

// ARGV: field, amount, limit ('' = unlimited), expected period start ('' = unguarded), now
// The ceiling check compares against the remaining headroom so no operand
// exceeds the amount or the limit, both of which are exact in a Lua double.
const INCREMENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {-3, 0}
end
if ARGV[4] ~= '' then
  local start = redis.call('HGET', KEYS[1], 'period_start')
  local finish = tonumber(redis.call('HGET', KEYS[1], 'period_end'))
  if start ~= ARGV[4] or tonumber(ARGV[5]) > finish then
    return {-2, 0}
  end
end
local used = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '0')
if ARGV[3] ~= '' and tonumber(ARGV[2]) > tonumber(ARGV[3]) - used then
  return {-1, used}
end
local total = redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[1], 'last_updated', ARGV[5])
return {1, total}
"#;

// ARGV: field, amount, now
const DECREMENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -3
end
local total = tonumber(redis.call('HGET', KEYS[1], ARGV[1]) or '0') - tonumber(ARGV[2])
if total < 0 then
  total = 0
end
redis.call('HSET', KEYS[1], ARGV[1], total, 'last_updated', ARGV[3])
return total
"#;

// ARGV: expected end, new start, new end, now, resettable fields...
const RESET: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {-3}
end
if redis.call('HGET', KEYS[1], 'period_end') ~= ARGV[1] then
  return {0}
end
local cleared = {1}
for i = 5, #ARGV do
  cleared[#cleared + 1] = tonumber(redis.call('HGET', KEYS[1], ARGV[i]) or '0')
  redis.call('HSET', KEYS[1], ARGV[i], 0)
end
redis.call('HSET', KEYS[1], 'period_start', ARGV[2], 'period_end', ARGV[3], 'last_updated', ARGV[4])
return cleared
"#;

/// Redis-backed usage store
pub struct RedisUsageStore {
    /// Redis client
    client: Client,
    /// Shared multiplexed connection
    connection: Arc<RwLock<Option<MultiplexedConnection>>>,
    /// Key prefix for usage records
    prefix: String,
    create_script: Script,
    increment_script: Script,
    decrement_script: Script,
    reset_script: Script,
}

impl RedisUsageStore {
    /// Connect to Redis
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("Failed to create Redis client: {}", e)))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect to Redis: {}", e)))?;

        info!("Connected usage store to Redis");

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(Some(connection))),
            prefix: "quotaguard".to_string(),
            create_script: Script::new(CREATE_IF_ABSENT),
            increment_script: Script::new(INCREMENT),
            decrement_script: Script::new(DECREMENT),
            reset_script: Script::new(RESET),
        })
    }

    /// Use a custom key prefix
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    fn key(&self, tenant: &TenantId) -> String {
        format!("{}:usage:{}", self.prefix, tenant)
    }

    async fn load(
        &self,
        conn: &mut MultiplexedConnection,
        tenant: &TenantId,
    ) -> Result<Option<UsageRecord>, StoreError> {
        let fields: HashMap<String, String> = conn
            .hgetall(self.key(tenant))
            .await
            .map_err(unavailable)?;

        if fields.is_empty() {
            return Ok(None);
        }
        record_from_hash(tenant, &fields).map(Some)
    }

    async fn load_existing(
        &self,
        conn: &mut MultiplexedConnection,
        tenant: &TenantId,
    ) -> Result<UsageRecord, StoreError> {
        self.load(conn, tenant)
            .await?
            .ok_or_else(|| StoreError::NotFound(tenant.to_string()))
    }

    async fn run_increment(
        &self,
        tenant: &TenantId,
        counter: Counter,
        amount: u64,
        limit: Limit,
        expected_period_start: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(i64, i64), StoreError> {
        let mut conn = self.get_connection().await?;
        let limit = limit.value().map(|v| v.to_string()).unwrap_or_default();
        let expected = expected_period_start
            .map(|start| start.timestamp_millis().to_string())
            .unwrap_or_default();

        let reply: Vec<i64> = self
            .increment_script
            .key(self.key(tenant))
            .arg(counter.as_str())
            .arg(amount)
            .arg(limit)
            .arg(expected)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match reply.as_slice() {
            [status, value] => Ok((*status, *value)),
            _ => Err(StoreError::Serialization(format!(
                "Unexpected increment reply: {:?}",
                reply
            ))),
        }
    }

    /// Get a connection, reconnecting if needed
    async fn get_connection(&self) -> Result<MultiplexedConnection, StoreError> {
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
            .map_err(|e| StoreError::Unavailable(format!("Failed to reconnect to Redis: {}", e)))?;

        *guard = Some(connection.clone());
        Ok(connection)
    }
}

#[async_trait]
impl UsageStore for RedisUsageStore {
    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    async fn get(&self, tenant: &TenantId) -> Result<Option<UsageRecord>, StoreError> {
        let mut conn = self.get_connection().await?;
        self.load(&mut conn, tenant).await
    }

    #[instrument(skip(self, tenant, period), fields(tenant = %tenant))]
    async fn create_if_absent(
        &self,
        tenant: &TenantId,
        period: BillingPeriod,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, StoreError> {
        let mut conn = self.get_connection().await?;

        let created: i64 = self
            .create_script
            .key(self.key(tenant))
            .arg(tenant.as_str())
            .arg(period.start.timestamp_millis())
            .arg(period.end.timestamp_millis())
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if created == 1 {
            info!("Created usage record");
        }
        self.load_existing(&mut conn, tenant).await
    }

    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    async fn atomic_increment(
        &self,
        tenant: &TenantId,
        counter: Counter,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        match self
            .run_increment(tenant, counter, amount, Limit::Unlimited, None, now)
            .await?
        {
            (MISSING, _) => Err(StoreError::NotFound(tenant.to_string())),
            (_, total) => to_count(tenant, total),
        }
    }

    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    async fn increment_within_limit(
        &self,
        tenant: &TenantId,
        counter: Counter,
        amount: u64,
        limit: Limit,
        expected_period_start: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<IncrementOutcome, StoreError> {
        let (status, value) = self
            .run_increment(tenant, counter, amount, limit, expected_period_start, now)
            .await?;

        match status {
            MISSING => Err(StoreError::NotFound(tenant.to_string())),
            STALE => {
                debug!("Period moved under increment");
                Ok(IncrementOutcome::PeriodStale)
            }
            EXCEEDED => Ok(IncrementOutcome::LimitExceeded {
                used: to_count(tenant, value)?,
            }),
            _ => Ok(IncrementOutcome::Applied {
                total: to_count(tenant, value)?,
            }),
        }
    }

    #[instrument(skip(self, tenant), fields(tenant = %tenant))]
    async fn atomic_decrement(
        &self,
        tenant: &TenantId,
        counter: Counter,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut conn = self.get_connection().await?;

        let total: i64 = self
            .decrement_script
            .key(self.key(tenant))
            .arg(counter.as_str())
            .arg(amount)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if total == MISSING {
            return Err(StoreError::NotFound(tenant.to_string()));
        }
        to_count(tenant, total)
    }

    #[instrument(skip(self, tenant, next), fields(tenant = %tenant))]
    async fn reset_resettable_counters(
        &self,
        tenant: &TenantId,
        expected_end: DateTime<Utc>,
        next: BillingPeriod,
        now: DateTime<Utc>,
    ) -> Result<ResetOutcome, StoreError> {
        let mut conn = self.get_connection().await?;

        let mut invocation = self.reset_script.key(self.key(tenant));
        invocation
            .arg(expected_end.timestamp_millis())
            .arg(next.start.timestamp_millis())
            .arg(next.end.timestamp_millis())
            .arg(now.timestamp_millis());
        for counter in Counter::RESETTABLE {
            invocation.arg(counter.as_str());
        }

        let reply: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match reply.split_first() {
            Some((&MISSING, _)) => Err(StoreError::NotFound(tenant.to_string())),
            Some((&1, previous)) => {
                let cleared = Counter::RESETTABLE
                    .into_iter()
                    .zip(previous.iter())
                    .map(|(counter, value)| Ok((counter, to_count(tenant, *value)?)))
                    .collect::<Result<Vec<_>, StoreError>>()?;
                let record = self.load_existing(&mut conn, tenant).await?;
                Ok(ResetOutcome::Applied { record, cleared })
            }
            Some(_) => {
                let record = self.load_existing(&mut conn, tenant).await?;
                Ok(ResetOutcome::AlreadyReset { record })
            }
            None => Err(StoreError::Serialization("Empty reset reply".to_string())),
        }
    }
}

fn unavailable(err: redis::RedisError) -> StoreError {
    warn!("Redis usage store error: {}", err);
    StoreError::Unavailable(err.to_string())
}

fn to_count(tenant: &TenantId, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        tenant: tenant.to_string(),
        reason: format!("negative counter value {}", value),
    })
}

fn record_from_hash(
    tenant: &TenantId,
    fields: &HashMap<String, String>,
) -> Result<UsageRecord, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        tenant: tenant.to_string(),
        reason,
    };

    let count = |counter: Counter| -> Result<u64, StoreError> {
        match fields.get(counter.as_str()) {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| corrupt(format!("{} is not a count: {}", counter, raw))),
            None => Ok(0),
        }
    };

    let timestamp = |field: &str| -> Result<DateTime<Utc>, StoreError> {
        let raw = fields
            .get(field)
            .ok_or_else(|| corrupt(format!("missing {}", field)))?;
        let millis = raw
            .parse::<i64>()
            .map_err(|_| corrupt(format!("{} is not a timestamp: {}", field, raw)))?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| corrupt(format!("{} out of range: {}", field, millis)))
    };

    if let Some(stored) = fields.get(FIELD_TENANT) {
        if stored != tenant.as_str() {
            return Err(corrupt(format!("record belongs to {}", stored)));
        }
    }

    Ok(UsageRecord {
        tenant_id: tenant.clone(),
        ai_credits: count(Counter::AiCredits)?,
        ai_edits: count(Counter::AiEdits)?,
        api_calls: count(Counter::ApiCalls)?,
        social_sets: count(Counter::SocialSets)?,
        storage_used_gb: count(Counter::StorageGb)?,
        context_files: count(Counter::ContextFiles)?,
        current_period_start: timestamp(FIELD_PERIOD_START)?,
        current_period_end: timestamp(FIELD_PERIOD_END)?,
        last_updated: timestamp(FIELD_LAST_UPDATED)?,
    })
}
