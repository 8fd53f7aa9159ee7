//! Transcription-worker allocation over a shared Redis registry.
//!
//! Two structures, shared by every control-plane instance and by the
//! workers themselves:
//! - `wl:rank` — sorted set mapping worker URL to current load.
//! - `wl:hb:<url>` — per-worker heartbeat key with a TTL; absence means
//!   the worker is dead.
//!
//! Allocation walks the rank in ascending-load order and takes the first
//! live worker under the capacity limit. Allocate, release, and failover
//! are single server-side Lua evaluations so concurrent callers can never
//! jointly overshoot the capacity limit.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

pub type Result<T> = std::result::Result<T, redis::RedisError>;

pub const RANK_KEY: &str = "wl:rank";
pub const HEARTBEAT_PREFIX: &str = "wl:hb:";

pub fn heartbeat_key(worker_url: &str) -> String {
    format!("{HEARTBEAT_PREFIX}{worker_url}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Atomic scripts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// KEYS[1] = rank key, ARGV[1] = capacity limit, ARGV[2] = heartbeat
/// prefix. Returns the chosen worker URL or nil.
const ALLOCATE_LUA: &str = r#"
local rank = redis.call('ZRANGE', KEYS[1], 0, -1, 'WITHSCORES')
local capacity = tonumber(ARGV[1])
for i = 1, #rank, 2 do
    local url = rank[i]
    local load = tonumber(rank[i + 1])
    if load < capacity and redis.call('EXISTS', ARGV[2] .. url) == 1 then
        redis.call('ZINCRBY', KEYS[1], 1, url)
        return url
    end
end
return false
"#;

/// KEYS[1] = rank key, ARGV[1] = worker URL. Decrements load, clamped at
/// zero; a worker no longer in the rank is left alone. Returns the new
/// load or -1 if absent.
const RELEASE_LUA: &str = r#"
local load = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not load then
    return -1
end
local new = tonumber(load) - 1
if new < 0 then
    new = 0
end
redis.call('ZADD', KEYS[1], new, ARGV[1])
return new
"#;

/// KEYS[1] = rank key, ARGV[1] = failing worker URL, ARGV[2] = capacity
/// limit, ARGV[3] = heartbeat prefix. Releases and evicts the failing
/// worker, then allocates the next candidate. Returns the replacement URL
/// or nil.
const FAILOVER_LUA: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
local rank = redis.call('ZRANGE', KEYS[1], 0, -1, 'WITHSCORES')
local capacity = tonumber(ARGV[2])
for i = 1, #rank, 2 do
    local url = rank[i]
    local load = tonumber(rank[i + 1])
    if load < capacity and redis.call('EXISTS', ARGV[3] .. url) == 1 then
        redis.call('ZINCRBY', KEYS[1], 1, url)
        return url
    end
end
return false
"#;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Allocator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle on the shared worker registry. Cheap to clone; all operations
/// are individually atomic on the Redis side.
#[derive(Clone)]
pub struct WorkerAllocator {
    conn: ConnectionManager,
    allocate_script: Script,
    release_script: Script,
    failover_script: Script,
}

impl WorkerAllocator {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            allocate_script: Script::new(ALLOCATE_LUA),
            release_script: Script::new(RELEASE_LUA),
            failover_script: Script::new(FAILOVER_LUA),
        }
    }

    /// Pick the least-loaded live worker under `capacity_limit` and
    /// increment its load. `None` means no worker is available right now.
    pub async fn allocate(&self, capacity_limit: u32) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.allocate_script
            .key(RANK_KEY)
            .arg(capacity_limit)
            .arg(HEARTBEAT_PREFIX)
            .invoke_async(&mut conn)
            .await
    }

    /// Return a previously allocated slot. Safe to call for workers the
    /// reaper already removed.
    pub async fn release(&self, worker_url: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let new_load: i64 = self
            .release_script
            .key(RANK_KEY)
            .arg(worker_url)
            .invoke_async(&mut conn)
            .await?;
        if new_load < 0 {
            tracing::debug!(worker_url, "release for worker no longer in rank");
        }
        Ok(())
    }

    /// A bot reported `bad_url` unhealthy: release and evict it, then hand
    /// out the next candidate. The caller releases its original slot by
    /// virtue of the eviction (the whole entry is gone).
    pub async fn failover(
        &self,
        bad_url: &str,
        capacity_limit: u32,
    ) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.failover_script
            .key(RANK_KEY)
            .arg(bad_url)
            .arg(capacity_limit)
            .arg(HEARTBEAT_PREFIX)
            .invoke_async(&mut conn)
            .await
    }

    /// Add a worker at zero load, leaving an existing entry's load alone.
    pub async fn register_worker(&self, worker_url: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(RANK_KEY)
            .arg("NX")
            .arg(0)
            .arg(worker_url)
            .query_async::<()>(&mut conn)
            .await
    }

    /// Refresh a worker's heartbeat key.
    pub async fn heartbeat(&self, worker_url: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(heartbeat_key(worker_url), 1, ttl.as_secs())
            .await
    }

    /// Current rank contents, ascending by load.
    pub async fn rank_snapshot(&self) -> Result<Vec<(String, i64)>> {
        let mut conn = self.conn.clone();
        conn.zrange_withscores(RANK_KEY, 0, -1).await
    }

    /// Remove rank entries whose heartbeat key has expired. Returns the
    /// evicted worker URLs; their in-flight allocations are considered
    /// lost and affected bots re-allocate through failover.
    pub async fn reap_dead(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.zrange(RANK_KEY, 0, -1).await?;
        let mut removed = Vec::new();
        for url in members {
            let alive: bool = conn.exists(heartbeat_key(&url)).await?;
            if !alive {
                let _: i64 = conn.zrem(RANK_KEY, &url).await?;
                removed.push(url);
            }
        }
        Ok(removed)
    }

    /// Round-trip check for health reporting.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await
    }
}

/// Background loop evicting dead workers. Run with a period at or below
/// the heartbeat TTL.
pub async fn run_reaper(allocator: WorkerAllocator, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match allocator.reap_dead().await {
            Ok(removed) if removed.is_empty() => {}
            Ok(removed) => {
                tracing::info!(count = removed.len(), workers = ?removed, "reaped dead workers");
            }
            Err(e) => tracing::warn!(error = %e, "worker reaper sweep failed"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_key_shape() {
        assert_eq!(
            heartbeat_key("ws://worker-1:9090"),
            "wl:hb:ws://worker-1:9090"
        );
    }

    #[test]
    fn scripts_parse_as_lua_chunks() {
        // Script::new computes the SHA over the source; these would panic
        // on empty bodies and catch accidental truncation of the consts.
        for src in [ALLOCATE_LUA, RELEASE_LUA, FAILOVER_LUA] {
            assert!(!Script::new(src).get_hash().is_empty());
            assert!(src.contains("KEYS[1]"));
        }
    }
}
