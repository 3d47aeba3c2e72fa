//! Blocklist and counter storage for the request-defense layer.
//!
//! State is kept either in process memory or in Redis. Both backends expose
//! the same operations; every time-dependent call takes `now` in Unix
//! milliseconds so expiry can be reasoned about without a wall clock.

use std::collections::{HashMap, VecDeque};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::BlockEntry;
use crate::utils::format_key;

/// Result of recording a hit in a sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Whether the hit was admitted and recorded
    pub allowed: bool,
    /// Hits currently inside the window, including this one when admitted
    pub count: u32,
    /// Timestamp of the oldest hit still in the window
    pub oldest_ms: i64,
}

/// Storage backend
pub enum Store {
    Memory(MemoryStore),
    Redis(RedisStore),
}

impl Store {
    pub fn memory() -> Self {
        Store::Memory(MemoryStore::default())
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Store::Memory(_) => "memory",
            Store::Redis(_) => "redis",
        }
    }

    pub async fn put_block(&self, entry: &BlockEntry, now_ms: i64) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => {
                store.put_block(entry).await;
                Ok(())
            }
            Store::Redis(store) => store.put_block(entry, now_ms).await,
        }
    }

    pub async fn get_block(&self, ip: &str, now_ms: i64) -> Result<Option<BlockEntry>, StoreError> {
        match self {
            Store::Memory(store) => Ok(store.get_block(ip, now_ms).await),
            Store::Redis(store) => store.get_block(ip, now_ms).await,
        }
    }

    pub async fn remove_block(&self, ip: &str) -> Result<bool, StoreError> {
        match self {
            Store::Memory(store) => Ok(store.remove_block(ip).await),
            Store::Redis(store) => store.remove_block(ip).await,
        }
    }

    /// Live block records, newest first
    pub async fn list_blocks(&self, now_ms: i64) -> Result<Vec<BlockEntry>, StoreError> {
        let mut entries = match self {
            Store::Memory(store) => store.list_blocks(now_ms).await,
            Store::Redis(store) => store.list_blocks(now_ms).await?,
        };
        entries.sort_by(|a, b| b.blocked_at.cmp(&a.blocked_at));
        Ok(entries)
    }

    /// Add `weight` to the fixed-window violation counter for `ip`
    pub async fn add_violations(
        &self,
        ip: &str,
        weight: u32,
        window_secs: u64,
        now_ms: i64,
    ) -> Result<u32, StoreError> {
        match self {
            Store::Memory(store) => Ok(store.add_violations(ip, weight, window_secs, now_ms).await),
            Store::Redis(store) => store.add_violations(ip, weight, window_secs).await,
        }
    }

    pub async fn clear_violations(&self, ip: &str) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => {
                store.clear_violations(ip).await;
                Ok(())
            }
            Store::Redis(store) => store.clear_violations(ip).await,
        }
    }

    /// Record a hit in the sliding window `key` unless `limit` hits are
    /// already inside the last `window_ms` milliseconds
    pub async fn hit_window(
        &self,
        key: &str,
        limit: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<WindowState, StoreError> {
        match self {
            Store::Memory(store) => Ok(store.hit_window(key, limit, window_ms, now_ms).await),
            Store::Redis(store) => store.hit_window(key, limit, window_ms, now_ms).await,
        }
    }

    pub async fn reset_window(&self, key: &str) -> Result<bool, StoreError> {
        match self {
            Store::Memory(store) => Ok(store.reset_window(key).await),
            Store::Redis(store) => store.reset_window(key).await,
        }
    }

    /// Drop expired state. Redis expires keys itself, so this only does work
    /// for the memory backend.
    pub async fn purge_expired(&self, now_ms: i64) -> Result<usize, StoreError> {
        match self {
            Store::Memory(store) => Ok(store.purge_expired(now_ms).await),
            Store::Redis(_) => Ok(0),
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(_) => Ok(()),
            Store::Redis(store) => store.ping().await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ViolationCounter {
    total: u32,
    expires_at_ms: i64,
}

#[derive(Debug)]
struct WindowLog {
    window_ms: i64,
    hits: VecDeque<i64>,
}

impl WindowLog {
    fn evict(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        while self.hits.front().map_or(false, |&ts| ts <= cutoff) {
            self.hits.pop_front();
        }
    }
}

/// In-process backend
#[derive(Default)]
pub struct MemoryStore {
    blocks: RwLock<HashMap<String, BlockEntry>>,
    violations: RwLock<HashMap<String, ViolationCounter>>,
    windows: Mutex<HashMap<String, WindowLog>>,
}

impl MemoryStore {
    async fn put_block(&self, entry: &BlockEntry) {
        let mut blocks = self.blocks.write().await;
        blocks.insert(entry.ip.clone(), entry.clone());
    }

    async fn get_block(&self, ip: &str, now_ms: i64) -> Option<BlockEntry> {
        {
            let blocks = self.blocks.read().await;
            match blocks.get(ip) {
                None => return None,
                Some(entry) if !entry.is_expired(now_ms) => return Some(entry.clone()),
                Some(_) => {}
            }
        }
        let mut blocks = self.blocks.write().await;
        if blocks.get(ip).map_or(false, |entry| entry.is_expired(now_ms)) {
            blocks.remove(ip);
        }
        None
    }

    async fn remove_block(&self, ip: &str) -> bool {
        self.blocks.write().await.remove(ip).is_some()
    }

    async fn list_blocks(&self, now_ms: i64) -> Vec<BlockEntry> {
        self.blocks
            .read()
            .await
            .values()
            .filter(|entry| !entry.is_expired(now_ms))
            .cloned()
            .collect()
    }

    async fn add_violations(&self, ip: &str, weight: u32, window_secs: u64, now_ms: i64) -> u32 {
        let mut violations = self.violations.write().await;
        let counter = violations.entry(ip.to_string()).or_insert(ViolationCounter {
            total: 0,
            expires_at_ms: now_ms + window_secs as i64 * 1000,
        });
        if counter.expires_at_ms <= now_ms {
            counter.total = 0;
            counter.expires_at_ms = now_ms + window_secs as i64 * 1000;
        }
        counter.total = counter.total.saturating_add(weight);
        counter.total
    }

    async fn clear_violations(&self, ip: &str) {
        self.violations.write().await.remove(ip);
    }

    async fn hit_window(&self, key: &str, limit: u32, window_ms: i64, now_ms: i64) -> WindowState {
        let mut windows = self.windows.lock().await;
        let log = windows.entry(key.to_string()).or_insert_with(|| WindowLog {
            window_ms,
            hits: VecDeque::new(),
        });
        log.window_ms = window_ms;
        log.evict(now_ms);

        let allowed = (log.hits.len() as u32) < limit;
        if allowed {
            log.hits.push_back(now_ms);
        }

        WindowState {
            allowed,
            count: log.hits.len() as u32,
            oldest_ms: log.hits.front().copied().unwrap_or(now_ms),
        }
    }

    async fn reset_window(&self, key: &str) -> bool {
        self.windows.lock().await.remove(key).is_some()
    }

    async fn purge_expired(&self, now_ms: i64) -> usize {
        let mut removed = 0;

        {
            let mut blocks = self.blocks.write().await;
            let before = blocks.len();
            blocks.retain(|_, entry| !entry.is_expired(now_ms));
            removed += before - blocks.len();
        }
        {
            let mut violations = self.violations.write().await;
            let before = violations.len();
            violations.retain(|_, counter| counter.expires_at_ms > now_ms);
            removed += before - violations.len();
        }
        {
            let mut windows = self.windows.lock().await;
            let before = windows.len();
            windows.retain(|_, log| {
                log.evict(now_ms);
                !log.hits.is_empty()
            });
            removed += before - windows.len();
        }

        removed
    }
}

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
  redis.call('ZADD', key, now, ARGV[4])
  redis.call('PEXPIRE', key, window)
  count = count + 1
  allowed = 1
end
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ms = now
if oldest[2] then
  oldest_ms = tonumber(oldest[2])
end
return {allowed, count, oldest_ms}
"#;

/// Redis backend
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    window_script: redis::Script,
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
            window_script: redis::Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }

    fn key(&self, kind: &str, id: &str) -> String {
        format_key(&format_key(&self.prefix, kind), id)
    }

    fn index_key(&self) -> String {
        format_key(&self.prefix, "blocked")
    }

    async fn put_block(&self, entry: &BlockEntry, now_ms: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.key("block", &entry.ip);
        let json = serde_json::to_string(entry)?;

        match entry.expires_at {
            Some(at) => {
                let ttl_ms = (at.timestamp_millis() - now_ms).max(1);
                let ttl_secs = ((ttl_ms + 999) / 1000) as usize;
                conn.set_ex::<_, _, ()>(&key, json, ttl_secs).await?;
            }
            None => conn.set::<_, _, ()>(&key, json).await?,
        }
        conn.sadd::<_, _, ()>(self.index_key(), &entry.ip).await?;
        Ok(())
    }

    async fn get_block(&self, ip: &str, now_ms: i64) -> Result<Option<BlockEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(self.key("block", ip)).await?;
        match json {
            Some(json) => {
                let entry: BlockEntry = serde_json::from_str(&json)?;
                Ok((!entry.is_expired(now_ms)).then_some(entry))
            }
            None => Ok(None),
        }
    }

    async fn remove_block(&self, ip: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: u32 = conn.del(self.key("block", ip)).await?;
        conn.srem::<_, _, ()>(self.index_key(), ip).await?;
        Ok(deleted > 0)
    }

    async fn list_blocks(&self, now_ms: i64) -> Result<Vec<BlockEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let ips: Vec<String> = conn.smembers(self.index_key()).await?;
        let mut entries = Vec::with_capacity(ips.len());

        for ip in ips {
            match self.get_block(&ip, now_ms).await? {
                Some(entry) => entries.push(entry),
                None => conn.srem::<_, _, ()>(self.index_key(), &ip).await?,
            }
        }

        Ok(entries)
    }

    async fn add_violations(&self, ip: &str, weight: u32, window_secs: u64) -> Result<u32, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.key("violations", ip);
        let total: u32 = conn.incr(&key, weight).await?;

        if total == weight {
            conn.expire::<_, ()>(&key, window_secs as usize).await?;
        }

        Ok(total)
    }

    async fn clear_violations(&self, ip: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key("violations", ip)).await?;
        Ok(())
    }

    async fn hit_window(
        &self,
        key: &str,
        limit: u32,
        window_ms: i64,
        now_ms: i64,
    ) -> Result<WindowState, StoreError> {
        let mut conn = self.conn.clone();
        let member = format!("{}-{}", now_ms, Uuid::new_v4());
        let (allowed, count, oldest_ms): (i64, i64, i64) = self
            .window_script
            .key(self.key("window", key))
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowState {
            allowed: allowed == 1,
            count: count.max(0) as u32,
            oldest_ms,
        })
    }

    async fn reset_window(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: u32 = conn.del(self.key("window", key)).await?;
        Ok(deleted > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
