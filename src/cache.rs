//! Keyed, TTL-bounded, size-bounded response cache (spec.md 4.4).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    body: Value,
    inserted_at: Instant,
    hit_count: u64,
}

/// Canonicalize a JSON value by sorting object keys lexicographically at
/// every depth, so semantically equal parameter objects hash to the same
/// cache key regardless of field order (spec.md 4.4).
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort_unstable();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap());
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// `upstream ":" tool ":" canonical(args)` (spec.md 4.4).
pub fn cache_key(upstream: &str, tool: &str, args: &Value) -> String {
    format!("{upstream}:{tool}:{}", canonical_json(args))
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
}

/// Response cache. `get`/`set` are guarded by a single mutex; fine-grained
/// locking is not required at the target scale of a few thousand entries
/// (spec.md 5).
pub struct ResponseCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_size: usize,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_size: usize, enabled: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
            }),
            ttl,
            max_size,
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the cached body if present and not expired; `get` re-checks
    /// expiry itself because the background sweep can lag (spec.md 4.4).
    pub async fn get(&self, key: &str) -> Option<Value> {
        if !self.enabled {
            return None;
        }

        let mut guard = self.inner.lock().await;
        let expired = match guard.entries.get(key) {
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
            None => return None,
        };

        if expired {
            guard.entries.remove(key);
            return None;
        }

        let entry = guard.entries.get_mut(key).expect("checked above");
        entry.hit_count += 1;
        Some(entry.body.clone())
    }

    pub async fn set(&self, key: String, body: Value) {
        if !self.enabled {
            return;
        }

        let mut guard = self.inner.lock().await;
        if guard.entries.len() >= self.max_size && !guard.entries.contains_key(&key) {
            evict_one(&mut guard.entries);
        }
        guard.entries.insert(
            key,
            CacheEntry {
                body,
                inserted_at: Instant::now(),
                hit_count: 0,
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Remove every entry whose key's `upstream:tool` prefix matches the
    /// given filters. No filter clears everything. Returns removed count.
    pub async fn invalidate(&self, upstream: Option<&str>, tool: Option<&str>) -> usize {
        let mut guard = self.inner.lock().await;
        if upstream.is_none() && tool.is_none() {
            let count = guard.entries.len();
            guard.entries.clear();
            return count;
        }

        let before = guard.entries.len();
        guard.entries.retain(|key, _| {
            let mut parts = key.splitn(3, ':');
            let entry_upstream = parts.next().unwrap_or("");
            let entry_tool = parts.next().unwrap_or("");
            let upstream_matches = upstream.map_or(true, |u| u == entry_upstream);
            let tool_matches = tool.map_or(true, |t| t == entry_tool);
            !(upstream_matches && tool_matches)
        });
        before - guard.entries.len()
    }

    /// Remove every entry whose age exceeds `ttl`. Best-effort; `get` must
    /// still check expiry independently because sweeps can lag (spec.md 4.4).
    async fn sweep_expired(&self) -> usize {
        let mut guard = self.inner.lock().await;
        let before = guard.entries.len();
        guard
            .entries
            .retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
        before - guard.entries.len()
    }

    /// Run the periodic sweep forever at `max(ttl/2, 60s)` (spec.md 4.4).
    /// Intended to be spawned once as a background task.
    pub async fn run_sweep_loop(self: std::sync::Arc<Self>) {
        let interval = self.ttl.max(Duration::from_secs(120)) / 2;
        let interval = interval.max(Duration::from_secs(60));
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = self.sweep_expired().await;
            if removed > 0 {
                debug!(removed, "cache sweep removed expired entries");
            }
        }
    }
}

/// Evict the entry minimizing `insertedAt / (hitCount + 1)` (spec.md 4.4).
/// `Instant` carries no absolute epoch to divide directly, but age
/// (`elapsed()`) ranks entries identically to `insertedAt` in reverse, so
/// the entry to drop is the one maximizing `elapsed / (hitCount + 1)`: the
/// oldest, least-popular entry. Eviction order beyond that is
/// implementation-defined (spec.md 9).
fn evict_one(entries: &mut HashMap<String, CacheEntry>) {
    let victim = entries
        .iter()
        .max_by(|(_, a), (_, b)| {
            let score_a = a.inserted_at.elapsed().as_secs_f64() / (a.hit_count as f64 + 1.0);
            let score_b = b.inserted_at.elapsed().as_secs_f64() / (b.hit_count as f64 + 1.0);
            score_a
                .partial_cmp(&score_b)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(key, _)| key.clone());

    if let Some(key) = victim {
        entries.remove(&key);
    }
}
