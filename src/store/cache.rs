use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Key/value cache with per-entry expiry.
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
	async fn get(&self, key: &str) -> Option<String>;

	async fn set(&self, key: &str, value: String, ttl: Duration);

	/// Remove `key`. Returns whether a live entry was removed.
	async fn del(&self, key: &str) -> bool;

	/// Remove every entry. Returns the number of live entries removed.
	async fn clear(&self) -> usize;
}

/// Read a cached JSON value. Entries that fail to parse are treated as misses.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
	let raw = cache.get(key).await?;
	match serde_json::from_str(&raw) {
		Ok(value) => Some(value),
		Err(e) => {
			debug!("Ignoring unreadable cache entry {}: {}", key, e);
			None
		}
	}
}

pub async fn set_json<T: Serialize>(cache: &dyn Cache, key: &str, value: &T, ttl: Duration) {
	match serde_json::to_string(value) {
		Ok(raw) => cache.set(key, raw, ttl).await,
		Err(e) => debug!("Not caching {}: {}", key, e),
	}
}

struct Entry {
	value: String,
	expires_at: Instant,
}

impl Entry {
	fn is_live(&self, now: Instant) -> bool {
		self.expires_at > now
	}
}

/// In-process cache. Expired entries are dropped when read and on every write.
#[derive(Default)]
pub struct MemoryCache {
	entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl Cache for MemoryCache {
	async fn get(&self, key: &str) -> Option<String> {
		let mut entries = self.entries.lock().await;
		match entries.get(key) {
			Some(entry) if entry.is_live(Instant::now()) => Some(entry.value.clone()),
			Some(_) => {
				entries.remove(key);
				None
			}
			None => None,
		}
	}

	async fn set(&self, key: &str, value: String, ttl: Duration) {
		let now = Instant::now();
		let mut entries = self.entries.lock().await;
		entries.retain(|_, entry| entry.is_live(now));
		entries.insert(
			key.to_string(),
			Entry {
				value,
				expires_at: now + ttl,
			},
		);
	}

	async fn del(&self, key: &str) -> bool {
		self.entries
			.lock()
			.await
			.remove(key)
			.is_some_and(|entry| entry.is_live(Instant::now()))
	}

	async fn clear(&self) -> usize {
		let now = Instant::now();
		let mut entries = self.entries.lock().await;
		let live = entries.values().filter(|entry| entry.is_live(now)).count();
		entries.clear();
		live
	}
}
