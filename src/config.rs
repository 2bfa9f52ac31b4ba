//! Indexer configuration.
//!
//! Every field has a default, so a JSON config file only needs the values it overrides. The CLI
//! layers its flags and environment variables on top.

use crate::sync::LeaseWait;
use crate::trace::{ClassifierConfig, TraceMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
	/// JSON-RPC endpoint serving esplora and alkanes calls.
	pub rpc_url: String,
	/// Address whose history carries the wraps and unwraps.
	pub tracked_address: String,
	/// Directory of the file store. `None` keeps the store in memory.
	pub data_dir: Option<PathBuf>,
	pub trace_mode: TraceMode,
	/// Hard cap on history pages fetched per run.
	pub max_pagination_rounds: u32,
	pub classifier: ClassifierConfig,
	pub lease: LeaseConfig,
	pub cache: CacheConfig,
	/// Seconds between runs in watch mode.
	pub watch_interval_secs: u64,
}

impl Default for IndexerConfig {
	fn default() -> Self {
		Self {
			rpc_url: "http://localhost:18888".to_string(),
			tracked_address: String::new(),
			data_dir: None,
			trace_mode: TraceMode::Auto,
			max_pagination_rounds: 200,
			classifier: ClassifierConfig::default(),
			lease: LeaseConfig::default(),
			cache: CacheConfig::default(),
			watch_interval_secs: 60,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
	pub ttl_secs: u64,
	/// Zero means runs never wait for a held lease.
	pub max_wait_secs: u64,
	pub poll_interval_millis: u64,
}

impl Default for LeaseConfig {
	fn default() -> Self {
		Self {
			ttl_secs: 600,
			max_wait_secs: 30,
			poll_interval_millis: 500,
		}
	}
}

impl LeaseConfig {
	pub fn ttl(&self) -> Duration {
		Duration::from_secs(self.ttl_secs)
	}

	pub fn wait(&self) -> LeaseWait {
		if self.max_wait_secs == 0 {
			LeaseWait::NoWait
		} else {
			LeaseWait::Bounded {
				max_wait: Duration::from_secs(self.max_wait_secs),
				poll_interval: Duration::from_millis(self.poll_interval_millis),
			}
		}
	}
}

/// Read-path cache TTLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
	pub totals_ttl_secs: u64,
	pub records_ttl_secs: u64,
	pub snapshots_ttl_secs: u64,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self {
			totals_ttl_secs: 30,
			records_ttl_secs: 60,
			snapshots_ttl_secs: 120,
		}
	}
}

impl CacheConfig {
	pub fn totals_ttl(&self) -> Duration {
		Duration::from_secs(self.totals_ttl_secs)
	}

	pub fn records_ttl(&self) -> Duration {
		Duration::from_secs(self.records_ttl_secs)
	}

	pub fn snapshots_ttl(&self) -> Duration {
		Duration::from_secs(self.snapshots_ttl_secs)
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Invalid configuration: {0}")]
	Invalid(String),
}

impl IndexerConfig {
	pub async fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
		let content = tokio::fs::read_to_string(path).await?;
		Ok(serde_json::from_str(&content)?)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.rpc_url.trim().is_empty() {
			return Err(ConfigError::Invalid("rpc_url is empty".to_string()));
		}
		if self.tracked_address.trim().is_empty() {
			return Err(ConfigError::Invalid("tracked_address is empty".to_string()));
		}
		if self.max_pagination_rounds == 0 {
			return Err(ConfigError::Invalid(
				"max_pagination_rounds must be at least 1".to_string(),
			));
		}
		if self.lease.ttl_secs == 0 {
			return Err(ConfigError::Invalid("lease ttl must be positive".to_string()));
		}
		if self.lease.max_wait_secs > 0 && self.lease.poll_interval_millis == 0 {
			return Err(ConfigError::Invalid(
				"lease poll interval must be positive".to_string(),
			));
		}
		if self.classifier.tracked_token == self.classifier.null_id {
			return Err(ConfigError::Invalid(format!(
				"tracked token {} is the null id",
				self.classifier.tracked_token
			)));
		}
		Ok(())
	}
}
