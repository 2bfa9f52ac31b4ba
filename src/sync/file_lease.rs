//! Leases kept as files in a data directory.
//!
//! Every process pointed at the same directory sees the same leases. A lease file is published
//! by hard-linking a fully written temporary file into place, which fails atomically when the
//! lease file already exists. Expired or unreadable lease files, and leases being released, are
//! first moved aside under a unique name and only removed if the moved content is the content
//! that was inspected; anything else is linked back.

use super::lease::{Lease, LeaseError, LeaseService, new_holder_token};
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const LEASE_DIR: &str = "leases";

pub struct FileLeaseService {
	data_dir: PathBuf,
}

impl FileLeaseService {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}

	fn lease_dir(&self) -> PathBuf {
		self.data_dir.join(LEASE_DIR)
	}

	fn lease_path(&self, key: &str) -> PathBuf {
		self.lease_dir().join(format!("{}.json", key))
	}

	async fn ensure_lease_dir(&self) -> Result<(), LeaseError> {
		if !tokio::fs::try_exists(&self.data_dir).await.unwrap_or(false) {
			return Err(LeaseError::Unavailable(format!(
				"Data directory {:?} does not exist",
				self.data_dir
			)));
		}
		let lease_dir = self.lease_dir();
		tokio::fs::create_dir_all(&lease_dir)
			.await
			.map_err(|e| io_error("create lease directory", &lease_dir, e))
	}
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> LeaseError {
	LeaseError::Unavailable(format!("Failed to {} {:?}: {}", action, path, e))
}

fn parse(content: &str) -> Option<Lease> {
	serde_json::from_str(content).ok()
}

async fn read_lease_file(path: &Path) -> Result<Option<String>, LeaseError> {
	match tokio::fs::read_to_string(path).await {
		Ok(content) => Ok(Some(content)),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
		Err(e) => Err(io_error("read lease file", path, e)),
	}
}

/// Publish `lease` at `path` unless a lease file is already there. Returns whether it was published.
async fn create_lease_file(path: &Path, lease: &Lease) -> Result<bool, LeaseError> {
	let content = serde_json::to_string(lease)
		.map_err(|e| LeaseError::Unavailable(format!("Failed to serialize lease: {}", e)))?;
	let temp = path.with_extension(format!("{}.tmp", lease.holder_token));
	tokio::fs::write(&temp, content)
		.await
		.map_err(|e| io_error("write lease file", &temp, e))?;

	let linked = tokio::fs::hard_link(&temp, path).await;
	if let Err(e) = tokio::fs::remove_file(&temp).await {
		debug!("Failed to remove {:?}: {}", temp, e);
	}

	match linked {
		Ok(()) => Ok(true),
		Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
		Err(e) => Err(io_error("create lease file", path, e)),
	}
}

/// Remove the lease file at `path` if it still holds `observed`. Returns whether it was removed.
async fn remove_if_unchanged(path: &Path, observed: &str) -> Result<bool, LeaseError> {
	let aside = path.with_extension(format!("{}.stale", new_holder_token()));
	match tokio::fs::rename(path, &aside).await {
		Ok(()) => {}
		Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
		Err(e) => return Err(io_error("move lease file", path, e)),
	}

	let unchanged = read_lease_file(&aside).await?.as_deref() == Some(observed);
	if !unchanged {
		// a lease taken in the meantime; restore it unless the key was taken again since
		match tokio::fs::hard_link(&aside, path).await {
			Ok(()) => {}
			Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
			Err(e) => warn!("Failed to restore lease file {:?}: {}", path, e),
		}
	}
	tokio::fs::remove_file(&aside)
		.await
		.map_err(|e| io_error("remove lease file", &aside, e))?;

	Ok(unchanged)
}

#[async_trait::async_trait]
impl LeaseService for FileLeaseService {
	async fn try_acquire(
		&self,
		key: &str,
		holder_token: &str,
		ttl: Duration,
	) -> Result<Option<Lease>, LeaseError> {
		self.ensure_lease_dir().await?;
		let path = self.lease_path(key);
		let lease = Lease::starting_now(key, holder_token, ttl);

		// a second attempt covers a lease file that disappeared between create and read
		for _ in 0..2 {
			if create_lease_file(&path, &lease).await? {
				debug!("Acquired lease {} until {}", key, lease.expires_at);
				return Ok(Some(lease));
			}

			let Some(content) = read_lease_file(&path).await? else {
				continue;
			};
			match parse(&content) {
				Some(existing) if !existing.is_expired_at(Utc::now()) => return Ok(None),
				Some(existing) => debug!("Taking over lease {} expired at {}", key, existing.expires_at),
				None => warn!("Replacing unreadable lease file {:?}", path),
			}
			if !remove_if_unchanged(&path, &content).await? {
				return Ok(None);
			}
		}

		Ok(None)
	}

	async fn release(&self, lease: &Lease) -> Result<bool, LeaseError> {
		let path = self.lease_path(&lease.key);
		let Some(content) = read_lease_file(&path).await? else {
			return Ok(false);
		};

		match parse(&content) {
			Some(existing) if existing.holder_token == lease.holder_token => {
				remove_if_unchanged(&path, &content).await
			}
			_ => Ok(false),
		}
	}

	async fn current(&self, key: &str) -> Result<Option<Lease>, LeaseError> {
		let now = Utc::now();
		Ok(read_lease_file(&self.lease_path(key))
			.await?
			.as_deref()
			.and_then(parse)
			.filter(|lease| !lease.is_expired_at(now)))
	}
}
