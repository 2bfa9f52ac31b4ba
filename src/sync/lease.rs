//! Run leases.
//!
//! A lease is taken with a single atomic "set if absent, with TTL" and released with a
//! compare-and-delete on the holder token, so a holder whose lease expired can never release a
//! lease taken over by someone else.

use backoff::ExponentialBackoffBuilder;
use backoff::future::retry;
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Umbrella lease held while every stream is synced in sequence.
pub const FULL_SYNC_LEASE: &str = "full-sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
	pub key: String,
	pub holder_token: String,
	pub expires_at: DateTime<Utc>,
}

impl Lease {
	/// A lease on `key` for `holder_token`, expiring `ttl` from now.
	pub fn starting_now(key: &str, holder_token: &str, ttl: Duration) -> Self {
		let expires_at = TimeDelta::from_std(ttl)
			.ok()
			.and_then(|ttl| Utc::now().checked_add_signed(ttl))
			.unwrap_or(DateTime::<Utc>::MAX_UTC);
		Self {
			key: key.to_string(),
			holder_token: holder_token.to_string(),
			expires_at,
		}
	}

	pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
		self.expires_at <= now
	}
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
	#[error("lease service unavailable: {0}")]
	Unavailable(String),
}

#[async_trait::async_trait]
pub trait LeaseService: Send + Sync {
	/// Take `key` for `holder_token` unless another holder has an unexpired lease on it.
	///
	/// Returns `None` when the key is held.
	async fn try_acquire(
		&self,
		key: &str,
		holder_token: &str,
		ttl: Duration,
	) -> Result<Option<Lease>, LeaseError>;

	/// Delete the lease if it is still held by `lease.holder_token`.
	async fn release(&self, lease: &Lease) -> Result<bool, LeaseError>;

	/// The unexpired lease on `key`, if any.
	async fn current(&self, key: &str) -> Result<Option<Lease>, LeaseError>;
}

/// Random hex token identifying one lease holder.
pub fn new_holder_token() -> String {
	let mut bytes = [0u8; 16];
	rand::rng().fill(&mut bytes);
	hex::encode(bytes)
}

/// How long to wait for a held lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseWait {
	NoWait,
	/// Poll with exponential backoff starting at `poll_interval`, for at most `max_wait`.
	Bounded {
		max_wait: Duration,
		poll_interval: Duration,
	},
}

enum AcquireError {
	Held,
	Service(LeaseError),
}

/// Acquire `key` with a fresh holder token. `Ok(None)` means the lease is held elsewhere.
pub async fn acquire(
	service: &dyn LeaseService,
	key: &str,
	ttl: Duration,
	wait: LeaseWait,
) -> Result<Option<Lease>, LeaseError> {
	let holder_token = new_holder_token();

	let (max_wait, poll_interval) = match wait {
		LeaseWait::NoWait => return service.try_acquire(key, &holder_token, ttl).await,
		LeaseWait::Bounded {
			max_wait,
			poll_interval,
		} => (max_wait, poll_interval),
	};

	let backoff = ExponentialBackoffBuilder::new()
		.with_initial_interval(poll_interval)
		.with_max_interval(max_wait.max(poll_interval))
		.with_max_elapsed_time(Some(max_wait))
		.build();

	let result = retry(backoff, || async {
		match service.try_acquire(key, &holder_token, ttl).await {
			Ok(Some(lease)) => Ok(lease),
			Ok(None) => {
				debug!("Lease {} is held, waiting", key);
				Err(backoff::Error::transient(AcquireError::Held))
			}
			Err(e) => Err(backoff::Error::permanent(AcquireError::Service(e))),
		}
	})
	.await;

	match result {
		Ok(lease) => Ok(Some(lease)),
		Err(AcquireError::Held) => Ok(None),
		Err(AcquireError::Service(e)) => Err(e),
	}
}

/// In-process lease table.
#[derive(Debug, Default)]
pub struct MemoryLeaseService {
	leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLeaseService {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl LeaseService for MemoryLeaseService {
	async fn try_acquire(
		&self,
		key: &str,
		holder_token: &str,
		ttl: Duration,
	) -> Result<Option<Lease>, LeaseError> {
		let mut leases = self.leases.lock().await;

		if leases
			.get(key)
			.is_some_and(|existing| !existing.is_expired_at(Utc::now()))
		{
			return Ok(None);
		}

		let lease = Lease::starting_now(key, holder_token, ttl);
		leases.insert(key.to_string(), lease.clone());
		Ok(Some(lease))
	}

	async fn release(&self, lease: &Lease) -> Result<bool, LeaseError> {
		let mut leases = self.leases.lock().await;
		match leases.get(&lease.key) {
			Some(existing) if existing.holder_token == lease.holder_token => {
				leases.remove(&lease.key);
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	async fn current(&self, key: &str) -> Result<Option<Lease>, LeaseError> {
		let now = Utc::now();
		Ok(self
			.leases
			.lock()
			.await
			.get(key)
			.filter(|lease| !lease.is_expired_at(now))
			.cloned())
	}
}
