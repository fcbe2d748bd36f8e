//! Series event fan-out.
//!
//! Channels are keyed by lowercase seccode and spread over shards so that
//! publishers for different instruments do not contend on one lock.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::NaiveDateTime;
use tokio::sync::broadcast;

use crate::reconcile::MergeKind;

#[derive(Debug, Clone, PartialEq)]
pub enum SeriesEvent {
	Reconciled {
		seccode: String,
		merge: MergeKind,
		len: usize,
	},
	Rejected {
		seccode: String,
		reason: String,
	},
	BarOpened {
		seccode: String,
		opened_at: NaiveDateTime,
	},
}

impl SeriesEvent {
	pub fn seccode(&self) -> &str {
		match self {
			Self::Reconciled { seccode, .. }
			| Self::Rejected { seccode, .. }
			| Self::BarOpened { seccode, .. } => seccode,
		}
	}
}

type Shard = RwLock<HashMap<String, Arc<broadcast::Sender<SeriesEvent>>>>;

#[derive(Debug)]
pub struct Distributor {
	shards: Vec<Shard>,
	channel_capacity: usize,
}

impl Default for Distributor {
	fn default() -> Self {
		Self::new(256)
	}
}

impl Distributor {
	pub fn new(channel_capacity: usize) -> Self {
		let shard_count = default_shard_count();
		let shards = (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect();
		Self {
			shards,
			channel_capacity: channel_capacity.max(1),
		}
	}

	pub fn subscribe(&self, seccode: &str) -> broadcast::Receiver<SeriesEvent> {
		let key = channel_key(seccode);
		let mut guard = self.shard(&key).write().unwrap_or_else(PoisonError::into_inner);
		guard
			.entry(key)
			.or_insert_with(|| {
				let (tx, _) = broadcast::channel(self.channel_capacity);
				Arc::new(tx)
			})
			.subscribe()
	}

	/// Sends `event` to its instrument channel and returns the receiver count.
	pub fn publish(&self, event: SeriesEvent) -> usize {
		let key = channel_key(event.seccode());
		let guard = self.shard(&key).read().unwrap_or_else(PoisonError::into_inner);
		match guard.get(&key) {
			Some(sender) => {
				let _ = sender.send(event);
				sender.receiver_count()
			}
			None => 0,
		}
	}

	pub fn subscriber_count(&self, seccode: &str) -> usize {
		let key = channel_key(seccode);
		let guard = self.shard(&key).read().unwrap_or_else(PoisonError::into_inner);
		guard.get(&key).map_or(0, |sender| sender.receiver_count())
	}

	pub fn active_channels(&self) -> Vec<String> {
		let mut active = Vec::new();
		for shard in &self.shards {
			let guard = shard.read().unwrap_or_else(PoisonError::into_inner);
			active.extend(
				guard
					.iter()
					.filter(|(_, sender)| sender.receiver_count() > 0)
					.map(|(key, _)| key.clone()),
			);
		}
		active
	}

	fn shard(&self, key: &str) -> &Shard {
		let mut hasher = std::collections::hash_map::DefaultHasher::new();
		key.hash(&mut hasher);
		&self.shards[hasher.finish() as usize % self.shards.len()]
	}
}

fn channel_key(seccode: &str) -> String {
	seccode.to_ascii_lowercase()
}

fn default_shard_count() -> usize {
	let cpu = std::thread::available_parallelism()
		.map(|x| x.get())
		.unwrap_or(8);
	cpu.saturating_mul(2).clamp(8, 128)
}
