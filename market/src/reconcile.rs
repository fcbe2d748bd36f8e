//! Merge of an incoming history batch into the stored source series.
//!
//! The relationship between the two leading timestamp arrays picks one of
//! four outcomes:
//!
//! 1. nothing stored, or a different timeframe: the batch replaces the series;
//! 2. the batch ends at or after the stored tail: splice at the first shared
//!    timestamp (batch bar 0 or 1), or replace when nothing is shared;
//! 3. the batch ends before the stored head: prepend, unless the gap exceeds
//!    [`MAX_BACKFILL_GAP_DAYS`];
//! 4. the batch ends inside the stored range: validate only. Matching window
//!    counts mean the data is already consistent, anything else is rejected.

use chrono::Duration;

use crate::{Bars, ReconcileError};

pub const MAX_BACKFILL_GAP_DAYS: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
	Replaced,
	Spliced,
	Prepended,
	Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Merge {
	Replaced(Bars),
	Spliced { bars: Bars, at: usize },
	Prepended(Bars),
	Unchanged,
}

impl Merge {
	pub fn kind(&self) -> MergeKind {
		match self {
			Self::Replaced(_) => MergeKind::Replaced,
			Self::Spliced { .. } => MergeKind::Spliced,
			Self::Prepended(_) => MergeKind::Prepended,
			Self::Unchanged => MergeKind::Unchanged,
		}
	}

	pub fn into_bars(self) -> Option<Bars> {
		match self {
			Self::Replaced(bars) | Self::Prepended(bars) | Self::Spliced { bars, .. } => Some(bars),
			Self::Unchanged => None,
		}
	}
}

pub fn reconcile(existing: Option<&Bars>, incoming: Bars) -> Result<Merge, ReconcileError> {
	let Some(existing) = existing.filter(|bars| !bars.is_empty()) else {
		return Ok(Merge::Replaced(incoming));
	};
	if existing.timeframe() != incoming.timeframe() {
		return Ok(Merge::Replaced(incoming));
	}
	let (Some(incoming_first), Some(incoming_last)) =
		(incoming.first_datetime(), incoming.last_datetime())
	else {
		return Ok(Merge::Unchanged);
	};
	let (Some(existing_first), Some(existing_last)) =
		(existing.first_datetime(), existing.last_datetime())
	else {
		return Ok(Merge::Replaced(incoming));
	};

	if incoming_last >= existing_last {
		let second = incoming.datetime().get(1).copied();
		let shared = existing
			.datetime()
			.iter()
			.position(|t| *t == incoming_first || Some(*t) == second);
		return match shared {
			Some(index) => {
				let at = existing.partition_point(incoming_first).min(index);
				let bars = existing.slice(0..at).concat(&incoming)?;
				Ok(Merge::Spliced { bars, at })
			}
			None => Ok(Merge::Replaced(incoming)),
		};
	}

	if incoming_last < existing_first {
		let gap = existing_first - incoming_last;
		if gap > Duration::days(MAX_BACKFILL_GAP_DAYS) {
			return Err(ReconcileError::BackfillGap {
				incoming_last,
				existing_first,
				gap,
			});
		}
		return Ok(Merge::Prepended(incoming.concat(existing)?));
	}

	let from = incoming_first.max(existing_first);
	let bounds = (
		existing.position(from),
		existing.position(incoming_last),
		incoming.position(from),
	);
	match bounds {
		(Some(existing_start), Some(existing_end), Some(incoming_start)) => {
			let existing_count = existing_end + 1 - existing_start;
			let incoming_count = incoming.len() - incoming_start;
			if existing_count == incoming_count {
				Ok(Merge::Unchanged)
			} else {
				Err(ReconcileError::OverlapMismatch {
					from,
					to: incoming_last,
					existing_count,
					incoming_count,
				})
			}
		}
		_ => Err(ReconcileError::BoundaryMissing {
			from,
			to: incoming_last,
		}),
	}
}
