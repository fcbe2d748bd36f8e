//! Error types for the time-series store.

use chrono::{Duration, NaiveDateTime};
use thiserror::Error;
use tradelink::Timeframe;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SeriesError {
	#[error("bar at {next} does not follow {previous}")]
	NonIncreasing {
		previous: NaiveDateTime,
		next: NaiveDateTime,
	},
	#[error("timeframe mismatch: expected {expected}, got {actual}")]
	TimeframeMismatch {
		expected: Timeframe,
		actual: Timeframe,
	},
	#[error("cannot derive {target} bars from {base} bars")]
	IncompatibleTimeframe {
		base: Timeframe,
		target: Timeframe,
	},
	#[error("series is empty")]
	Empty,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReconcileError {
	#[error(
		"backfill ending {incoming_last} is {} hours before series start {existing_first}",
		.gap.num_hours()
	)]
	BackfillGap {
		incoming_last: NaiveDateTime,
		existing_first: NaiveDateTime,
		gap: Duration,
	},
	#[error(
		"overlap {from}..={to} holds {existing_count} stored bars but {incoming_count} incoming bars"
	)]
	OverlapMismatch {
		from: NaiveDateTime,
		to: NaiveDateTime,
		existing_count: usize,
		incoming_count: usize,
	},
	#[error("overlap {from}..={to} has no matching boundary bars")]
	BoundaryMissing {
		from: NaiveDateTime,
		to: NaiveDateTime,
	},
	#[error(transparent)]
	Series(#[from] SeriesError),
}
