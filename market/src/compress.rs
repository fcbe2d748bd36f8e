//! Timeframe compression.
//!
//! Buckets are anchored to fixed time-of-day marks (every N minutes from
//! midnight), never span two calendar days, and are stamped with the mark
//! they start at. Output depends only on the input arrays.

use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};
use tracing::debug;
use tradelink::Timeframe;

use crate::{BarRow, Bars, SeriesError};

const MINUTES_PER_DAY: u32 = 1440;

/// Relative range under which a bar counts as flat.
///
/// Prices come from decimal wire text, so a flat bar has equal high and low
/// up to float rounding, while any real move spans at least one price step.
/// Price steps are orders of magnitude coarser than this ratio, so the bound
/// absorbs rounding without needing the instrument's step.
const FLAT_RANGE_RATIO: f64 = 1e-9;

/// Open time of the `timeframe` period containing `datetime`.
pub fn period_start(datetime: NaiveDateTime, timeframe: Timeframe) -> NaiveDateTime {
	let day_start = datetime.date().and_time(NaiveTime::MIN);
	let minutes = timeframe.minutes();
	if minutes >= MINUTES_PER_DAY {
		return day_start;
	}
	let minute_of_day = datetime.time().num_seconds_from_midnight() / 60;
	day_start + Duration::minutes(i64::from(minute_of_day / minutes * minutes))
}

struct Bucket {
	row: BarRow,
	members: usize,
}

impl Bucket {
	fn open(start: NaiveDateTime, first: BarRow) -> Self {
		Self {
			row: BarRow { datetime: start, ..first },
			members: 1,
		}
	}

	fn absorb(&mut self, bar: BarRow) {
		self.row.high = self.row.high.max(bar.high);
		self.row.low = self.row.low.min(bar.low);
		self.row.close = bar.close;
		self.row.volume += bar.volume;
		self.members += 1;
	}

	/// A lone flat bar: the anomaly skipped before a day boundary.
	fn is_degenerate(&self) -> bool {
		let scale = self.row.high.abs().max(1.0);
		self.members == 1 && self.row.range().abs() <= FLAT_RANGE_RATIO * scale
	}
}

/// Resamples `bars` into `target`; a same-timeframe request returns the input.
pub fn compress(bars: &Bars, target: Timeframe) -> Result<Bars, SeriesError> {
	let base = bars.timeframe();
	if target == base {
		return Ok(bars.clone());
	}
	if target < base || !target.is_multiple_of(base) {
		return Err(SeriesError::IncompatibleTimeframe { base, target });
	}

	let mut buckets: Vec<Bucket> = Vec::new();
	for bar in bars.rows() {
		let start = period_start(bar.datetime, target);
		match buckets.last_mut() {
			Some(bucket) if bucket.row.datetime == start => bucket.absorb(bar),
			_ => buckets.push(Bucket::open(start, bar)),
		}
	}

	let mut out = Bars::with_capacity(target, buckets.len());
	for (index, bucket) in buckets.iter().enumerate() {
		let closes_session = buckets
			.get(index + 1)
			.is_some_and(|next| next.row.datetime.date() != bucket.row.datetime.date());
		if closes_session && bucket.is_degenerate() {
			debug!(datetime = %bucket.row.datetime, "skipping zero-range bucket before session boundary");
			continue;
		}
		out.push(bucket.row)?;
	}
	Ok(out)
}
