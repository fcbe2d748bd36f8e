//! OHLCV series stored as parallel arrays.
//!
//! - `BarRow`: one bar, used for reading rows and feeding mutations.
//! - `Bars`: six equally long arrays plus a timeframe. Fields are private so
//!   every mutation goes through a method that touches all arrays together and
//!   keeps `datetime` strictly increasing.

use std::ops::Range;

use chrono::NaiveDateTime;
use tradelink::Timeframe;

use crate::SeriesError;

/// One OHLCV bar; `datetime` is the bar open time in exchange-local time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarRow {
	pub datetime: NaiveDateTime,
	pub open: f64,
	pub high: f64,
	pub low: f64,
	pub close: f64,
	pub volume: f64,
}

impl BarRow {
	pub fn new(datetime: NaiveDateTime, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
		Self {
			datetime,
			open,
			high,
			low,
			close,
			volume,
		}
	}

	/// A bar opened by a single print.
	pub fn flat(datetime: NaiveDateTime, price: f64, volume: f64) -> Self {
		Self::new(datetime, price, price, price, price, volume)
	}

	pub fn range(&self) -> f64 {
		self.high - self.low
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bars {
	timeframe: Timeframe,
	datetime: Vec<NaiveDateTime>,
	open: Vec<f64>,
	high: Vec<f64>,
	low: Vec<f64>,
	close: Vec<f64>,
	volume: Vec<f64>,
}

impl Bars {
	pub fn new(timeframe: Timeframe) -> Self {
		Self::with_capacity(timeframe, 0)
	}

	pub fn with_capacity(timeframe: Timeframe, capacity: usize) -> Self {
		Self {
			timeframe,
			datetime: Vec::with_capacity(capacity),
			open: Vec::with_capacity(capacity),
			high: Vec::with_capacity(capacity),
			low: Vec::with_capacity(capacity),
			close: Vec::with_capacity(capacity),
			volume: Vec::with_capacity(capacity),
		}
	}

	/// Builds a series from rows that must already be in strictly increasing order.
	pub fn from_rows(
		timeframe: Timeframe,
		rows: impl IntoIterator<Item = BarRow>,
	) -> Result<Self, SeriesError> {
		let rows = rows.into_iter();
		let mut bars = Self::with_capacity(timeframe, rows.size_hint().0);
		for row in rows {
			bars.push(row)?;
		}
		Ok(bars)
	}

	pub fn timeframe(&self) -> Timeframe {
		self.timeframe
	}

	pub fn len(&self) -> usize {
		self.datetime.len()
	}

	pub fn is_empty(&self) -> bool {
		self.datetime.is_empty()
	}

	pub fn datetime(&self) -> &[NaiveDateTime] {
		&self.datetime
	}

	pub fn open(&self) -> &[f64] {
		&self.open
	}

	pub fn high(&self) -> &[f64] {
		&self.high
	}

	pub fn low(&self) -> &[f64] {
		&self.low
	}

	pub fn close(&self) -> &[f64] {
		&self.close
	}

	pub fn volume(&self) -> &[f64] {
		&self.volume
	}

	pub fn first_datetime(&self) -> Option<NaiveDateTime> {
		self.datetime.first().copied()
	}

	pub fn last_datetime(&self) -> Option<NaiveDateTime> {
		self.datetime.last().copied()
	}

	pub fn row(&self, index: usize) -> Option<BarRow> {
		Some(BarRow {
			datetime: *self.datetime.get(index)?,
			open: *self.open.get(index)?,
			high: *self.high.get(index)?,
			low: *self.low.get(index)?,
			close: *self.close.get(index)?,
			volume: *self.volume.get(index)?,
		})
	}

	pub fn last(&self) -> Option<BarRow> {
		self.len().checked_sub(1).and_then(|index| self.row(index))
	}

	pub fn rows(&self) -> impl Iterator<Item = BarRow> + '_ {
		(0..self.len()).filter_map(|index| self.row(index))
	}

	/// Index of the bar opened exactly at `datetime`.
	pub fn position(&self, datetime: NaiveDateTime) -> Option<usize> {
		self.datetime.binary_search(&datetime).ok()
	}

	/// Index of the first bar opened at or after `datetime`.
	pub fn partition_point(&self, datetime: NaiveDateTime) -> usize {
		self.datetime.partition_point(|x| *x < datetime)
	}

	pub fn push(&mut self, row: BarRow) -> Result<(), SeriesError> {
		if let Some(previous) = self.last_datetime() {
			if row.datetime <= previous {
				return Err(SeriesError::NonIncreasing {
					previous,
					next: row.datetime,
				});
			}
		}
		self.datetime.push(row.datetime);
		self.open.push(row.open);
		self.high.push(row.high);
		self.low.push(row.low);
		self.close.push(row.close);
		self.volume.push(row.volume);
		Ok(())
	}

	/// Rewrites the last bar in place; the row must carry the same open time.
	pub fn update_last(&mut self, row: BarRow) -> Result<(), SeriesError> {
		let index = self.len().checked_sub(1).ok_or(SeriesError::Empty)?;
		if self.datetime[index] != row.datetime {
			return Err(SeriesError::NonIncreasing {
				previous: self.datetime[index],
				next: row.datetime,
			});
		}
		self.open[index] = row.open;
		self.high[index] = row.high;
		self.low[index] = row.low;
		self.close[index] = row.close;
		self.volume[index] = row.volume;
		Ok(())
	}

	pub fn slice(&self, range: Range<usize>) -> Bars {
		let end = range.end.min(self.len());
		let start = range.start.min(end);
		Bars {
			timeframe: self.timeframe,
			datetime: self.datetime[start..end].to_vec(),
			open: self.open[start..end].to_vec(),
			high: self.high[start..end].to_vec(),
			low: self.low[start..end].to_vec(),
			close: self.close[start..end].to_vec(),
			volume: self.volume[start..end].to_vec(),
		}
	}

	/// `self ++ tail`; `tail` must be of the same timeframe and strictly later.
	pub fn concat(&self, tail: &Bars) -> Result<Bars, SeriesError> {
		if self.timeframe != tail.timeframe {
			return Err(SeriesError::TimeframeMismatch {
				expected: self.timeframe,
				actual: tail.timeframe,
			});
		}
		let mut joined = Bars::with_capacity(self.timeframe, self.len() + tail.len());
		for row in self.rows().chain(tail.rows()) {
			joined.push(row)?;
		}
		Ok(joined)
	}

	/// Drops the oldest bars so at most `keep` remain.
	pub fn trim_front(&mut self, keep: usize) {
		let excess = self.len().saturating_sub(keep);
		if excess == 0 {
			return;
		}
		self.datetime.drain(..excess);
		self.open.drain(..excess);
		self.high.drain(..excess);
		self.low.drain(..excess);
		self.close.drain(..excess);
		self.volume.drain(..excess);
	}
}

#[cfg(test)]
mod tests {
	use chrono::{Duration, NaiveDate, NaiveDateTime};
	use tradelink::Timeframe;

	use super::{BarRow, Bars};
	use crate::SeriesError;

	fn at(minute: i64) -> NaiveDateTime {
		NaiveDate::from_ymd_opt(2024, 5, 6)
			.and_then(|d| d.and_hms_opt(10, 0, 0))
			.expect("valid datetime")
			+ Duration::minutes(minute)
	}

	#[test]
	fn push_rejects_non_increasing_rows_and_keeps_arrays_aligned() {
		let mut bars = Bars::new(Timeframe::M1);
		bars.push(BarRow::flat(at(0), 10.0, 1.0)).expect("first push");
		bars.push(BarRow::flat(at(1), 11.0, 2.0)).expect("second push");

		let err = bars.push(BarRow::flat(at(1), 12.0, 3.0)).unwrap_err();
		assert!(matches!(err, SeriesError::NonIncreasing { .. }));
		assert_eq!(bars.len(), 2);
		assert_eq!(bars.open().len(), 2);
		assert_eq!(bars.volume().len(), 2);
	}

	#[test]
	fn trim_front_keeps_latest_bars() {
		let mut bars =
			Bars::from_rows(Timeframe::M1, (0..10).map(|m| BarRow::flat(at(m), m as f64, 1.0)))
				.expect("valid rows");
		bars.trim_front(3);
		assert_eq!(bars.len(), 3);
		assert_eq!(bars.first_datetime(), Some(at(7)));
		assert_eq!(bars.close(), &[7.0, 8.0, 9.0]);
	}

	#[test]
	fn update_last_requires_same_open_time() {
		let mut bars = Bars::new(Timeframe::M1);
		assert_eq!(
			bars.update_last(BarRow::flat(at(0), 1.0, 1.0)),
			Err(SeriesError::Empty)
		);
		bars.push(BarRow::flat(at(0), 1.0, 1.0)).expect("push");
		bars.update_last(BarRow::new(at(0), 1.0, 2.0, 0.5, 1.5, 4.0))
			.expect("same open time");
		assert_eq!(bars.last().map(|r| r.high), Some(2.0));
		assert!(bars.update_last(BarRow::flat(at(1), 1.0, 1.0)).is_err());
	}
}
