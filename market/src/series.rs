//! Per-instrument pair of series: `source` as received from the broker and
//! `bars` at the working timeframe.
//!
//! Readers get `Arc<Bars>` snapshots. When both timeframes agree the two
//! handles point at the same allocation.

use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::debug;
use tradelink::Timeframe;

use crate::compress::{compress, period_start};
use crate::reconcile::{reconcile, MergeKind};
use crate::{BarRow, Bars, ReconcileError, SeriesError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesConfig {
	pub working_timeframe: Timeframe,
	/// Oldest source bars beyond this count are dropped after each merge.
	pub max_bars: Option<usize>,
}

impl Default for SeriesConfig {
	fn default() -> Self {
		Self {
			working_timeframe: Timeframe::M5,
			max_bars: None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct SeriesSnapshot {
	pub source: Arc<Bars>,
	pub bars: Arc<Bars>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveUpdate {
	/// The print or kline landed inside the current bar.
	Extended,
	/// A new bar was started; `closed` is the bar that preceded it.
	Opened {
		closed: Option<BarRow>,
		opened_at: NaiveDateTime,
	},
	Ignored,
}

#[derive(Debug, Clone)]
pub struct InstrumentSeries {
	seccode: String,
	config: SeriesConfig,
	source: Option<Arc<Bars>>,
	bars: Option<Arc<Bars>>,
}

impl InstrumentSeries {
	pub fn new(seccode: impl Into<String>, config: SeriesConfig) -> Self {
		Self {
			seccode: seccode.into(),
			config,
			source: None,
			bars: None,
		}
	}

	pub fn seccode(&self) -> &str {
		&self.seccode
	}

	pub fn working_timeframe(&self) -> Timeframe {
		self.config.working_timeframe
	}

	pub fn source(&self) -> Option<Arc<Bars>> {
		self.source.clone()
	}

	pub fn bars(&self) -> Option<Arc<Bars>> {
		self.bars.clone()
	}

	pub fn snapshot(&self) -> Option<SeriesSnapshot> {
		Some(SeriesSnapshot {
			source: self.source.clone()?,
			bars: self.bars.clone()?,
		})
	}

	/// Reconciles a history batch. State is only replaced once both the new
	/// source and the derived series were computed.
	pub fn merge_history(&mut self, incoming: Bars) -> Result<MergeKind, ReconcileError> {
		let merge = reconcile(self.source.as_deref(), incoming)?;
		let kind = merge.kind();
		let Some(mut source) = merge.into_bars() else {
			return Ok(kind);
		};
		if let Some(max_bars) = self.config.max_bars {
			source.trim_front(max_bars);
		}
		let source = Arc::new(source);
		let bars = derive(self.config.working_timeframe, &source)?;
		debug!(
			seccode = %self.seccode,
			merge = ?kind,
			source_len = source.len(),
			bars_len = bars.len(),
			"history reconciled"
		);
		self.source = Some(source);
		self.bars = Some(bars);
		Ok(kind)
	}

	/// Folds a trade print into the last source bar, or opens the next one.
	pub fn apply_tick(
		&mut self,
		datetime: NaiveDateTime,
		price: f64,
		quantity: f64,
	) -> Result<LiveUpdate, SeriesError> {
		let Some(source) = self.source.as_mut() else {
			return Ok(LiveUpdate::Ignored);
		};
		let Some(last) = source.last() else {
			return Ok(LiveUpdate::Ignored);
		};
		if datetime < last.datetime {
			return Ok(LiveUpdate::Ignored);
		}

		let timeframe = source.timeframe();
		let span_end = last.datetime + timeframe.duration();
		// Release the alias first so make_mut does not copy the arrays.
		self.bars = None;
		let series = Arc::make_mut(source);
		let update = if datetime < span_end {
			series.update_last(BarRow {
				high: last.high.max(price),
				low: last.low.min(price),
				close: price,
				volume: last.volume + quantity,
				..last
			})?;
			LiveUpdate::Extended
		} else {
			let opened_at = period_start(datetime, timeframe).max(span_end);
			series.push(BarRow::flat(opened_at, price, quantity))?;
			LiveUpdate::Opened {
				closed: Some(last),
				opened_at,
			}
		};
		self.bars = Some(derive(self.config.working_timeframe, source)?);
		Ok(update)
	}

	/// Applies a streamed bar: same open time replaces the last bar, a later
	/// one is appended. Older bars and other timeframes are ignored.
	pub fn upsert_last(&mut self, timeframe: Timeframe, row: BarRow) -> Result<LiveUpdate, SeriesError> {
		let Some(source) = self.source.as_mut() else {
			return Ok(LiveUpdate::Ignored);
		};
		if source.timeframe() != timeframe {
			debug!(seccode = %self.seccode, %timeframe, "streamed bar timeframe differs from history");
			return Ok(LiveUpdate::Ignored);
		}
		let last = source.last();
		let update = match last {
			Some(last) if row.datetime < last.datetime => return Ok(LiveUpdate::Ignored),
			Some(last) if row.datetime == last.datetime => {
				self.bars = None;
				Arc::make_mut(source).update_last(row)?;
				LiveUpdate::Extended
			}
			closed => {
				self.bars = None;
				Arc::make_mut(source).push(row)?;
				LiveUpdate::Opened {
					closed,
					opened_at: row.datetime,
				}
			}
		};
		self.bars = Some(derive(self.config.working_timeframe, source)?);
		Ok(update)
	}

	pub fn set_working_timeframe(&mut self, timeframe: Timeframe) -> Result<(), SeriesError> {
		if let Some(source) = &self.source {
			self.bars = Some(derive(timeframe, source)?);
		}
		self.config.working_timeframe = timeframe;
		Ok(())
	}

	/// Drops both series so the next history batch starts from scratch.
	pub fn reset(&mut self) {
		self.source = None;
		self.bars = None;
	}
}

fn derive(working: Timeframe, source: &Arc<Bars>) -> Result<Arc<Bars>, SeriesError> {
	if working == source.timeframe() {
		Ok(Arc::clone(source))
	} else {
		compress(source, working).map(Arc::new)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use chrono::{Duration, NaiveDate, NaiveDateTime};
	use tradelink::Timeframe;

	use super::{InstrumentSeries, LiveUpdate, SeriesConfig};
	use crate::reconcile::MergeKind;
	use crate::{BarRow, Bars, ReconcileError};

	fn at(minute: i64) -> NaiveDateTime {
		NaiveDate::from_ymd_opt(2024, 5, 6)
			.and_then(|d| d.and_hms_opt(10, 0, 0))
			.expect("valid datetime")
			+ Duration::minutes(minute)
	}

	fn history(count: i64) -> Bars {
		Bars::from_rows(
			Timeframe::M5,
			(0..count).map(|i| BarRow::new(at(5 * i), 10.0, 11.0, 9.0, 10.5, 2.0)),
		)
		.expect("valid rows")
	}

	fn series(working: Timeframe) -> InstrumentSeries {
		InstrumentSeries::new(
			"ABC",
			SeriesConfig {
				working_timeframe: working,
				max_bars: None,
			},
		)
	}

	#[test]
	fn same_timeframe_shares_one_allocation() {
		let mut s = series(Timeframe::M5);
		assert_eq!(s.merge_history(history(4)).expect("merge"), MergeKind::Replaced);
		let snapshot = s.snapshot().expect("loaded");
		assert!(Arc::ptr_eq(&snapshot.source, &snapshot.bars));
	}

	#[test]
	fn coarser_working_timeframe_is_compressed() {
		let mut s = series(Timeframe::M30);
		s.merge_history(history(12)).expect("merge");
		let bars = s.bars().expect("derived");
		assert_eq!(bars.timeframe(), Timeframe::M30);
		assert_eq!(bars.len(), 2);
		assert_eq!(bars.volume(), &[12.0, 12.0]);
	}

	#[test]
	fn rejected_backfill_leaves_state_untouched() {
		let mut s = series(Timeframe::M5);
		s.merge_history(history(3)).expect("merge");
		let before = s.source().expect("loaded");

		let stale = Bars::from_rows(Timeframe::M5, [BarRow::flat(at(0) - Duration::days(6), 1.0, 1.0)])
			.expect("row");
		let err = s.merge_history(stale).unwrap_err();
		assert!(matches!(err, ReconcileError::BackfillGap { .. }));
		assert!(Arc::ptr_eq(&before, &s.source().expect("still loaded")));
	}

	#[test]
	fn max_bars_trims_oldest_history() {
		let mut s = InstrumentSeries::new(
			"ABC",
			SeriesConfig {
				working_timeframe: Timeframe::M5,
				max_bars: Some(2),
			},
		);
		s.merge_history(history(5)).expect("merge");
		assert_eq!(s.source().map(|b| b.len()), Some(2));
	}

	#[test]
	fn ticks_extend_then_open_aligned_bar() {
		let mut s = series(Timeframe::M5);
		s.merge_history(history(2)).expect("merge");

		assert_eq!(s.apply_tick(at(6), 12.0, 1.0).expect("tick"), LiveUpdate::Extended);
		let last = s.source().and_then(|b| b.last()).expect("bar");
		assert_eq!((last.high, last.close, last.volume), (12.0, 12.0, 3.0));

		let update = s.apply_tick(at(11), 8.0, 4.0).expect("tick");
		assert_eq!(
			update,
			LiveUpdate::Opened {
				closed: Some(last),
				opened_at: at(10),
			}
		);
		assert_eq!(s.bars().map(|b| b.len()), Some(3));

		assert_eq!(s.apply_tick(at(1), 1.0, 1.0).expect("stale"), LiveUpdate::Ignored);
	}

	#[test]
	fn ticks_without_history_are_ignored() {
		let mut s = series(Timeframe::M5);
		assert_eq!(s.apply_tick(at(0), 1.0, 1.0).expect("tick"), LiveUpdate::Ignored);
	}

	#[test]
	fn upsert_last_replaces_or_appends() {
		let mut s = series(Timeframe::M5);
		s.merge_history(history(2)).expect("merge");

		let revised = BarRow::new(at(5), 10.0, 15.0, 9.0, 14.0, 7.0);
		assert_eq!(s.upsert_last(Timeframe::M5, revised).expect("upsert"), LiveUpdate::Extended);
		assert_eq!(s.source().and_then(|b| b.last()), Some(revised));

		let next = BarRow::flat(at(10), 14.0, 1.0);
		assert!(matches!(
			s.upsert_last(Timeframe::M5, next).expect("upsert"),
			LiveUpdate::Opened { .. }
		));
		assert_eq!(
			s.upsert_last(Timeframe::M1, next).expect("other tf"),
			LiveUpdate::Ignored
		);
	}
}
