//! Price history for the trading state.
//!
//! - `bar`: `Bars` parallel arrays and `BarRow`.
//! - `compress`: resampling into a coarser timeframe.
//! - `reconcile`: merging a history batch into a stored series.
//! - `series`: per-instrument source and working series with live updates.
//! - `distributor`: sharded broadcast of series events.
//!
//! ```rust
//! use chrono::NaiveDate;
//! use market::{BarRow, Bars, InstrumentSeries, SeriesConfig};
//! use tradelink::Timeframe;
//!
//! let start = NaiveDate::from_ymd_opt(2024, 5, 6)
//!     .and_then(|d| d.and_hms_opt(10, 0, 0))
//!     .unwrap();
//! let rows = (0..6).map(|i| BarRow::flat(start + chrono::Duration::minutes(5 * i), 10.0, 1.0));
//! let batch = Bars::from_rows(Timeframe::M5, rows).unwrap();
//!
//! let mut series = InstrumentSeries::new(
//!     "ABC",
//!     SeriesConfig { working_timeframe: Timeframe::M30, max_bars: None },
//! );
//! series.merge_history(batch).unwrap();
//! assert_eq!(series.bars().unwrap().len(), 1);
//! ```

mod bar;
mod compress;
mod distributor;
mod error;
mod reconcile;
mod series;

pub use bar::{BarRow, Bars};
pub use compress::{compress, period_start};
pub use distributor::{Distributor, SeriesEvent};
pub use error::{ReconcileError, SeriesError};
pub use reconcile::{reconcile, Merge, MergeKind, MAX_BACKFILL_GAP_DAYS};
pub use series::{InstrumentSeries, LiveUpdate, SeriesConfig, SeriesSnapshot};

#[cfg(test)]
mod tests {
	use chrono::NaiveDate;

	use super::{Distributor, MergeKind, SeriesEvent};

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn fanout_delivers_same_event_to_every_subscriber() {
		let distributor = Distributor::new(16);
		let mut a = distributor.subscribe("ABC");
		let mut b = distributor.subscribe("abc");

		let delivered = distributor.publish(SeriesEvent::Reconciled {
			seccode: "ABC".to_string(),
			merge: MergeKind::Spliced,
			len: 25,
		});
		assert_eq!(delivered, 2);

		let ra = a.recv().await.expect("subscriber a receives event");
		let rb = b.recv().await.expect("subscriber b receives event");
		assert_eq!(ra, rb);
		assert_eq!(ra.seccode(), "ABC");
	}

	#[test]
	fn publish_without_subscribers_is_dropped() {
		let distributor = Distributor::default();
		let opened_at = NaiveDate::from_ymd_opt(2024, 5, 6)
			.and_then(|d| d.and_hms_opt(10, 0, 0))
			.expect("valid datetime");
		assert_eq!(
			distributor.publish(SeriesEvent::BarOpened {
				seccode: "XYZ".to_string(),
				opened_at,
			}),
			0
		);
		assert!(distributor.active_channels().is_empty());
	}

	#[test]
	fn subscriber_count_tracks_live_receivers() {
		let distributor = Distributor::new(4);
		let rx = distributor.subscribe("SBER");
		assert_eq!(distributor.subscriber_count("sber"), 1);
		assert_eq!(distributor.active_channels(), vec!["sber".to_string()]);
		drop(rx);
		assert_eq!(distributor.subscriber_count("SBER"), 0);
	}
}
