use chrono::{Duration, NaiveDate, NaiveDateTime};
use market::{
	compress, reconcile, BarRow, Bars, InstrumentSeries, Merge, MergeKind, ReconcileError,
	SeriesConfig,
};
use tradelink::Timeframe;

fn day_start(day: u32) -> NaiveDateTime {
	NaiveDate::from_ymd_opt(2024, 3, day)
		.and_then(|d| d.and_hms_opt(10, 0, 0))
		.expect("valid datetime")
}

fn five_minute(start: NaiveDateTime, count: usize, seed: f64) -> Bars {
	Bars::from_rows(
		Timeframe::M5,
		(0..count).map(|i| {
			let base = seed + (i % 5) as f64;
			BarRow::new(
				start + Duration::minutes(5 * i as i64),
				base,
				base + 1.5,
				base - 0.5,
				base + 0.25,
				100.0 + i as f64,
			)
		}),
	)
	.expect("valid rows")
}

#[test]
fn replayed_batch_merges_without_duplicates() {
	let start = day_start(11);
	let existing = five_minute(start, 5, 10.0);
	let incoming = five_minute(start + Duration::minutes(15), 3, 20.0);

	let mut stored = existing;
	for _ in 0..4 {
		stored = reconcile(Some(&stored), incoming.clone())
			.expect("mergeable")
			.into_bars()
			.expect("splice yields bars");
	}

	let expected: Vec<NaiveDateTime> = (0..6).map(|i| start + Duration::minutes(5 * i)).collect();
	assert_eq!(stored.datetime(), expected.as_slice());
	assert_eq!(stored.open()[3], 20.0);
}

#[test]
fn backfill_six_days_older_is_rejected_and_series_kept() {
	let mut series = InstrumentSeries::new("ABC", SeriesConfig::default());
	series
		.merge_history(five_minute(day_start(11), 5, 10.0))
		.expect("initial load");
	let before = series.source().expect("loaded");

	let old = five_minute(day_start(5) - Duration::hours(1), 3, 1.0);
	let err = series.merge_history(old).unwrap_err();
	assert!(matches!(err, ReconcileError::BackfillGap { .. }));
	assert_eq!(series.source().expect("still loaded").as_ref(), before.as_ref());
}

#[test]
fn compress_is_noop_for_same_timeframe_and_idempotent() {
	let bars = Bars::from_rows(
		Timeframe::M1,
		(0..180).map(|i| {
			let p = 100.0 + ((i * 7) % 11) as f64;
			BarRow::new(day_start(11) + Duration::minutes(i), p, p + 2.0, p - 2.0, p + 1.0, 3.0)
		}),
	)
	.expect("valid rows");

	assert_eq!(compress(&bars, Timeframe::M1).expect("same tf"), bars);
	let once = compress(&bars, Timeframe::M5).expect("compatible");
	let twice = compress(&once, Timeframe::M5).expect("same tf");
	assert_eq!(once, twice);
	assert_eq!(once.len(), 36);
}

#[test]
fn interior_overlap_never_rewrites_history() {
	let start = day_start(11);
	let existing = five_minute(start, 10, 10.0);
	let incoming = five_minute(start + Duration::minutes(10), 3, 99.0);

	assert_eq!(reconcile(Some(&existing), incoming).expect("consistent"), Merge::Unchanged);

	let mut series = InstrumentSeries::new("ABC", SeriesConfig::default());
	series.merge_history(existing.clone()).expect("load");
	let kind = series
		.merge_history(five_minute(start + Duration::minutes(10), 3, 99.0))
		.expect("consistent");
	assert_eq!(kind, MergeKind::Unchanged);
	assert_eq!(series.source().expect("loaded").as_ref(), &existing);
}

#[test]
fn thirty_minute_working_series_aggregates_history() {
	let mut series = InstrumentSeries::new(
		"ABC",
		SeriesConfig {
			working_timeframe: Timeframe::M30,
			max_bars: None,
		},
	);
	let batch = five_minute(day_start(11), 25, 50.0);
	series.merge_history(batch.clone()).expect("load");

	let snapshot = series.snapshot().expect("loaded");
	assert_eq!(snapshot.source.timeframe(), Timeframe::M5);
	assert_eq!(snapshot.bars.timeframe(), Timeframe::M30);
	assert_eq!(snapshot.bars.len(), 5);

	let first = &batch.volume()[0..6];
	assert_eq!(snapshot.bars.volume()[0], first.iter().sum::<f64>());
	assert_eq!(snapshot.bars.open()[0], batch.open()[0]);
	assert_eq!(snapshot.bars.close()[0], batch.close()[5]);
	assert_eq!(snapshot.bars.high()[0], 50.0 + 4.0 + 1.5);
	assert_eq!(snapshot.bars.low()[0], 50.0 - 0.5);
	assert_eq!(snapshot.bars.close()[4], batch.close()[24]);
}
