use tracing::info;

fn main() -> anyhow::Result<()> {
	tradelink::init_logging();

	let config = runtime::RuntimeConfig::from_env()?;
	info!(mode = ?config.mode, symbols = ?config.symbols, "starting live runtime");

	let summary = runtime::run(&config)?;
	for series in &summary.series {
		info!(
			seccode = %series.seccode,
			source_bars = series.source_len,
			working_bars = series.bars_len,
			last_close = ?series.last_close,
			"series at exit"
		);
	}
	info!(events = summary.events, "live runtime done");
	Ok(())
}
