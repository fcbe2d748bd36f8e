//! Scripted session over the in-process transport: reference data, one
//! history batch per symbol and a trade print that opens the next bar.

use std::sync::Arc;

use anyhow::{Context, Result};
use broker::{Connector, LoggingSink, MockTransport, Supervisor, TransaqConnector};
use chrono::{Local, NaiveDateTime};
use market::{Distributor, period_start};
use tracing::{info, warn};
use tradelink::{SecurityKey, Timeframe};

use crate::{RunSummary, RuntimeConfig, drain_events, summarize};

const DATETIME: &str = "%d.%m.%Y %H:%M:%S";

/// `(id, period in seconds)` of the candle kinds the scripted server offers.
const CANDLE_KINDS: [(u32, u32); 6] = [(1, 60), (2, 300), (3, 900), (4, 1800), (5, 3600), (6, 86_400)];

pub(crate) fn run(config: &RuntimeConfig, distributor: Arc<Distributor>) -> Result<RunSummary> {
	let kind_id = CANDLE_KINDS
		.iter()
		.find(|(_, secs)| *secs == config.history_timeframe.minutes() * 60)
		.map(|(id, _)| *id)
		.with_context(|| format!("no scripted candles for {}", config.history_timeframe))?;

	let transport = Arc::new(MockTransport::new());
	let connector = TransaqConnector::start(
		config.transaq.clone(),
		transport.clone(),
		Arc::new(LoggingSink),
		Arc::clone(&distributor),
	)?;
	let mut supervisor = Supervisor::new(connector, config.lifecycle);
	let credentials = config.credentials.clone().context("no credentials configured")?;
	supervisor.connect(credentials)?;

	let keys = config.security_keys();
	transport.push(candle_kinds_xml());
	transport.push(securities_xml(&keys));
	supervisor.connector().flush()?;

	let mut receivers: Vec<_> = keys.iter().map(|key| distributor.subscribe(&key.seccode)).collect();
	let start = period_start(
		Local::now().naive_local() - config.history_timeframe.duration() * config.history_count as i32,
		config.history_timeframe,
	);
	for (index, key) in keys.iter().enumerate() {
		supervisor.subscribe(key.clone())?;
		supervisor
			.connector_mut()
			.request_historical_bars(key, config.history_timeframe, config.history_count)?;
		let base = 100.0 + index as f64 * 50.0;
		transport.push(candles_xml(key, kind_id, config.history_timeframe, start, config.history_count, base));
	}
	supervisor.connector().flush()?;

	let next_bar = start + config.history_timeframe.duration() * config.history_count as i32;
	for (index, key) in keys.iter().enumerate() {
		let price = 100.0 + index as f64 * 50.0 + 0.25;
		transport.push(tick_xml(key, next_bar + chrono::Duration::seconds(1), price));
	}
	supervisor.connector().flush()?;

	let events = drain_events(&mut receivers);
	let summary = summarize(config.mode, &supervisor.connector().state(), &keys, events);
	info!(events, commands = transport.sent_commands().len(), "scripted session finished");
	if let Err(err) = supervisor.disconnect() {
		warn!(error = %err, "disconnect failed");
	}
	Ok(summary)
}

fn candle_kinds_xml() -> String {
	let kinds: String = CANDLE_KINDS
		.iter()
		.map(|(id, secs)| format!("<kind><id>{id}</id><period>{secs}</period><name>{}</name></kind>", secs / 60))
		.collect();
	format!("<candlekinds>{kinds}</candlekinds>")
}

fn securities_xml(keys: &[SecurityKey]) -> String {
	let rows: String = keys
		.iter()
		.enumerate()
		.map(|(index, key)| {
			format!(
				"<security secid=\"{}\" active=\"true\"><seccode>{}</seccode><board>{}</board>\
				 <market>1</market><shortname>{}</shortname><decimals>2</decimals>\
				 <minstep>0.01</minstep><lotsize>1</lotsize></security>",
				index + 1,
				key.seccode,
				key.board,
				key.seccode
			)
		})
		.collect();
	format!("<securities>{rows}</securities>")
}

fn candles_xml(
	key: &SecurityKey,
	kind_id: u32,
	timeframe: Timeframe,
	start: NaiveDateTime,
	count: usize,
	base: f64,
) -> String {
	let rows: String = (0..count)
		.map(|i| {
			let date = start + timeframe.duration() * i as i32;
			let drift = ((i % 12) as f64 - 6.0) * 0.05;
			let open = base + drift;
			let close = open + 0.02;
			format!(
				"<candle date=\"{}\" open=\"{open:.2}\" high=\"{:.2}\" low=\"{:.2}\" close=\"{close:.2}\" volume=\"{}\"/>",
				date.format(DATETIME),
				close + 0.1,
				open - 0.1,
				100 + i
			)
		})
		.collect();
	format!(
		"<candles period=\"{kind_id}\" status=\"1\" board=\"{}\" seccode=\"{}\">{rows}</candles>",
		key.board, key.seccode
	)
}

fn tick_xml(key: &SecurityKey, at: NaiveDateTime, price: f64) -> String {
	format!(
		"<alltrades><trade><seccode>{}</seccode><board>{}</board><time>{}</time>\
		 <price>{price:.2}</price><quantity>1</quantity><buysell>B</buysell></trade></alltrades>",
		key.seccode,
		key.board,
		at.format(DATETIME)
	)
}
