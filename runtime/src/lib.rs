//! Process wiring: reads the environment, builds one connector with its
//! collaborators and keeps it supervised.

mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use broker::{
	BinanceConfig, BinanceConnector, BrokerError, Connector, Credentials, LifecycleConfig,
	LoggingSink, RecalcConfig, ServerAddress, StateView, Supervisor, TransaqConfig,
	TransaqConnector,
};
use market::{Distributor, SeriesConfig, SeriesEvent};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};
use tradelink::{SecurityKey, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
	Transaq,
	Binance,
	/// Native connector over the in-process transport with a scripted feed.
	Mock,
}

impl RuntimeMode {
	pub fn parse(value: &str) -> Result<Self> {
		match value.trim().to_ascii_lowercase().as_str() {
			"transaq" | "txml" => Ok(Self::Transaq),
			"binance" => Ok(Self::Binance),
			"mock" | "demo" => Ok(Self::Mock),
			other => bail!("unknown runtime mode {other:?}"),
		}
	}
}

#[derive(Clone)]
pub struct RuntimeConfig {
	pub mode: RuntimeMode,
	pub symbols: Vec<String>,
	pub board: String,
	pub history_timeframe: Timeframe,
	pub history_count: usize,
	/// `None` runs until the process is stopped.
	pub run_for: Option<Duration>,
	pub poll_interval: Duration,
	pub lifecycle: LifecycleConfig,
	pub transaq: TransaqConfig,
	pub binance: BinanceConfig,
	pub credentials: Option<Credentials>,
}

impl RuntimeConfig {
	pub fn from_env() -> Result<Self> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
		let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
		let mode = RuntimeMode::parse(&get("TRADELINK_MODE").unwrap_or_else(|| "mock".to_string()))?;

		let default_symbol = match mode {
			RuntimeMode::Binance => "BTCUSDT",
			RuntimeMode::Transaq | RuntimeMode::Mock => "SBER",
		};
		let symbols = parse_symbols(get("TRADELINK_SYMBOLS").as_deref().unwrap_or(default_symbol));
		let board = match mode {
			RuntimeMode::Binance => broker::adapters::binance::BOARD.to_string(),
			_ => get("TRADELINK_BOARD").unwrap_or_else(|| "TQBR".to_string()),
		};

		let working_timeframe = timeframe(get("TRADELINK_WORKING_TF"), Timeframe::M30)?;
		let history_timeframe = timeframe(get("TRADELINK_HISTORY_TF"), Timeframe::M5)?;
		if !working_timeframe.is_multiple_of(history_timeframe) {
			bail!("working timeframe {working_timeframe} is not a multiple of {history_timeframe}");
		}
		let series = SeriesConfig {
			working_timeframe,
			max_bars: parse_number(get("TRADELINK_MAX_BARS"))?,
		};
		let recalc = RecalcConfig {
			debounce: parse_number(get("TRADELINK_RECALC_DEBOUNCE_MS"))?
				.map_or(RecalcConfig::default().debounce, Duration::from_millis),
			..RecalcConfig::default()
		};
		let request_timeout = parse_number(get("TRADELINK_REQUEST_TIMEOUT_SECS"))?.map(Duration::from_secs);

		let mut transaq = TransaqConfig {
			series,
			recalc,
			..TransaqConfig::default()
		};
		if let Some(library) = get("TRADELINK_TXML_LIBRARY") {
			transaq.library_path = PathBuf::from(library);
		}
		if let Some(host) = get("TRADELINK_TXML_HOST") {
			let port = parse_number(get("TRADELINK_TXML_PORT"))?.unwrap_or(transaq.server.port);
			transaq.server = ServerAddress::new(host, port);
		}
		if let Some(host) = get("TRADELINK_TXML_BACKUP_HOST") {
			let port = parse_number(get("TRADELINK_TXML_BACKUP_PORT"))?.unwrap_or(transaq.server.port);
			transaq.backup_server = Some(ServerAddress::new(host, port));
		}
		if let Some(timeout) = request_timeout {
			transaq.request_timeout = timeout;
		}

		let mut binance = BinanceConfig {
			series,
			recalc,
			stream_timeframe: history_timeframe,
			..BinanceConfig::default()
		};
		if let Some(rest) = get("TRADELINK_BINANCE_REST") {
			binance.rest_base = rest;
		}
		if let Some(ws) = get("TRADELINK_BINANCE_WS") {
			binance.ws_base = ws;
		}
		if let Some(timeout) = request_timeout {
			binance.request_timeout = timeout;
		}

		let credentials = match mode {
			RuntimeMode::Transaq => match (get("TRADELINK_TXML_LOGIN"), get("TRADELINK_TXML_PASSWORD")) {
				(Some(login), Some(password)) => Some(Credentials::login(login, password)),
				_ => bail!("TRADELINK_TXML_LOGIN and TRADELINK_TXML_PASSWORD are required"),
			},
			RuntimeMode::Binance => match (get("TRADELINK_BINANCE_KEY"), get("TRADELINK_BINANCE_SECRET")) {
				(Some(key), Some(secret)) => Some(Credentials::api_key(key, secret)),
				_ => bail!("TRADELINK_BINANCE_KEY and TRADELINK_BINANCE_SECRET are required"),
			},
			RuntimeMode::Mock => Some(Credentials::login("demo", "demo")),
		};

		Ok(Self {
			mode,
			symbols,
			board,
			history_timeframe,
			history_count: parse_number(get("TRADELINK_HISTORY_COUNT"))?.unwrap_or(500),
			run_for: parse_number(get("TRADELINK_RUN_SECS"))?
				.filter(|secs| *secs > 0)
				.map(Duration::from_secs),
			poll_interval: Duration::from_millis(200),
			lifecycle: LifecycleConfig::default(),
			transaq,
			binance,
			credentials,
		})
	}

	pub fn security_keys(&self) -> Vec<SecurityKey> {
		self.symbols
			.iter()
			.map(|symbol| SecurityKey::new(self.board.clone(), symbol.clone()))
			.collect()
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSummary {
	pub seccode: String,
	pub source_len: usize,
	pub bars_len: usize,
	pub last_close: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
	pub mode: RuntimeMode,
	pub series: Vec<SeriesSummary>,
	/// Series events observed while running.
	pub events: usize,
}

pub fn run(config: &RuntimeConfig) -> Result<RunSummary> {
	let distributor = Arc::new(Distributor::default());
	match config.mode {
		RuntimeMode::Mock => demo::run(config, distributor),
		RuntimeMode::Transaq => {
			let connector =
				TransaqConnector::load(config.transaq.clone(), Arc::new(LoggingSink), Arc::clone(&distributor))
					.context("loading native connector")?;
			supervise(connector, config, &distributor)
		}
		RuntimeMode::Binance => {
			let connector =
				BinanceConnector::new(config.binance.clone(), Arc::new(LoggingSink), Arc::clone(&distributor))
					.context("starting futures connector")?;
			supervise(connector, config, &distributor)
		}
	}
}

fn supervise<C: Connector>(connector: C, config: &RuntimeConfig, distributor: &Distributor) -> Result<RunSummary> {
	let mut supervisor = Supervisor::new(connector, config.lifecycle);
	let keys = config.security_keys();
	for key in &keys {
		supervisor.subscribe(key.clone())?;
	}
	let credentials = config.credentials.clone().context("no credentials configured")?;
	supervisor.connect(credentials).context("connecting")?;

	let mut receivers: Vec<_> = keys.iter().map(|key| distributor.subscribe(&key.seccode)).collect();
	let mut history = HistoryRequests::new(&keys);
	let started = Instant::now();
	let mut events = 0;
	loop {
		match supervisor.ensure_live() {
			Ok(()) => {}
			Err(err @ (BrokerError::Timeout(_) | BrokerError::Transport(_) | BrokerError::NotConnected)) => {
				warn!(error = %err, "supervision step failed");
			}
			Err(err) => return Err(err).context("session cannot be kept alive"),
		}
		if supervisor.is_connected() {
			history.send(&mut supervisor, config);
		}
		events += drain_events(&mut receivers);
		if config.run_for.is_some_and(|limit| started.elapsed() >= limit) {
			break;
		}
		thread::sleep(config.poll_interval);
	}

	let summary = summarize(config.mode, &supervisor.connector().state(), &keys, events);
	if let Err(err) = supervisor.disconnect() {
		warn!(error = %err, "disconnect failed");
	}
	Ok(summary)
}

/// Attempts per session before a history request is given up.
const HISTORY_ATTEMPTS: u32 = 20;

/// History requests owed to the current session.
///
/// Reference data (candle kinds, securities) lands after the session reports
/// `Connected`, so a request the connector cannot resolve yet is retried on
/// later steps. A new session re-requests everything; reconciliation merges
/// the overlap.
struct HistoryRequests {
	keys: Vec<SecurityKey>,
	pending: Vec<(SecurityKey, u32)>,
	session: u64,
}

impl HistoryRequests {
	fn new(keys: &[SecurityKey]) -> Self {
		Self {
			keys: keys.to_vec(),
			pending: Vec::new(),
			session: 0,
		}
	}

	fn send<C: Connector>(&mut self, supervisor: &mut Supervisor<C>, config: &RuntimeConfig) {
		let session = supervisor.stats().reconnect_total;
		if session != self.session {
			self.session = session;
			self.pending = self.keys.iter().map(|key| (key.clone(), 0)).collect();
		}
		let connector = supervisor.connector_mut();
		self.pending.retain_mut(|(key, attempts)| {
			match connector.request_historical_bars(key, config.history_timeframe, config.history_count) {
				Ok(()) => {
					info!(seccode = %key.seccode, count = config.history_count, "history requested");
					false
				}
				Err(err) => {
					*attempts += 1;
					if *attempts >= HISTORY_ATTEMPTS {
						warn!(seccode = %key.seccode, error = %err, "history request abandoned");
						return false;
					}
					debug!(seccode = %key.seccode, error = %err, attempts = *attempts, "history request deferred");
					true
				}
			}
		});
	}
}

pub(crate) fn drain_events(receivers: &mut [broadcast::Receiver<SeriesEvent>]) -> usize {
	let mut seen = 0;
	for receiver in receivers {
		loop {
			match receiver.try_recv() {
				Ok(event) => {
					seen += 1;
					log_event(&event);
				}
				Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "series events skipped"),
				Err(TryRecvError::Empty | TryRecvError::Closed) => break,
			}
		}
	}
	seen
}

fn log_event(event: &SeriesEvent) {
	match event {
		SeriesEvent::Reconciled { seccode, merge, len } => {
			info!(seccode = %seccode, ?merge, len, "history reconciled");
		}
		SeriesEvent::Rejected { seccode, reason } => {
			warn!(seccode = %seccode, reason = %reason, "history rejected");
		}
		SeriesEvent::BarOpened { seccode, opened_at } => {
			info!(seccode = %seccode, opened_at = %opened_at, "bar opened");
		}
	}
}

pub(crate) fn summarize(mode: RuntimeMode, view: &StateView, keys: &[SecurityKey], events: usize) -> RunSummary {
	let series = keys
		.iter()
		.map(|key| {
			let snapshot = view.series(&key.seccode);
			SeriesSummary {
				seccode: key.seccode.clone(),
				source_len: snapshot.as_ref().map_or(0, |s| s.source.len()),
				bars_len: snapshot.as_ref().map_or(0, |s| s.bars.len()),
				last_close: snapshot.and_then(|s| s.bars.last()).map(|row| row.close),
			}
		})
		.collect();
	RunSummary { mode, series, events }
}

fn parse_symbols(raw: &str) -> Vec<String> {
	let mut symbols: Vec<String> = Vec::new();
	for symbol in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
		let symbol = symbol.to_ascii_uppercase();
		if !symbols.contains(&symbol) {
			symbols.push(symbol);
		}
	}
	symbols
}

fn parse_number<T: std::str::FromStr>(value: Option<String>) -> Result<Option<T>> {
	value
		.map(|raw| raw.parse::<T>().map_err(|_| anyhow::anyhow!("{raw:?} is not a number")))
		.transpose()
}

/// `1M` reads as one minute in [`Timeframe::parse`], so months are refused here.
fn timeframe(value: Option<String>, default: Timeframe) -> Result<Timeframe> {
	match value {
		None => Ok(default),
		Some(raw) if raw.ends_with('M') || raw.ends_with(['w', 'W']) => {
			bail!("timeframe {raw:?} is not supported")
		}
		Some(raw) => Timeframe::parse(&raw).with_context(|| format!("parsing timeframe {raw:?}")),
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::sync::Arc;
	use std::thread;
	use std::time::Duration;

	use broker::{LoggingSink, MockTransport, TransaqConnector};
	use market::Distributor;
	use tradelink::Timeframe;

	use super::{run, supervise, RuntimeConfig, RuntimeMode};

	fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map: HashMap<String, String> =
			pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
		move |key| map.get(key).cloned()
	}

	#[test]
	fn symbols_are_normalized_and_deduplicated() {
		let config = RuntimeConfig::from_lookup(lookup(&[
			("TRADELINK_SYMBOLS", " sber, GAZP,,sber "),
			("TRADELINK_WORKING_TF", "1h"),
			("TRADELINK_HISTORY_COUNT", "120"),
		]))
		.expect("valid config");
		assert_eq!(config.mode, RuntimeMode::Mock);
		assert_eq!(config.symbols, vec!["SBER".to_string(), "GAZP".to_string()]);
		assert_eq!(config.transaq.series.working_timeframe, Timeframe::H1);
		assert_eq!(config.history_count, 120);
		assert_eq!(config.run_for, None);
	}

	#[test]
	fn live_modes_require_credentials() {
		assert!(RuntimeConfig::from_lookup(lookup(&[("TRADELINK_MODE", "transaq")])).is_err());
		let config = RuntimeConfig::from_lookup(lookup(&[
			("TRADELINK_MODE", "binance"),
			("TRADELINK_BINANCE_KEY", "k"),
			("TRADELINK_BINANCE_SECRET", "s"),
			("TRADELINK_HISTORY_TF", "1m"),
			("TRADELINK_WORKING_TF", "15m"),
		]))
		.expect("binance config");
		assert_eq!(config.board, "USDM");
		assert_eq!(config.symbols, vec!["BTCUSDT".to_string()]);
		assert_eq!(config.binance.stream_timeframe, Timeframe::M1);
	}

	#[test]
	fn unsupported_timeframes_are_refused() {
		assert!(RuntimeConfig::from_lookup(lookup(&[("TRADELINK_WORKING_TF", "1M")])).is_err());
		assert!(RuntimeConfig::from_lookup(lookup(&[("TRADELINK_WORKING_TF", "7m")])).is_err());
		assert!(RuntimeConfig::from_lookup(lookup(&[("TRADELINK_HISTORY_TF", "5é")])).is_err());
		assert!(RuntimeConfig::from_lookup(lookup(&[("TRADELINK_HISTORY_COUNT", "many")])).is_err());
	}

	#[test]
	fn mock_session_builds_series() {
		let config = RuntimeConfig::from_lookup(lookup(&[
			("TRADELINK_SYMBOLS", "ABC,XYZ"),
			("TRADELINK_HISTORY_COUNT", "25"),
		]))
		.expect("mock config");
		let summary = run(&config).expect("mock run");
		assert_eq!(summary.series.len(), 2);
		for series in &summary.series {
			assert_eq!(series.source_len, 26, "{series:?}");
			assert!((5..=7).contains(&series.bars_len), "{series:?}");
			assert!(series.last_close.is_some());
		}
		assert!(summary.events >= 4);
	}

	#[test]
	fn history_waits_for_session_and_reference_data() {
		let mut config = RuntimeConfig::from_lookup(lookup(&[
			("TRADELINK_SYMBOLS", "ABC"),
			("TRADELINK_HISTORY_COUNT", "25"),
		]))
		.expect("mock config");
		config.run_for = Some(Duration::from_millis(600));
		config.poll_interval = Duration::from_millis(20);
		config.transaq.response_grace = Duration::ZERO;

		let transport = Arc::new(MockTransport::new());
		transport.hold_session_status(true);
		let distributor = Arc::new(Distributor::default());
		let connector = TransaqConnector::start(
			config.transaq.clone(),
			transport.clone(),
			Arc::new(LoggingSink),
			Arc::clone(&distributor),
		)
		.expect("mock transport initializes");

		let server = Arc::clone(&transport);
		let feed = thread::spawn(move || {
			thread::sleep(Duration::from_millis(100));
			server.push(r#"<server_status connected="true"/>"#);
			thread::sleep(Duration::from_millis(150));
			server.push(
				r#"<candlekinds><kind><id>2</id><period>300</period><name>5 minutes</name></kind></candlekinds>"#,
			);
		});
		let summary = supervise(connector, &config, &distributor).expect("session supervised");
		feed.join().expect("feed thread");

		let sent = transport.sent_commands();
		assert_eq!(sent.iter().filter(|c| c.contains("id=\"subscribe\"")).count(), 1);
		let history: Vec<_> = sent.iter().filter(|c| c.contains("gethistorydata")).collect();
		assert_eq!(history.len(), 1);
		assert!(history[0].contains("<period>2</period>"));
		assert_eq!(summary.series.len(), 1);
	}
}
