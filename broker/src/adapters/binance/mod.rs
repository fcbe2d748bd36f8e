//! Connector for the USDⓈ-M futures REST and WebSocket API.

pub mod parser;
pub mod signing;
pub mod stream;

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{Local, Utc};
use market::{Distributor, SeriesConfig};
use reqwest::Method;
use serde::Deserialize;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};
use tradelink::{ConnectionState, IdGenerator, Order, SecurityKey, Side, Timeframe};

use crate::error::BrokerError;
use crate::ingest::{IngestQueue, IngestSender};
use crate::protocol::{
    CancelRequest, CommandReceipt, Connector, Credentials, OrderRequest, ReplaceRequest,
};
use crate::recalc::{HistorySource, RecalcConfig, RecalcScheduler, RecalcSink};
use crate::session::ConnectorBase;
use crate::state::{StateView, TradingState};

use parser::{
    check_clock_skew, check_permissions, decode_order_response, interval_for, ApiRestrictions,
    BinanceHandler, RestMessage, ServerTime, DEFAULT_MAX_CLOCK_SKEW_MS,
};
use signing::RequestSigner;
use stream::{kline_stream_name, stream_endpoint, KlineStream};

pub use parser::BOARD;

pub const VENUE: &str = "BINANCE";
/// Largest page the klines endpoint serves.
pub const MAX_KLINES: usize = 1500;

#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub rest_base: String,
    /// Host of the account-level endpoints (API key restrictions).
    pub sapi_base: String,
    pub ws_base: String,
    pub recv_window_ms: u64,
    pub request_timeout: Duration,
    pub max_clock_skew_ms: i64,
    /// Stream without a frame for this long fails the heartbeat.
    pub stream_timeout: Duration,
    pub stream_timeframe: Timeframe,
    pub series: SeriesConfig,
    pub recalc: RecalcConfig,
    pub worker_id: u64,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            rest_base: "https://fapi.binance.com".to_string(),
            sapi_base: "https://api.binance.com".to_string(),
            ws_base: "wss://fstream.binance.com".to_string(),
            recv_window_ms: 5_000,
            request_timeout: Duration::from_secs(10),
            max_clock_skew_ms: DEFAULT_MAX_CLOCK_SKEW_MS,
            stream_timeout: Duration::from_secs(15),
            stream_timeframe: Timeframe::M1,
            series: SeriesConfig::default(),
            recalc: RecalcConfig::default(),
            worker_id: 1,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

/// Blocking facade over the async HTTP client.
///
/// Responses that change state are not applied here; their bodies are
/// queued for the ingestion thread.
pub struct RestClient {
    http: reqwest::Client,
    runtime: Runtime,
    rest_base: String,
    sapi_base: String,
    recv_window_ms: u64,
    signer: RwLock<Option<RequestSigner>>,
    sender: IngestSender<RestMessage>,
}

impl RestClient {
    pub fn new(config: &BinanceConfig, sender: IngestSender<RestMessage>) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| BrokerError::Fatal(format!("cannot build http client: {err}")))?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("binance-rest")
            .enable_all()
            .build()
            .map_err(|err| BrokerError::Fatal(format!("cannot build http runtime: {err}")))?;
        Ok(Self {
            http,
            runtime,
            rest_base: config.rest_base.trim_end_matches('/').to_string(),
            sapi_base: config.sapi_base.trim_end_matches('/').to_string(),
            recv_window_ms: config.recv_window_ms,
            signer: RwLock::new(None),
            sender,
        })
    }

    pub fn set_signer(&self, signer: Option<RequestSigner>) {
        *self.signer.write().unwrap_or_else(PoisonError::into_inner) = signer;
    }

    fn signer(&self) -> Result<RequestSigner, BrokerError> {
        self.signer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    pub fn server_time(&self) -> Result<i64, BrokerError> {
        let body = self.public(&format!("{}/fapi/v1/time", self.rest_base), &[])?;
        let time: ServerTime = serde_json::from_str(&body)?;
        Ok(time.server_time)
    }

    pub fn api_restrictions(&self) -> Result<ApiRestrictions, BrokerError> {
        let url = format!("{}/sapi/v1/account/apiRestrictions", self.sapi_base);
        let body = self.signed(Method::GET, &url, &[])?;
        Ok(serde_json::from_str(&body)?)
    }

    pub fn ping(&self) -> Result<(), BrokerError> {
        self.public(&format!("{}/fapi/v1/ping", self.rest_base), &[]).map(|_| ())
    }

    pub fn fetch_exchange_info(&self) -> Result<(), BrokerError> {
        let body = self.public(&format!("{}/fapi/v1/exchangeInfo", self.rest_base), &[])?;
        self.enqueue(RestMessage::ExchangeInfo(body))
    }

    pub fn fetch_account(&self) -> Result<(), BrokerError> {
        let body = self.signed(Method::GET, &format!("{}/fapi/v2/account", self.rest_base), &[])?;
        self.enqueue(RestMessage::Account(body))
    }

    pub fn fetch_klines(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Result<(), BrokerError> {
        let limit = count.clamp(1, MAX_KLINES);
        if limit != count {
            warn!(symbol, requested = count, served = limit, "kline count clamped");
        }
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval_for(timeframe)),
            ("limit", limit.to_string()),
        ];
        let body = self.public(&format!("{}/fapi/v1/klines", self.rest_base), &params)?;
        self.enqueue(RestMessage::Klines {
            symbol: symbol.to_string(),
            timeframe,
            body,
        })
    }

    /// Sends an order command and queues the returned order for ingestion.
    pub fn order_command(&self, method: Method, params: &[(&str, String)]) -> Result<String, BrokerError> {
        let body = self.signed(method, &format!("{}/fapi/v1/order", self.rest_base), params)?;
        self.enqueue(RestMessage::Order(body.clone()))?;
        Ok(body)
    }

    pub fn enqueue(&self, message: RestMessage) -> Result<(), BrokerError> {
        if self.sender.push(message) {
            Ok(())
        } else {
            Err(BrokerError::Transport("ingestion queue is closed".to_string()))
        }
    }

    fn public(&self, url: &str, params: &[(&str, String)]) -> Result<String, BrokerError> {
        let query = signing::encode_query(params);
        let url = if query.is_empty() { url.to_string() } else { format!("{url}?{query}") };
        self.execute(Method::GET, url, None)
    }

    fn signed(&self, method: Method, url: &str, params: &[(&str, String)]) -> Result<String, BrokerError> {
        let signer = self.signer()?;
        let query = signer.signed_query(params, Utc::now().timestamp_millis(), self.recv_window_ms)?;
        self.execute(method, format!("{url}?{query}"), Some(signer.api_key()))
    }

    fn execute(&self, method: Method, url: String, api_key: Option<&str>) -> Result<String, BrokerError> {
        let mut request = self.http.request(method.clone(), &url);
        if let Some(key) = api_key {
            request = request.header("X-MBX-APIKEY", key);
        }
        self.runtime.block_on(send(method, request))
    }
}

async fn send(method: Method, request: reqwest::RequestBuilder) -> Result<String, BrokerError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        return Ok(body);
    }
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|err| format!("{} ({})", err.msg, err.code))
        .unwrap_or(body);
    debug!(%method, status = status.as_u16(), "request failed");
    if status.is_client_error() {
        Err(BrokerError::Rejected(message))
    } else {
        Err(BrokerError::Transport(format!("http {status}: {message}")))
    }
}

impl HistorySource for RestClient {
    fn request_history(&self, seccode: &str, timeframe: Timeframe, count: usize) -> Result<(), BrokerError> {
        self.fetch_klines(seccode, timeframe, count)
    }
}

pub struct BinanceConnector {
    config: BinanceConfig,
    rest: Arc<RestClient>,
    base: ConnectorBase<RestMessage>,
    ids: IdGenerator,
    streams: BTreeSet<String>,
    stream: Option<KlineStream>,
}

impl BinanceConnector {
    pub fn new(
        config: BinanceConfig,
        sink: Arc<dyn RecalcSink>,
        distributor: Arc<Distributor>,
    ) -> Result<Self, BrokerError> {
        let state = TradingState::shared(config.series);
        let queue = IngestQueue::new();
        let rest = Arc::new(RestClient::new(&config, queue.sender())?);
        let history: Arc<dyn HistorySource> = rest.clone();
        let recalc = Arc::new(RecalcScheduler::new(config.recalc, sink, Some(history)));
        let handler = BinanceHandler::new(Arc::clone(&recalc), distributor);
        let base = ConnectorBase::start(VENUE, state, queue, handler, recalc)?;
        let ids = IdGenerator::new(config.worker_id);
        Ok(Self {
            config,
            rest,
            base,
            ids,
            streams: BTreeSet::new(),
            stream: None,
        })
    }

    pub fn flush(&self) -> Result<(), BrokerError> {
        self.base.flush()
    }

    pub fn base(&self) -> &ConnectorBase<RestMessage> {
        &self.base
    }

    pub fn stream_endpoint(&self) -> Option<&str> {
        self.stream.as_ref().map(KlineStream::endpoint)
    }

    fn handshake(&mut self, key: String, secret: zeroize::Zeroizing<String>) -> Result<(), BrokerError> {
        self.rest.set_signer(Some(RequestSigner::new(key, secret)));

        let server_time = self.rest.server_time()?;
        check_clock_skew(server_time, Utc::now().timestamp_millis(), self.config.max_clock_skew_ms)?;
        check_permissions(&self.rest.api_restrictions()?)?;

        self.rest.fetch_exchange_info()?;
        self.rest.fetch_account()?;
        self.base.flush()
    }

    fn restart_stream(&mut self) -> Result<(), BrokerError> {
        if let Some(mut previous) = self.stream.take() {
            previous.stop();
        }
        let streams: Vec<String> = self.streams.iter().cloned().collect();
        let Some(endpoint) = stream_endpoint(&self.config.ws_base, &streams) else {
            return Ok(());
        };
        debug!(endpoint = %endpoint, "starting kline stream");
        self.stream = Some(KlineStream::spawn(endpoint, self.base.sender())?);
        Ok(())
    }

    fn stop_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
    }

    fn price_text(&self, seccode: &str, price: f64) -> Result<String, BrokerError> {
        let security = self
            .state()
            .security(seccode)
            .ok_or_else(|| BrokerError::InvalidRequest(format!("unknown symbol {seccode}")))?;
        Ok(security.format_price(price))
    }

    fn receipt(transaction_id: u64, body: &str) -> CommandReceipt {
        let order_no = decode_order_response(body).ok().map(|response| response.order_id);
        CommandReceipt {
            transaction_id: Some(transaction_id),
            order_no,
        }
    }
}

impl Connector for BinanceConnector {
    fn venue(&self) -> &str {
        self.base.venue()
    }

    fn connect(&mut self, credentials: Credentials) -> Result<(), BrokerError> {
        let Credentials::ApiKey { key, secret } = credentials else {
            return Err(BrokerError::InvalidRequest(
                "futures connector needs api key credentials".to_string(),
            ));
        };

        self.stop_stream();
        self.base.reset_session();
        self.base.transition(ConnectionState::Connecting);
        self.base.flush()?;

        info!(api_key = %key, "connecting");
        if let Err(err) = self.handshake(key, secret) {
            warn!(error = %err, "handshake failed");
            self.rest.set_signer(None);
            self.base.transition(ConnectionState::Disconnected);
            return Err(err);
        }

        self.base.transition(ConnectionState::Connected);
        self.base.flush()?;
        self.restart_stream()
    }

    fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.base.transition(ConnectionState::Disconnecting);
        self.stop_stream();
        self.rest.set_signer(None);
        self.base.reset_session();
        self.base.transition(ConnectionState::Disconnected);
        self.base.flush()
    }

    fn send_order(&mut self, request: &OrderRequest) -> Result<CommandReceipt, BrokerError> {
        self.base.require_connected()?;
        let symbol = request.security.seccode.clone();
        let mut params = vec![
            ("symbol", symbol.clone()),
            ("side", side_text(request.side).to_string()),
            ("quantity", format_quantity(request.quantity)),
        ];
        if request.by_market {
            params.push(("type", "MARKET".to_string()));
        } else {
            params.push(("type", "LIMIT".to_string()));
            params.push(("timeInForce", "GTC".to_string()));
            params.push(("price", self.price_text(&symbol, request.price)?));
        }

        let transaction_id = self.ids.next_id();
        params.push(("newClientOrderId", transaction_id.to_string()));

        let mut order = Order::new(transaction_id);
        order.seccode = symbol;
        order.board = BOARD.to_string();
        order.side = Some(request.side);
        order.price = request.price;
        order.quantity = request.quantity;
        order.balance = request.quantity;
        order.placed_at = Some(Local::now().naive_local());
        order.attribution = request.attribution.clone();
        self.base.submit_local_order(order);

        match self.rest.order_command(Method::POST, &params) {
            Ok(body) => Ok(Self::receipt(transaction_id, &body)),
            Err(err) => {
                self.rest.enqueue(RestMessage::OrderFailed {
                    transaction_id,
                    reason: err.to_string(),
                })?;
                Err(err)
            }
        }
    }

    fn replace_order(&mut self, request: &ReplaceRequest) -> Result<CommandReceipt, BrokerError> {
        self.base.require_connected()?;
        let order = self
            .state()
            .order_by_transaction(request.transaction_id)
            .ok_or_else(|| {
                BrokerError::InvalidRequest(format!("unknown order {}", request.transaction_id))
            })?;
        let side = order
            .side
            .ok_or_else(|| BrokerError::InvalidRequest("order side is unknown".to_string()))?;
        let symbol = request.security.seccode.clone();
        let params = [
            ("symbol", symbol.clone()),
            ("side", side_text(side).to_string()),
            ("quantity", format_quantity(request.quantity.unwrap_or(order.balance))),
            ("price", self.price_text(&symbol, request.price)?),
            ("origClientOrderId", request.transaction_id.to_string()),
        ];
        let body = self.rest.order_command(Method::PUT, &params)?;
        Ok(Self::receipt(request.transaction_id, &body))
    }

    fn cancel_order(&mut self, request: &CancelRequest) -> Result<CommandReceipt, BrokerError> {
        self.base.require_connected()?;
        let mut params = vec![("symbol", request.security.seccode.clone())];
        match request.order_no {
            Some(order_no) => params.push(("orderId", order_no.to_string())),
            None => params.push(("origClientOrderId", request.transaction_id.to_string())),
        }
        let body = self.rest.order_command(Method::DELETE, &params)?;
        Ok(Self::receipt(request.transaction_id, &body))
    }

    fn subscribe(&mut self, security: &SecurityKey) -> Result<(), BrokerError> {
        self.base.require_connected()?;
        if self.streams.insert(kline_stream_name(&security.seccode, self.config.stream_timeframe)) {
            self.restart_stream()?;
        }
        Ok(())
    }

    fn unsubscribe(&mut self, security: &SecurityKey) -> Result<(), BrokerError> {
        self.base.require_connected()?;
        if self.streams.remove(&kline_stream_name(&security.seccode, self.config.stream_timeframe)) {
            self.restart_stream()?;
        }
        Ok(())
    }

    fn request_historical_bars(
        &mut self,
        security: &SecurityKey,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<(), BrokerError> {
        self.base.require_connected()?;
        self.rest.fetch_klines(&security.seccode, timeframe, count)
    }

    /// The futures exchange info has no per-symbol filter, so the whole
    /// table is refreshed.
    fn request_security_info(&mut self, _security: &SecurityKey) -> Result<(), BrokerError> {
        self.base.require_connected()?;
        self.rest.fetch_exchange_info()
    }

    fn request_portfolio_info(&mut self) -> Result<(), BrokerError> {
        self.base.require_connected()?;
        self.rest.fetch_account()
    }

    fn state(&self) -> StateView {
        self.base.state_view()
    }

    fn heartbeat(&mut self) -> Result<(), BrokerError> {
        self.base.require_connected()?;
        let Some(stream) = &self.stream else {
            return self.rest.ping();
        };
        let timeout_ms = self.config.stream_timeout.as_millis() as u64;
        if !stream.is_running() || stream.idle_ms() > timeout_ms {
            self.base.transition(ConnectionState::Disconnected);
            return Err(BrokerError::Transport(
                "heartbeat timeout waiting for market data".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for BinanceConnector {
    fn drop(&mut self) {
        self.stop_stream();
        self.base.shutdown();
    }
}

fn side_text(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn format_quantity(quantity: f64) -> String {
    if quantity.fract() == 0.0 {
        format!("{quantity:.0}")
    } else {
        quantity.to_string()
    }
}
