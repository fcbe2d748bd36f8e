//! Connector for the native XML protocol library.

pub mod command;
pub mod dispatch;
pub mod ffi;
pub mod parser;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use market::{Distributor, SeriesConfig};
use tracing::{info, warn};
use tradelink::{ConnectionState, Order, SecurityKey, Timeframe};

use crate::error::BrokerError;
use crate::ingest::IngestQueue;
use crate::protocol::{
    CancelRequest, CommandReceipt, Connector, Credentials, OrderRequest, ReplaceRequest,
    ServerAddress,
};
use crate::recalc::{HistorySource, RecalcConfig, RecalcScheduler, RecalcSink};
use crate::session::ConnectorBase;
use crate::state::{StateView, TradingState};

use command::{Command, ConnectParams, NewOrder};
use dispatch::{CommandChannel, RESPONSE_GRACE};
use ffi::{DllTransport, ForeignTransport};
use parser::TransaqHandler;

pub use parser::{decode, Section};

pub const VENUE: &str = "TRANSAQ";

#[derive(Debug, Clone)]
pub struct TransaqConfig {
    pub library_path: PathBuf,
    pub log_dir: PathBuf,
    /// 1 (minimal) to 3 (verbose).
    pub log_level: u8,
    pub server: ServerAddress,
    pub backup_server: Option<ServerAddress>,
    pub request_timeout: Duration,
    /// Local wait beyond `request_timeout` before a command is abandoned.
    pub response_grace: Duration,
    pub session_timeout: Duration,
    pub rqdelay: Duration,
    /// How long a recovering session may stay in `Connecting`.
    pub recover_window: Duration,
    pub series: SeriesConfig,
    pub recalc: RecalcConfig,
    pub default_client: Option<String>,
    pub default_union: Option<String>,
}

impl Default for TransaqConfig {
    fn default() -> Self {
        Self {
            library_path: PathBuf::from("txmlconnector64.dll"),
            log_dir: PathBuf::from("logs"),
            log_level: 2,
            server: ServerAddress::new("tr1.finam.ru", 3900),
            backup_server: None,
            request_timeout: Duration::from_secs(20),
            response_grace: RESPONSE_GRACE,
            session_timeout: Duration::from_secs(120),
            rqdelay: Duration::from_millis(100),
            recover_window: Duration::from_secs(60),
            series: SeriesConfig::default(),
            recalc: RecalcConfig::default(),
            default_client: None,
            default_union: None,
        }
    }
}

pub struct TransaqConnector {
    config: TransaqConfig,
    transport: Arc<dyn ForeignTransport>,
    channel: Arc<CommandChannel>,
    base: ConnectorBase<String>,
}

impl TransaqConnector {
    /// Loads the library from `config.library_path` and starts the session.
    pub fn load(
        config: TransaqConfig,
        sink: Arc<dyn RecalcSink>,
        distributor: Arc<Distributor>,
    ) -> Result<Self, BrokerError> {
        let transport = Arc::new(DllTransport::load(&config.library_path)?);
        Self::start(config, transport, sink, distributor)
    }

    pub fn start(
        config: TransaqConfig,
        transport: Arc<dyn ForeignTransport>,
        sink: Arc<dyn RecalcSink>,
        distributor: Arc<Distributor>,
    ) -> Result<Self, BrokerError> {
        transport
            .initialize(&config.log_dir, config.log_level)
            .map_err(|err| match err {
                BrokerError::Fatal(message) => BrokerError::Fatal(message),
                other => BrokerError::Fatal(other.to_string()),
            })?;

        let state = TradingState::shared(config.series);
        let queue = IngestQueue::new();
        let callback_sender = queue.sender();
        transport.set_callback(Arc::new(move |payload: String| {
            callback_sender.push(payload);
        }))?;

        let channel = Arc::new(CommandChannel::new(
            Arc::clone(&transport),
            queue.sender(),
            config.request_timeout,
            StateView::new(Arc::clone(&state)),
        )
        .with_wait(config.request_timeout + config.response_grace));
        let history: Arc<dyn HistorySource> = channel.clone();
        let recalc = Arc::new(RecalcScheduler::new(config.recalc, sink, Some(history)));
        let handler = TransaqHandler::new(Arc::clone(&recalc), distributor, config.recover_window);
        let base = ConnectorBase::start(VENUE, state, queue, handler, recalc)?;

        info!(library = %config.library_path.display(), "native connector started");
        Ok(Self {
            config,
            transport,
            channel,
            base,
        })
    }

    /// Waits until every payload received so far has been applied.
    pub fn flush(&self) -> Result<(), BrokerError> {
        self.base.flush()
    }

    pub fn base(&self) -> &ConnectorBase<String> {
        &self.base
    }

    fn dispatch(&self, command: Command) -> Result<CommandReceipt, BrokerError> {
        self.channel.dispatch(command)
    }

    fn price_text(&self, seccode: &str, price: f64) -> Result<String, BrokerError> {
        let security = self
            .state()
            .security(seccode)
            .ok_or_else(|| BrokerError::InvalidRequest(format!("unknown security {seccode}")))?;
        Ok(security.format_price(price))
    }

    fn select_server(&self, requested: Option<ServerAddress>) -> ServerAddress {
        if let Some(server) = requested {
            return server;
        }
        match (&self.config.backup_server, self.state().session().backup_server) {
            (Some(backup), true) => backup.clone(),
            _ => self.config.server.clone(),
        }
    }
}

impl Connector for TransaqConnector {
    fn venue(&self) -> &str {
        self.base.venue()
    }

    fn connect(&mut self, credentials: Credentials) -> Result<(), BrokerError> {
        let Credentials::Login {
            login,
            password,
            server,
        } = credentials
        else {
            return Err(BrokerError::InvalidRequest(
                "native connector needs login credentials".to_string(),
            ));
        };

        self.base.reset_session();
        self.base.transition(ConnectionState::Connecting);
        self.base.flush()?;

        let server = self.select_server(server);
        info!(login = %login, server = %server, "connecting");
        let command = Command::connect(&ConnectParams {
            login: &login,
            password: &password,
            server: &server,
            rqdelay: self.config.rqdelay,
            session_timeout: self.config.session_timeout,
            request_timeout: self.config.request_timeout,
        });
        match self.dispatch(command) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.base.transition(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.base.transition(ConnectionState::Disconnecting);
        let result = self.dispatch(Command::disconnect()).map(|_| ());
        if result.is_err() {
            self.base.transition(ConnectionState::Disconnected);
        }
        self.base.reset_session();
        result
    }

    fn send_order(&mut self, request: &OrderRequest) -> Result<CommandReceipt, BrokerError> {
        self.base.require_connected()?;
        let price = self.price_text(&request.security.seccode, request.price)?;
        let quantity = format_quantity(request.quantity);
        let client = request.client.as_deref().or(self.config.default_client.as_deref());
        let union = request.union.as_deref().or(self.config.default_union.as_deref());
        let receipt = self.dispatch(Command::new_order(&NewOrder {
            security: &request.security,
            client,
            union,
            price: &price,
            quantity: &quantity,
            side: request.side,
            by_market: request.by_market,
        }))?;

        if let Some(transaction_id) = receipt.transaction_id {
            let mut order = Order::new(transaction_id);
            order.seccode = request.security.seccode.clone();
            order.board = request.security.board.clone();
            order.client = client.map(str::to_string);
            order.union = union.map(str::to_string);
            order.side = Some(request.side);
            order.price = request.price;
            order.quantity = request.quantity;
            order.balance = request.quantity;
            order.placed_at = Some(Local::now().naive_local());
            order.attribution = request.attribution.clone();
            self.base.submit_local_order(order);
        } else {
            warn!(seccode = %request.security.seccode, "order accepted without transaction id");
        }
        Ok(receipt)
    }

    fn replace_order(&mut self, request: &ReplaceRequest) -> Result<CommandReceipt, BrokerError> {
        self.base.require_connected()?;
        let price = self.price_text(&request.security.seccode, request.price)?;
        let quantity = request.quantity.map(format_quantity);
        self.dispatch(Command::move_order(
            request.transaction_id,
            &price,
            quantity.as_deref(),
        ))
    }

    fn cancel_order(&mut self, request: &CancelRequest) -> Result<CommandReceipt, BrokerError> {
        self.base.require_connected()?;
        self.dispatch(Command::cancel_order(request.transaction_id))
    }

    fn subscribe(&mut self, security: &SecurityKey) -> Result<(), BrokerError> {
        self.base.require_connected()?;
        self.dispatch(Command::subscribe_ticks(security)).map(|_| ())
    }

    fn unsubscribe(&mut self, security: &SecurityKey) -> Result<(), BrokerError> {
        self.base.require_connected()?;
        self.dispatch(Command::unsubscribe_ticks(security)).map(|_| ())
    }

    fn request_historical_bars(
        &mut self,
        security: &SecurityKey,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<(), BrokerError> {
        self.base.require_connected()?;
        let kind = self.state().candle_kind_for(timeframe).ok_or_else(|| {
            BrokerError::InvalidRequest(format!("broker offers no {timeframe} candles"))
        })?;
        self.dispatch(Command::history(security, kind.id, count, true)).map(|_| ())
    }

    fn request_security_info(&mut self, security: &SecurityKey) -> Result<(), BrokerError> {
        self.base.require_connected()?;
        let market = self
            .state()
            .security(&security.seccode)
            .and_then(|s| s.market)
            .ok_or_else(|| {
                BrokerError::InvalidRequest(format!("market of {} is unknown", security.seccode))
            })?;
        self.dispatch(Command::securities_info(market, &security.seccode)).map(|_| ())
    }

    fn request_portfolio_info(&mut self) -> Result<(), BrokerError> {
        self.base.require_connected()?;
        let union = self
            .config
            .default_union
            .clone()
            .or_else(|| self.state().clients().into_iter().find_map(|c| c.union))
            .ok_or_else(|| BrokerError::InvalidRequest("no union to query".to_string()))?;
        self.dispatch(Command::portfolio(&union)).map(|_| ())
    }

    fn state(&self) -> StateView {
        self.base.state_view()
    }

    fn heartbeat(&mut self) -> Result<(), BrokerError> {
        self.dispatch(Command::server_status()).map(|_| ())
    }
}

impl Drop for TransaqConnector {
    fn drop(&mut self) {
        if self.connection_state() != ConnectionState::Disconnected {
            if let Err(err) = self.disconnect() {
                warn!(error = %err, "disconnect on shutdown failed");
            }
        }
        self.transport.clear_callback();
        self.base.shutdown();
        if let Err(err) = self.transport.uninitialize() {
            warn!(error = %err, "uninitialize failed");
        }
    }
}

fn format_quantity(quantity: f64) -> String {
    if quantity.fract() == 0.0 {
        format!("{quantity:.0}")
    } else {
        quantity.to_string()
    }
}
