//! Native XML payloads: decoding into [`Section`] and applying to state.
//!
//! Every callback payload is one document whose root element names the
//! section. Decoding is pure; [`TransaqHandler`] applies the decoded section
//! on the ingestion thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use market::{BarRow, Bars, Distributor};
use roxmltree::{Document, Node};
use tracing::{debug, error, info, warn};
use tradelink::{
    ClientAccount, CandleKind, ConnectionState, Market, MoneyPosition, OrderCondition, OrderStatus,
    PortfolioPosition, PortfolioSnapshot, PriceBounds, SecPosition, Security, SecurityInfo, Side,
    TickPrint, Trade, UnitedLimits, decimals_of_step,
};

use crate::codec::{
    child, elements, field, number_or_zero, optional, optional_bool, optional_datetime,
    optional_string, parse_native_datetime, required, required_datetime, required_text,
};
use crate::error::BrokerError;
use crate::identity::OrderUpdate;
use crate::ingest::MessageHandler;
use crate::recalc::RecalcScheduler;
use crate::session::{merge_history_batch, on_live_update};
use crate::state::TradingState;

#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    Orders(Vec<OrderUpdate>),
    Trades(Vec<Trade>),
    Positions(Vec<PositionRow>),
    Candles(CandleBatch),
    ServerStatus(ServerStatus),
    Portfolio(PortfolioSnapshot),
    Securities(Vec<Security>),
    Markets(Vec<Market>),
    CandleKinds(Vec<CandleKind>),
    Client { account: ClientAccount, remove: bool },
    SecInfo(SecInfoRow),
    SecInfoUpdate(SecInfoRow),
    Permissions(SecInfoRow),
    AllTrades(Vec<TickPrint>),
    Messages(Vec<String>),
    Error(String),
    /// A command answer that arrived after its caller gave up waiting.
    CommandResult(String),
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PositionRow {
    Security(SecPosition),
    Money(MoneyPosition),
    Limits(UnitedLimits),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleStatus {
    /// No older data exists.
    Exhausted,
    /// The requested count was delivered.
    Complete,
    /// More packets for the same request follow.
    Continues,
    Unavailable,
}

impl CandleStatus {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Exhausted),
            1 => Some(Self::Complete),
            2 => Some(Self::Continues),
            3 => Some(Self::Unavailable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandleBatch {
    pub seccode: String,
    pub board: Option<String>,
    pub period: u32,
    pub status: CandleStatus,
    pub rows: Vec<BarRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connected {
    Yes,
    No,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub connected: Connected,
    pub recover: bool,
    pub server_tz: Option<String>,
    pub message: Option<String>,
}

/// Risk parameters for one instrument; `None` fields leave stored values.
#[derive(Debug, Clone, PartialEq)]
pub struct SecInfoRow {
    pub seccode: String,
    pub info: SecurityInfo,
}

pub fn decode(payload: &str) -> Result<Section, BrokerError> {
    let doc = Document::parse(payload)?;
    let root = doc.root_element();
    let section = match root.tag_name().name() {
        "orders" => Section::Orders(
            elements(root, "order").map(decode_order).collect::<Result<_, _>>()?,
        ),
        "trades" => Section::Trades(
            elements(root, "trade").map(decode_trade).collect::<Result<_, _>>()?,
        ),
        "positions" => Section::Positions(
            root.children()
                .filter(Node::is_element)
                .filter_map(|node| decode_position(node).transpose())
                .collect::<Result<_, _>>()?,
        ),
        "sec_position" | "forts_position" | "money_position" | "united_limits" => {
            Section::Positions(decode_position(root)?.into_iter().collect())
        }
        "candles" => Section::Candles(decode_candles(root)?),
        "server_status" => Section::ServerStatus(decode_server_status(root)),
        "mc_portfolio" => Section::Portfolio(decode_portfolio(root)?),
        "securities" => Section::Securities(
            elements(root, "security").map(decode_security).collect::<Result<_, _>>()?,
        ),
        "markets" => Section::Markets(
            elements(root, "market").map(decode_market).collect::<Result<_, _>>()?,
        ),
        "candlekinds" => Section::CandleKinds(
            elements(root, "kind").map(decode_candle_kind).collect::<Result<_, _>>()?,
        ),
        "client" => Section::Client {
            account: decode_client(root)?,
            remove: optional_bool(root, "remove").unwrap_or(false),
        },
        "sec_info" => Section::SecInfo(decode_sec_info(root)?),
        "sec_info_upd" => Section::SecInfoUpdate(decode_sec_info(root)?),
        "cln_sec_permissions" => Section::Permissions(decode_sec_info(root)?),
        "alltrades" => Section::AllTrades(
            elements(root, "trade").map(decode_tick).collect::<Result<_, _>>()?,
        ),
        "messages" => Section::Messages(
            elements(root, "message")
                .filter_map(|m| field(m, "text").map(str::to_string))
                .collect(),
        ),
        "error" => Section::Error(root.text().map(str::trim).unwrap_or_default().to_string()),
        "result" => Section::CommandResult(payload.to_string()),
        other => Section::Unknown(other.to_string()),
    };
    Ok(section)
}

fn decode_order(node: Node<'_, '_>) -> Result<OrderUpdate, BrokerError> {
    let status = field(node, "status").and_then(|word| {
        let status = OrderStatus::from_wire(word);
        if status.is_none() {
            warn!(status = word, "unknown order status, keeping previous");
        }
        status
    });
    let condition = optional_string(node, "condition")
        .filter(|kind| !kind.eq_ignore_ascii_case("none"))
        .map(|kind| OrderCondition {
            kind,
            value: optional(node, "conditionvalue"),
            valid_after: optional_datetime(node, "validafter"),
            valid_before: optional_datetime(node, "validbefore"),
        });
    Ok(OrderUpdate {
        transaction_id: required(node, "transactionid")?,
        order_no: optional::<u64>(node, "orderno").filter(|no| *no != 0),
        seccode: optional_string(node, "seccode"),
        board: optional_string(node, "board"),
        client: optional_string(node, "client"),
        union: optional_string(node, "union"),
        side: field(node, "buysell").and_then(|s| Side::parse(s).ok()),
        status,
        placed_at: optional_datetime(node, "time"),
        accepted_at: optional_datetime(node, "accepttime"),
        withdrawn_at: optional_datetime(node, "withdrawtime"),
        price: optional(node, "price"),
        quantity: optional(node, "quantity"),
        balance: optional(node, "balance"),
        condition,
        result: optional_string(node, "result"),
    })
}

fn decode_trade(node: Node<'_, '_>) -> Result<Trade, BrokerError> {
    Ok(Trade {
        trade_no: required(node, "tradeno")?,
        order_no: optional::<u64>(node, "orderno").filter(|no| *no != 0),
        seccode: required_text(node, "seccode")?.to_string(),
        board: optional_string(node, "board").unwrap_or_default(),
        side: field(node, "buysell").and_then(|s| Side::parse(s).ok()),
        price: number_or_zero(node, "price"),
        quantity: number_or_zero(node, "quantity"),
        time: optional_datetime(node, "time"),
        value: optional(node, "value"),
        commission: optional(node, "comission").or_else(|| optional(node, "commission")),
        attribution: Default::default(),
    })
}

fn decode_position(node: Node<'_, '_>) -> Result<Option<PositionRow>, BrokerError> {
    let row = match node.tag_name().name() {
        "sec_position" => PositionRow::Security(SecPosition {
            seccode: required_text(node, "seccode")?.to_string(),
            market: optional(node, "market"),
            client: optional_string(node, "client"),
            open_balance: number_or_zero(node, "saldoin"),
            balance: number_or_zero(node, "saldo"),
            pl: number_or_zero(node, "pl"),
            amount: optional(node, "amount"),
            equity: optional(node, "equity"),
            entry_price: None,
        }),
        "forts_position" => PositionRow::Security(SecPosition {
            seccode: required_text(node, "seccode")?.to_string(),
            market: optional(node, "market"),
            client: optional_string(node, "client"),
            open_balance: number_or_zero(node, "startnet"),
            balance: number_or_zero(node, "totalnet"),
            pl: number_or_zero(node, "varmargin"),
            amount: None,
            equity: None,
            entry_price: None,
        }),
        "money_position" => PositionRow::Money(MoneyPosition {
            shortname: required_text(node, "shortname")?.to_string(),
            open_balance: number_or_zero(node, "saldoin"),
            balance: number_or_zero(node, "saldo"),
            unrealized_pnl: None,
        }),
        "united_limits" => PositionRow::Limits(UnitedLimits {
            union: required_text(node, "union")?.to_string(),
            open_equity: optional(node, "open_equity"),
            equity: number_or_zero(node, "equity"),
            requirements: number_or_zero(node, "requirements"),
            free: number_or_zero(node, "free"),
            vm: number_or_zero(node, "vm"),
            finres: number_or_zero(node, "finres"),
            go: number_or_zero(node, "go"),
        }),
        other => {
            debug!(element = other, "position row ignored");
            return Ok(None);
        }
    };
    Ok(Some(row))
}

fn decode_candles(node: Node<'_, '_>) -> Result<CandleBatch, BrokerError> {
    let code: u8 = optional(node, "status").unwrap_or(1);
    let status = CandleStatus::from_code(code)
        .ok_or_else(|| BrokerError::Malformed(format!("<candles> has unknown status {code}")))?;
    let rows = elements(node, "candle")
        .filter_map(|candle| match decode_candle(candle) {
            Ok(row) => Some(row),
            Err(err) => {
                warn!(error = %err, "candle row skipped");
                None
            }
        })
        .collect();
    Ok(CandleBatch {
        seccode: required_text(node, "seccode")?.to_string(),
        board: optional_string(node, "board"),
        period: required(node, "period")?,
        status,
        rows,
    })
}

fn decode_candle(node: Node<'_, '_>) -> Result<BarRow, BrokerError> {
    Ok(BarRow::new(
        required_datetime(node, "date")?,
        required(node, "open")?,
        required(node, "high")?,
        required(node, "low")?,
        required(node, "close")?,
        number_or_zero(node, "volume"),
    ))
}

fn decode_server_status(node: Node<'_, '_>) -> ServerStatus {
    let connected = match node.attribute("connected").map(str::trim) {
        Some("true") => Connected::Yes,
        Some("error") => Connected::Error,
        _ => Connected::No,
    };
    ServerStatus {
        connected,
        recover: node.attribute("recover") == Some("true"),
        server_tz: node.attribute("server_tz").map(str::to_string),
        message: node
            .text()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string),
    }
}

fn decode_portfolio(node: Node<'_, '_>) -> Result<PortfolioSnapshot, BrokerError> {
    let union = field(node, "union")
        .or_else(|| field(node, "client"))
        .ok_or_else(|| BrokerError::Malformed("<mc_portfolio> without union".to_string()))?;
    let positions = elements(node, "security")
        .map(|sec| {
            Ok(PortfolioPosition {
                seccode: required_text(sec, "seccode")?.to_string(),
                market: optional(sec, "market"),
                open_balance: number_or_zero(sec, "open_balance"),
                balance: number_or_zero(sec, "balance"),
                pl: number_or_zero(sec, "pl"),
            })
        })
        .collect::<Result<_, BrokerError>>()?;
    Ok(PortfolioSnapshot {
        union: union.to_string(),
        open_equity: number_or_zero(node, "open_equity"),
        equity: number_or_zero(node, "equity"),
        pl: number_or_zero(node, "pl"),
        init_req: number_or_zero(node, "init_req"),
        maint_req: number_or_zero(node, "maint_req"),
        unrealized_pnl: number_or_zero(node, "unrealized_pnl"),
        positions,
    })
}

fn decode_security(node: Node<'_, '_>) -> Result<Security, BrokerError> {
    let mut security = Security::new(
        required_text(node, "seccode")?,
        optional_string(node, "board").unwrap_or_default(),
    );
    security.secid = optional(node, "secid");
    security.market = optional(node, "market");
    security.shortname = optional_string(node, "shortname").unwrap_or_default();
    security.currency = optional_string(node, "currency").unwrap_or_default();
    security.active = optional_bool(node, "active").unwrap_or(true);
    if let Some(step) = optional::<f64>(node, "minstep").filter(|s| *s > 0.0) {
        security.min_step = step;
        security.decimals = decimals_of_step(step);
    }
    if let Some(decimals) = optional(node, "decimals") {
        security.decimals = decimals;
    }
    if let Some(lot_size) = optional(node, "lotsize") {
        security.lot_size = lot_size;
    }
    if let Some(point_cost) = optional(node, "point_cost") {
        security.point_cost = point_cost;
    }
    Ok(security)
}

fn decode_market(node: Node<'_, '_>) -> Result<Market, BrokerError> {
    Ok(Market {
        id: required(node, "id")?,
        name: node.text().map(str::trim).unwrap_or_default().to_string(),
    })
}

fn decode_candle_kind(node: Node<'_, '_>) -> Result<CandleKind, BrokerError> {
    Ok(CandleKind {
        id: required(node, "id")?,
        period_secs: required(node, "period")?,
        name: optional_string(node, "name").unwrap_or_default(),
    })
}

fn decode_client(node: Node<'_, '_>) -> Result<ClientAccount, BrokerError> {
    Ok(ClientAccount {
        id: required_text(node, "id")?.to_string(),
        market: optional(node, "market"),
        currency: optional_string(node, "currency"),
        kind: optional_string(node, "type"),
        union: optional_string(node, "union"),
        forts_account: optional_string(node, "forts_acc"),
    })
}

fn decode_sec_info(node: Node<'_, '_>) -> Result<SecInfoRow, BrokerError> {
    Ok(SecInfoRow {
        seccode: required_text(node, "seccode")?.to_string(),
        info: SecurityInfo {
            name: optional_string(node, "secname"),
            maturity: optional_string(node, "mat_date"),
            clearing_price: optional(node, "clearing_price"),
            min_price: optional(node, "minprice"),
            max_price: optional(node, "maxprice"),
            buy_deposit: optional(node, "buy_deposit"),
            sell_deposit: optional(node, "sell_deposit"),
            point_cost: optional(node, "point_cost"),
            riskrate_long: optional(node, "riskrate_long"),
            reserate_long: optional(node, "reserate_long"),
            riskrate_short: optional(node, "riskrate_short"),
            reserate_short: optional(node, "reserate_short"),
        },
    })
}

fn decode_tick(node: Node<'_, '_>) -> Result<TickPrint, BrokerError> {
    Ok(TickPrint {
        seccode: required_text(node, "seccode")?.to_string(),
        datetime: required_datetime(node, "time")?,
        price: required(node, "price")?,
        quantity: number_or_zero(node, "quantity"),
        side: field(node, "buysell").and_then(|s| Side::parse(s).ok()),
        trade_no: optional(node, "tradeno"),
        open_interest: optional(node, "openinterest"),
    })
}

/// Copies every field the update carries onto `target`.
pub fn merge_info(target: &mut SecurityInfo, update: SecurityInfo) {
    fn keep<T>(slot: &mut Option<T>, value: Option<T>) {
        if value.is_some() {
            *slot = value;
        }
    }
    keep(&mut target.name, update.name);
    keep(&mut target.maturity, update.maturity);
    keep(&mut target.clearing_price, update.clearing_price);
    keep(&mut target.min_price, update.min_price);
    keep(&mut target.max_price, update.max_price);
    keep(&mut target.buy_deposit, update.buy_deposit);
    keep(&mut target.sell_deposit, update.sell_deposit);
    keep(&mut target.point_cost, update.point_cost);
    keep(&mut target.riskrate_long, update.riskrate_long);
    keep(&mut target.reserate_long, update.reserate_long);
    keep(&mut target.riskrate_short, update.riskrate_short);
    keep(&mut target.reserate_short, update.reserate_short);
}

/// Applies decoded sections to the trading state on the ingestion thread.
pub struct TransaqHandler {
    recalc: Arc<RecalcScheduler>,
    distributor: Arc<Distributor>,
    recover_window: Duration,
    pending_candles: HashMap<(String, u32), Vec<BarRow>>,
}

impl TransaqHandler {
    pub fn new(recalc: Arc<RecalcScheduler>, distributor: Arc<Distributor>, recover_window: Duration) -> Self {
        Self {
            recalc,
            distributor,
            recover_window,
            pending_candles: HashMap::new(),
        }
    }

    pub fn apply(&mut self, state: &mut TradingState, section: Section) -> Result<(), BrokerError> {
        match section {
            Section::Orders(updates) => {
                let now = local_now();
                for update in updates {
                    let resolution = state.resolve_order(update, now);
                    if resolution.created || resolution.promoted || resolution.duplicates_removed > 0 {
                        debug!(
                            transaction_id = resolution.transaction_id,
                            order_no = ?resolution.order_no,
                            created = resolution.created,
                            promoted = resolution.promoted,
                            "order identity resolved"
                        );
                    }
                }
            }
            Section::Trades(trades) => {
                for trade in trades {
                    state.record_trade(trade);
                }
            }
            Section::Positions(rows) => {
                for row in rows {
                    match row {
                        PositionRow::Security(position) => {
                            state.positions.insert(position.seccode.clone(), position);
                        }
                        PositionRow::Money(money) => {
                            state.money.insert(money.shortname.clone(), money);
                        }
                        PositionRow::Limits(limits) => {
                            state.limits.insert(limits.union.clone(), limits);
                        }
                    }
                }
            }
            Section::Candles(batch) => self.apply_candles(state, batch)?,
            Section::ServerStatus(status) => self.apply_server_status(state, status),
            Section::Portfolio(portfolio) => {
                state.portfolios.insert(portfolio.union.clone(), portfolio);
            }
            Section::Securities(securities) => {
                for mut security in securities {
                    if let Some(previous) = state.securities.remove(&security.seccode) {
                        security.info = previous.info;
                        security.price_bounds = previous.price_bounds;
                        security.last_trade = previous.last_trade;
                    }
                    state.securities.insert(security.seccode.clone(), security);
                }
            }
            Section::Markets(markets) => {
                for market in markets {
                    state.markets.insert(market.id, market);
                }
            }
            Section::CandleKinds(kinds) => {
                for kind in kinds {
                    state.candle_kinds.insert(kind.id, kind);
                }
            }
            Section::Client { account, remove } => {
                if remove {
                    state.clients.remove(&account.id);
                } else {
                    state.clients.insert(account.id.clone(), account);
                }
            }
            Section::SecInfo(row) | Section::SecInfoUpdate(row) | Section::Permissions(row) => {
                let Some(security) = state.securities.get_mut(&row.seccode) else {
                    debug!(seccode = %row.seccode, "risk parameters for unknown security");
                    return Ok(());
                };
                merge_info(&mut security.info, row.info);
                if let (Some(min_price), Some(max_price)) = (security.info.min_price, security.info.max_price) {
                    security.price_bounds = Some(PriceBounds { min_price, max_price });
                }
                if let Some(point_cost) = security.info.point_cost {
                    security.point_cost = point_cost;
                }
            }
            Section::AllTrades(ticks) => self.apply_ticks(state, ticks)?,
            Section::Messages(messages) => {
                for message in messages {
                    info!(message = %message, "broker message");
                }
            }
            Section::Error(message) => error!(error = %message, "broker error"),
            Section::CommandResult(raw) => debug!(response = %raw, "late command response"),
            Section::Unknown(tag) => debug!(section = %tag, "unhandled section"),
        }
        Ok(())
    }

    fn apply_candles(&mut self, state: &mut TradingState, batch: CandleBatch) -> Result<(), BrokerError> {
        let key = (batch.seccode.clone(), batch.period);
        match batch.status {
            CandleStatus::Unavailable => {
                self.pending_candles.remove(&key);
                warn!(seccode = %batch.seccode, period = batch.period, "history unavailable");
                return Ok(());
            }
            CandleStatus::Continues => {
                self.pending_candles.entry(key).or_default().extend(batch.rows);
                return Ok(());
            }
            CandleStatus::Exhausted | CandleStatus::Complete => {}
        }

        let mut rows = self.pending_candles.remove(&key).unwrap_or_default();
        rows.extend(batch.rows);
        let timeframe = state
            .candle_kinds
            .get(&batch.period)
            .ok_or_else(|| BrokerError::Malformed(format!("unknown candle period id {}", batch.period)))?
            .timeframe()
            .map_err(|err| BrokerError::Malformed(err.to_string()))?;
        rows.sort_by_key(|row| row.datetime);
        rows.dedup_by_key(|row| row.datetime);
        let bars = Bars::from_rows(timeframe, rows)?;
        merge_history_batch(state, &self.distributor, &batch.seccode, bars);
        Ok(())
    }

    fn apply_server_status(&mut self, state: &mut TradingState, status: ServerStatus) {
        let session = &mut state.session;
        match (status.connected, status.recover) {
            (Connected::Yes, false) => {
                session.connection = ConnectionState::Connected;
                session.server_available = true;
                session.reconnect_deadline = None;
                session.last_error = None;
                info!(server_tz = ?status.server_tz, "connected");
            }
            (Connected::Yes, true) => {
                session.connection = ConnectionState::Connecting;
                session.reconnect_deadline = Some(Instant::now() + self.recover_window);
                info!("connection recovering");
            }
            (Connected::No, _) => {
                session.connection = ConnectionState::Disconnected;
                session.server_available = false;
                session.reconnect_deadline = None;
                info!("disconnected");
                state.reset_session();
            }
            (Connected::Error, _) => {
                session.connection = ConnectionState::Disconnected;
                session.server_available = false;
                session.reconnect_deadline = None;
                session.backup_server = !session.backup_server;
                session.last_error = status.message.clone();
                error!(
                    error = status.message.as_deref().unwrap_or("unspecified"),
                    backup_server = session.backup_server,
                    "connection error"
                );
                state.reset_session();
            }
        }
        self.pending_candles.clear();
    }

    fn apply_ticks(&mut self, state: &mut TradingState, ticks: Vec<TickPrint>) -> Result<(), BrokerError> {
        for tick in ticks {
            let seccode = tick.seccode.clone();
            let (datetime, price, quantity) = (tick.datetime, tick.price, tick.quantity);
            if let Some(security) = state.securities.get_mut(&seccode) {
                security.last_trade = Some(tick);
            }
            let series = state.series_mut(&seccode);
            let Some(timeframe) = series.source().map(|s| s.timeframe()) else {
                continue;
            };
            let update = series.apply_tick(datetime, price, quantity)?;
            on_live_update(&update, &seccode, timeframe, &self.distributor, &self.recalc);
        }
        Ok(())
    }
}

impl MessageHandler for TransaqHandler {
    type Message = String;

    fn handle(&mut self, state: &mut TradingState, message: String) -> Result<(), BrokerError> {
        let section = decode(&message)?;
        self.apply(state, section)
    }
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use tradelink::{OrderStatus, Side};

    use super::{decode, CandleStatus, Connected, PositionRow, Section};
    use crate::BrokerError;

    #[test]
    fn orders_decode_with_pending_order_number() {
        let section = decode(
            r#"<orders><order transactionid="15"><orderno>0</orderno><seccode>ABC</seccode>
               <board>TQBR</board><status>active</status><buysell>B</buysell>
               <price>101.5</price><quantity>3</quantity><balance>3</balance>
               <time>01.03.2024 10:00:01.250</time><condition>None</condition></order></orders>"#,
        )
        .expect("valid orders");
        let Section::Orders(updates) = section else {
            panic!("expected orders, got {section:?}");
        };
        let update = &updates[0];
        assert_eq!(update.transaction_id, 15);
        assert_eq!(update.order_no, None);
        assert_eq!(update.status, Some(OrderStatus::Active));
        assert_eq!(update.side, Some(Side::Buy));
        assert!(update.condition.is_none());
        assert_eq!(
            update.placed_at.map(|t| t.and_utc().timestamp_subsec_millis()),
            Some(250)
        );
    }

    #[test]
    fn missing_identity_field_abandons_message() {
        assert!(matches!(
            decode("<trades><trade><seccode>ABC</seccode><price>1</price></trade></trades>"),
            Err(BrokerError::Malformed(msg)) if msg.contains("tradeno")
        ));
        assert!(matches!(decode("<orders><order/></orders>"), Err(BrokerError::Malformed(_))));
    }

    #[test]
    fn positions_mix_row_kinds() {
        let section = decode(
            r#"<positions>
                 <money_position><shortname>RUB</shortname><saldoin>1000</saldoin><saldo>950.5</saldo></money_position>
                 <sec_position><seccode>ABC</seccode><market>1</market><saldo>10</saldo></sec_position>
                 <united_limits><union>U1</union><equity>5000</equity><free>bad</free></united_limits>
               </positions>"#,
        )
        .expect("valid positions");
        let Section::Positions(rows) = section else {
            panic!("expected positions");
        };
        assert_eq!(rows.len(), 3);
        assert!(matches!(&rows[0], PositionRow::Money(m) if m.balance == 950.5));
        assert!(matches!(&rows[2], PositionRow::Limits(l) if l.free == 0.0 && l.equity == 5000.0));
    }

    #[test]
    fn candles_and_server_status() {
        let section = decode(
            r#"<candles secid="1" period="2" status="2" board="TQBR" seccode="ABC">
                 <candle date="01.03.2024 10:00:00" open="10" high="11" low="9.5" close="10.5" volume="100"/>
                 <candle date="broken" open="10" high="11" low="9.5" close="10.5"/>
               </candles>"#,
        )
        .expect("valid candles");
        let Section::Candles(batch) = section else {
            panic!("expected candles");
        };
        assert_eq!(batch.status, CandleStatus::Continues);
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(
            batch.rows[0].datetime,
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .and_then(|d| d.and_hms_opt(10, 0, 0))
                .expect("valid datetime")
        );

        let section = decode(r#"<server_status connected="error">Login failed</server_status>"#)
            .expect("valid status");
        assert!(matches!(
            section,
            Section::ServerStatus(ref s) if s.connected == Connected::Error
                && s.message.as_deref() == Some("Login failed")
        ));
    }

    #[test]
    fn unknown_section_is_not_an_error() {
        assert_eq!(
            decode("<quotations/>").expect("well-formed"),
            Section::Unknown("quotations".to_string())
        );
        assert!(decode("<orders>").is_err());
    }
}
