use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use market::{Distributor, MergeKind, SeriesConfig, SeriesEvent};
use tradelink::{Attribution, ConnectionState, OrderStatus, SecurityKey, Side, Timeframe};

use broker::adapters::transaq::{TransaqConfig, TransaqConnector};
use broker::recalc::RecalcConfig;
use broker::{
    BrokerError, CancelRequest, Connector, Credentials, LoggingSink, MockTransport, OrderRequest,
    ReplaceRequest,
};

const REFERENCE: &str = r#"<candlekinds>
    <kind><id>1</id><period>60</period><name>1 minute</name></kind>
    <kind><id>2</id><period>300</period><name>5 minutes</name></kind>
    <kind><id>4</id><period>3600</period><name>1 hour</name></kind>
</candlekinds>"#;

const SECURITIES: &str = r#"<securities>
    <security secid="7" active="true">
        <seccode>ABC</seccode><board>TQBR</board><market>1</market><shortname>Abc plc</shortname>
        <decimals>2</decimals><minstep>0.01</minstep><lotsize>10</lotsize>
    </security>
</securities>"#;

fn config() -> TransaqConfig {
    TransaqConfig {
        series: SeriesConfig {
            working_timeframe: Timeframe::M30,
            max_bars: None,
        },
        recalc: RecalcConfig {
            debounce: Duration::from_millis(20),
            history_count: 3,
        },
        request_timeout: Duration::from_secs(2),
        response_grace: Duration::ZERO,
        ..TransaqConfig::default()
    }
}

fn start(config: TransaqConfig) -> (TransaqConnector, Arc<MockTransport>, Arc<Distributor>) {
    let transport = Arc::new(MockTransport::new());
    let distributor = Arc::new(Distributor::new(64));
    let connector = TransaqConnector::start(
        config,
        transport.clone(),
        Arc::new(LoggingSink),
        Arc::clone(&distributor),
    )
    .expect("mock transport initializes");
    (connector, transport, distributor)
}

fn connected(config: TransaqConfig) -> (TransaqConnector, Arc<MockTransport>, Arc<Distributor>) {
    let (mut connector, transport, distributor) = start(config);
    connector
        .connect(Credentials::login("trader", "hunter2"))
        .expect("connect accepted");
    transport.push(REFERENCE);
    transport.push(SECURITIES);
    connector.flush().expect("reference data applied");
    assert_eq!(connector.connection_state(), ConnectionState::Connected);
    (connector, transport, distributor)
}

fn at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .expect("valid datetime")
}

fn candles(start: NaiveDateTime, count: i64) -> String {
    let rows: String = (0..count)
        .map(|i| {
            let date = start + ChronoDuration::minutes(5 * i);
            let close = 10.0 + i as f64 * 0.1;
            format!(
                r#"<candle date="{}" open="{close:.2}" high="{:.2}" low="{:.2}" close="{close:.2}" volume="100"/>"#,
                date.format("%d.%m.%Y %H:%M:%S"),
                close + 0.5,
                close - 0.5,
            )
        })
        .collect();
    format!(r#"<candles secid="7" period="2" status="1" board="TQBR" seccode="ABC">{rows}</candles>"#)
}

fn abc() -> SecurityKey {
    SecurityKey::new("TQBR", "ABC")
}

#[test]
fn history_request_is_compressed_into_working_timeframe() {
    let (mut connector, transport, distributor) = connected(config());
    let mut events = distributor.subscribe("ABC");

    connector
        .request_historical_bars(&abc(), Timeframe::M5, 25)
        .expect("five minute candles are offered");
    let request = transport
        .sent_commands()
        .into_iter()
        .find(|c| c.contains("gethistorydata"))
        .expect("history command sent");
    assert!(request.contains("<period>2</period>"));
    assert!(request.contains("<count>25</count>"));
    assert!(request.contains("<reset>true</reset>"));

    transport.push(candles(at(10, 0), 25));
    connector.flush().expect("candles applied");

    let snapshot = connector.state().series("ABC").expect("series stored");
    assert_eq!(snapshot.source.timeframe(), Timeframe::M5);
    assert_eq!(snapshot.source.len(), 25);
    assert_eq!(snapshot.bars.timeframe(), Timeframe::M30);
    assert_eq!(snapshot.bars.len(), 5);
    assert_eq!(snapshot.bars.datetime().first(), Some(&at(10, 0)));
    assert_eq!(snapshot.bars.datetime().last(), Some(&at(12, 0)));

    // 10:00 bucket holds the six candles 10:00..10:25.
    let first = snapshot.bars.row(0).expect("first bucket");
    assert_eq!(first.open, 10.0);
    assert_eq!(first.close, 10.5);
    assert_eq!(first.high, 11.0);
    assert_eq!(first.low, 9.5);
    assert_eq!(first.volume, 600.0);
    let last = snapshot.bars.last().expect("last bucket");
    assert_eq!((last.open, last.close, last.volume), (12.4, 12.4, 100.0));

    assert_eq!(
        events.try_recv().expect("reconciled event"),
        SeriesEvent::Reconciled {
            seccode: "ABC".to_string(),
            merge: MergeKind::Replaced,
            len: 25,
        }
    );
}

#[test]
fn unsupported_history_period_is_refused_locally() {
    let (mut connector, _transport, _distributor) = connected(config());
    assert!(matches!(
        connector.request_historical_bars(&abc(), Timeframe::M15, 10),
        Err(BrokerError::InvalidRequest(_))
    ));
}

#[test]
fn tick_opening_a_bar_schedules_history_rerequest() {
    let (mut connector, transport, distributor) = connected(config());
    connector
        .request_historical_bars(&abc(), Timeframe::M5, 25)
        .expect("history requested");
    transport.push(candles(at(10, 0), 25));
    connector.flush().expect("candles applied");

    let mut events = distributor.subscribe("ABC");
    transport.push(
        r#"<alltrades><trade><seccode>ABC</seccode><board>TQBR</board><tradeno>9001</tradeno>
            <time>01.03.2024 12:05:10</time><price>12.9</price><quantity>5</quantity><buysell>B</buysell>
        </trade></alltrades>"#,
    );
    connector.flush().expect("tick applied");

    assert_eq!(
        events.try_recv().expect("bar opened event"),
        SeriesEvent::BarOpened {
            seccode: "ABC".to_string(),
            opened_at: at(12, 5),
        }
    );
    let security = connector.state().security("ABC").expect("security known");
    assert_eq!(security.last_trade.map(|t| t.price), Some(12.9));
    let source = connector.state().series("ABC").expect("series").source;
    assert_eq!(source.len(), 26);

    thread::sleep(Duration::from_millis(300));
    let rerequest = transport
        .sent_commands()
        .into_iter()
        .filter(|c| c.contains("gethistorydata"))
        .nth(1)
        .expect("debounced history re-request");
    assert!(rerequest.contains("<count>3</count>"));
    assert!(connector.base().recalc().pending() <= 1);
}

#[test]
fn replaced_order_keeps_one_identity_and_attribution() {
    let (mut connector, transport, _distributor) = connected(config());

    let attribution = Attribution {
        sender: Some("breakout".to_string()),
        signal: Some("long-entry".to_string()),
        note: None,
    };
    let request = OrderRequest::limit(abc(), Side::Buy, 101.5, 3.0)
        .expect("valid order")
        .with_client("C1")
        .with_attribution(attribution.clone());
    let receipt = connector.send_order(&request).expect("order accepted");
    assert_eq!(receipt.transaction_id, Some(1));
    let sent = transport.sent_commands();
    let new_order = sent.iter().find(|c| c.contains("neworder")).expect("neworder sent");
    assert!(new_order.contains("<price>101.50</price>"));
    assert!(new_order.contains("<quantity>3</quantity>"));

    transport.push(
        r#"<orders><order transactionid="1"><orderno>0</orderno><seccode>ABC</seccode><board>TQBR</board>
            <status>forwarding</status><buysell>B</buysell><price>101.5</price><quantity>3</quantity></order></orders>"#,
    );
    transport.push(
        r#"<orders><order transactionid="1"><orderno>555</orderno><seccode>ABC</seccode><board>TQBR</board>
            <status>active</status><balance>3</balance></order></orders>"#,
    );
    connector.flush().expect("order updates applied");

    let replace = ReplaceRequest::new(abc(), 1, 101.0).expect("valid replace");
    let receipt = connector.replace_order(&replace).expect("move accepted");
    assert_eq!(receipt.transaction_id, Some(2));

    transport.push(
        r#"<orders><order transactionid="2"><orderno>555</orderno><seccode>ABC</seccode>
            <status>active</status><price>101</price><balance>3</balance></order></orders>"#,
    );
    transport.push(
        r#"<trades><trade><tradeno>77</tradeno><orderno>555</orderno><seccode>ABC</seccode><board>TQBR</board>
            <buysell>B</buysell><price>101</price><quantity>3</quantity><time>01.03.2024 10:15:00</time></trade></trades>"#,
    );
    connector.flush().expect("replacement applied");

    let view = connector.state();
    let orders = view.orders();
    assert_eq!(orders.len(), 1);
    let order = &orders[0];
    assert_eq!(order.order_no, Some(555));
    assert_eq!(order.transaction_ids, vec![1, 2]);
    assert_eq!(order.status, OrderStatus::Active);
    assert_eq!(order.price, 101.0);
    assert_eq!(order.attribution, attribution);
    assert_eq!(view.order_by_transaction(2).map(|o| o.order_no), Some(Some(555)));

    let trade = view.trade(77).expect("trade recorded");
    assert_eq!(trade.attribution, attribution);

    let cancel = CancelRequest::new(abc(), 2).expect("valid cancel");
    connector.cancel_order(&cancel).expect("cancel accepted");
    assert!(transport.sent_commands().iter().any(|c| c.contains("cancelorder")));
}

#[test]
fn broker_rejection_is_reported_verbatim() {
    let (mut connector, transport, _distributor) = connected(config());
    transport.reject_next("Insufficient funds");
    let request = OrderRequest::limit(abc(), Side::Sell, 99.0, 1.0).expect("valid order");
    assert!(matches!(
        connector.send_order(&request),
        Err(BrokerError::Rejected(message)) if message.contains("Insufficient funds")
    ));
    assert!(connector.state().orders().is_empty());
}

#[test]
fn commands_require_a_session() {
    let (mut connector, _transport, _distributor) = start(config());
    let request = OrderRequest::market(abc(), Side::Buy, 1.0).expect("valid order");
    assert!(matches!(connector.send_order(&request), Err(BrokerError::NotConnected)));
    assert!(matches!(connector.subscribe(&abc()), Err(BrokerError::NotConnected)));
    assert!(matches!(
        connector.connect(Credentials::api_key("key", "secret")),
        Err(BrokerError::InvalidRequest(_))
    ));
}

#[test]
fn slow_answer_times_out_and_arrives_later() {
    let (mut connector, transport, _distributor) = connected(TransaqConfig {
        request_timeout: Duration::from_millis(50),
        ..config()
    });
    let before = connector.base().metrics();

    transport.delay_responses(Duration::from_millis(300));
    assert!(matches!(connector.heartbeat(), Err(BrokerError::Timeout(_))));

    thread::sleep(Duration::from_millis(500));
    transport.delay_responses(Duration::ZERO);
    connector.flush().expect("late answer applied");
    let after = connector.base().metrics();
    assert_eq!(after.processed, before.processed + 1);
    assert_eq!(after.failed, before.failed);
}

#[test]
fn server_error_drops_session_and_reference_data() {
    let (connector, transport, _distributor) = connected(config());
    assert!(connector.state().security("ABC").is_some());

    transport.push(r#"<server_status connected="error">Server unavailable</server_status>"#);
    connector.flush().expect("status applied");

    let view = connector.state();
    let session = view.session();
    assert_eq!(session.connection, ConnectionState::Disconnected);
    assert!(session.backup_server);
    assert_eq!(session.last_error.as_deref(), Some("Server unavailable"));
    assert!(view.security("ABC").is_none());
    assert!(view.candle_kinds().is_empty());
}

#[test]
fn library_initialization_failure_is_fatal() {
    let transport = Arc::new(MockTransport::failing_initialize("license expired"));
    let result = TransaqConnector::start(
        config(),
        transport,
        Arc::new(LoggingSink),
        Arc::new(Distributor::default()),
    );
    assert!(matches!(result.err(), Some(BrokerError::Fatal(message)) if message.contains("license")));
}

#[test]
fn recovering_server_keeps_reference_data_until_restored() {
    let (connector, transport, _distributor) = connected(TransaqConfig {
        recover_window: Duration::from_secs(30),
        ..config()
    });

    transport.push(r#"<server_status connected="true" recover="true"/>"#);
    connector.flush().expect("status applied");
    let session = connector.state().session();
    assert_eq!(session.connection, ConnectionState::Connecting);
    let deadline = session.reconnect_deadline.expect("recovery deadline set");
    assert!(deadline > Instant::now() + Duration::from_secs(25));
    assert_eq!(connector.reconnect_deadline(), Some(deadline));
    assert!(connector.state().security("ABC").is_some());

    transport.push(r#"<server_status connected="true"/>"#);
    connector.flush().expect("status applied");
    let session = connector.state().session();
    assert_eq!(session.connection, ConnectionState::Connected);
    assert_eq!(session.reconnect_deadline, None);
}

#[test]
fn server_disconnect_drops_reference_data_without_failover() {
    let (connector, transport, _distributor) = connected(config());

    transport.push(r#"<server_status connected="false"/>"#);
    connector.flush().expect("status applied");

    let view = connector.state();
    let session = view.session();
    assert_eq!(session.connection, ConnectionState::Disconnected);
    assert!(!session.server_available);
    assert!(!session.backup_server);
    assert_eq!(session.last_error, None);
    assert!(view.security("ABC").is_none());
    assert!(view.candle_kinds().is_empty());
}
