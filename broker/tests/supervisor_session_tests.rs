use std::sync::Arc;
use std::thread;
use std::time::Duration;

use market::Distributor;
use tradelink::{ConnectionState, SecurityKey};

use broker::adapters::transaq::{TransaqConfig, TransaqConnector};
use broker::{Connector, Credentials, LifecycleConfig, LoggingSink, MockTransport, ReconnectPolicy, Supervisor};

fn lifecycle(connect_timeout_ms: u64) -> LifecycleConfig {
    LifecycleConfig {
        heartbeat_interval_ms: 60_000,
        heartbeat_timeout_ms: 60_000,
        connect_timeout_ms,
        reconnect: ReconnectPolicy {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            max_retries: 2,
        },
    }
}

fn supervisor(connect_timeout_ms: u64) -> (Supervisor<TransaqConnector>, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    transport.hold_session_status(true);
    let connector = TransaqConnector::start(
        TransaqConfig {
            response_grace: Duration::ZERO,
            ..TransaqConfig::default()
        },
        transport.clone(),
        Arc::new(LoggingSink),
        Arc::new(Distributor::default()),
    )
    .expect("mock transport initializes");
    (Supervisor::new(connector, lifecycle(connect_timeout_ms)), transport)
}

fn commands(transport: &MockTransport, kind: &str) -> usize {
    let id = format!("id=\"{kind}\"");
    transport.sent_commands().iter().filter(|c| c.contains(&id)).count()
}

#[test]
fn subscriptions_wait_for_a_late_session_status() {
    let (mut supervisor, transport) = supervisor(5_000);
    supervisor
        .subscribe(SecurityKey::new("TQBR", "ABC"))
        .expect("recorded while offline");
    assert!(supervisor.replay_pending());

    let server = Arc::clone(&transport);
    let status = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        server.push(r#"<server_status connected="true"/>"#);
    });

    supervisor
        .connect(Credentials::login("trader", "hunter2"))
        .expect("connect waits for the session");
    status.join().expect("status thread");

    assert_eq!(supervisor.connector().connection_state(), ConnectionState::Connected);
    assert_eq!(commands(&transport, "subscribe"), 1);
    assert_eq!(supervisor.stats().subscription_replays, 1);
    assert!(!supervisor.replay_pending());
}

#[test]
fn silent_session_is_retried_and_replayed_once_up() {
    let (mut supervisor, transport) = supervisor(50);
    supervisor
        .subscribe(SecurityKey::new("TQBR", "ABC"))
        .expect("recorded while offline");

    supervisor
        .connect(Credentials::login("trader", "hunter2"))
        .expect("accepted connect is not an error");
    assert_eq!(supervisor.connector().connection_state(), ConnectionState::Connecting);
    assert_eq!(commands(&transport, "subscribe"), 0);
    assert!(supervisor.replay_pending());

    thread::sleep(Duration::from_millis(80));
    assert!(!supervisor.is_alive());
    supervisor.ensure_live().expect("stalled connect is retried");
    assert_eq!(commands(&transport, "connect"), 2);
    assert_eq!(supervisor.stats().connect_failures, 1);

    transport.push(r#"<server_status connected="true"/>"#);
    supervisor.connector().flush().expect("status applied");
    supervisor.ensure_live().expect("connected session replays");
    assert_eq!(commands(&transport, "subscribe"), 1);
    assert_eq!(supervisor.stats().subscription_replays, 1);
}
