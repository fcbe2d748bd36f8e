pub mod adapters;
pub mod codec;
pub mod error;
pub mod identity;
pub mod ingest;
pub mod lifecycle;
pub mod metrics;
pub mod protocol;
pub mod recalc;
pub mod session;
pub mod state;

pub use adapters::{BinanceConfig, BinanceConnector, MockTransport, TransaqConfig, TransaqConnector};
pub use error::BrokerError;
pub use identity::{OrderUpdate, Resolution};
pub use ingest::{IngestQueue, IngestSender, IngestWorker, MessageHandler};
pub use lifecycle::{LifecycleConfig, LifecycleStats, ReconnectPolicy, Supervisor};
pub use metrics::IngestMetrics;
pub use protocol::{
	CancelRequest, CommandReceipt, Connector, Credentials, OrderRequest, ReplaceRequest,
	ServerAddress,
};
pub use recalc::{HistorySource, LoggingSink, RecalcConfig, RecalcRequest, RecalcScheduler, RecalcSink};
pub use state::{SessionEvent, SessionStatus, SharedState, StateView, TradingState};

#[cfg(test)]
mod tests {
	use std::sync::PoisonError;
	use std::thread;
	use std::time::{Duration, Instant};

	use market::SeriesConfig;
	use tradelink::{ConnectionState, SecurityKey, Timeframe};

	use super::{
		BrokerError, CancelRequest, CommandReceipt, Connector, Credentials, LifecycleConfig,
		OrderRequest, ReconnectPolicy, ReplaceRequest, SessionEvent, SharedState, StateView,
		Supervisor, TradingState,
	};

	struct FlakyConnector {
		state: SharedState,
		connect_calls: u32,
		subscribe_calls: u32,
		fail_first_connect: bool,
		fail_next_heartbeat: bool,
	}

	impl FlakyConnector {
		fn new() -> Self {
			Self {
				state: TradingState::shared(SeriesConfig::default()),
				connect_calls: 0,
				subscribe_calls: 0,
				fail_first_connect: true,
				fail_next_heartbeat: false,
			}
		}

		fn set(&self, connection: ConnectionState) {
			self.state
				.write()
				.unwrap_or_else(PoisonError::into_inner)
				.apply_session_event(SessionEvent::Transition(connection));
		}

		fn require_connected(&self) -> Result<(), BrokerError> {
			if self.connection_state() == ConnectionState::Connected {
				Ok(())
			} else {
				Err(BrokerError::NotConnected)
			}
		}
	}

	impl Connector for FlakyConnector {
		fn venue(&self) -> &str {
			"TEST"
		}

		fn connect(&mut self, _credentials: Credentials) -> Result<(), BrokerError> {
			self.connect_calls += 1;
			if self.fail_first_connect {
				self.fail_first_connect = false;
				return Err(BrokerError::ConnectionFailed("first connect fails".to_string()));
			}
			self.set(ConnectionState::Connected);
			Ok(())
		}

		fn disconnect(&mut self) -> Result<(), BrokerError> {
			self.set(ConnectionState::Disconnected);
			Ok(())
		}

		fn send_order(&mut self, _request: &OrderRequest) -> Result<CommandReceipt, BrokerError> {
			self.require_connected()?;
			Ok(CommandReceipt::default())
		}

		fn replace_order(&mut self, _request: &ReplaceRequest) -> Result<CommandReceipt, BrokerError> {
			self.require_connected()?;
			Ok(CommandReceipt::default())
		}

		fn cancel_order(&mut self, _request: &CancelRequest) -> Result<CommandReceipt, BrokerError> {
			self.require_connected()?;
			Ok(CommandReceipt::default())
		}

		fn subscribe(&mut self, _security: &SecurityKey) -> Result<(), BrokerError> {
			self.require_connected()?;
			self.subscribe_calls += 1;
			Ok(())
		}

		fn unsubscribe(&mut self, _security: &SecurityKey) -> Result<(), BrokerError> {
			self.require_connected()
		}

		fn request_historical_bars(
			&mut self,
			_security: &SecurityKey,
			_timeframe: Timeframe,
			_count: usize,
		) -> Result<(), BrokerError> {
			self.require_connected()
		}

		fn request_security_info(&mut self, _security: &SecurityKey) -> Result<(), BrokerError> {
			self.require_connected()
		}

		fn request_portfolio_info(&mut self) -> Result<(), BrokerError> {
			self.require_connected()
		}

		fn state(&self) -> StateView {
			StateView::new(self.state.clone())
		}

		fn heartbeat(&mut self) -> Result<(), BrokerError> {
			if self.fail_next_heartbeat {
				self.fail_next_heartbeat = false;
				self.set(ConnectionState::Disconnected);
				return Err(BrokerError::Transport("heartbeat lost".to_string()));
			}
			self.require_connected()
		}
	}

	fn fast_config() -> LifecycleConfig {
		LifecycleConfig {
			heartbeat_interval_ms: 0,
			heartbeat_timeout_ms: 60_000,
			connect_timeout_ms: 1000,
			reconnect: ReconnectPolicy {
				initial_delay_ms: 0,
				max_delay_ms: 0,
				max_retries: 3,
			},
		}
	}

	#[test]
	fn supervisor_reconnects_and_replays_subscriptions() {
		let mut supervisor = Supervisor::new(FlakyConnector::new(), fast_config());
		supervisor
			.subscribe(SecurityKey::new("TQBR", "ABC"))
			.expect("subscription before connect is recorded");
		assert_eq!(supervisor.connector().subscribe_calls, 0);

		supervisor
			.connect(Credentials::login("user", "secret"))
			.expect("second attempt connects");
		assert_eq!(supervisor.connector().connect_calls, 2);
		assert_eq!(supervisor.connector().subscribe_calls, 1);

		supervisor.connector_mut().fail_next_heartbeat = true;
		supervisor.ensure_live().expect("heartbeat failure triggers reconnect");
		assert_eq!(supervisor.connector().connect_calls, 3);
		assert_eq!(supervisor.connector().subscribe_calls, 2);

		let stats = supervisor.stats();
		assert_eq!(stats.reconnect_total, 2);
		assert_eq!(stats.heartbeat_failures, 1);
		assert_eq!(stats.subscription_replays, 2);
	}

	#[test]
	fn recovering_session_is_retried_once_its_deadline_passes() {
		let mut connector = FlakyConnector::new();
		connector.fail_first_connect = false;
		let mut supervisor = Supervisor::new(connector, fast_config());
		supervisor
			.connect(Credentials::login("user", "secret"))
			.expect("connects");
		assert_eq!(supervisor.connector().connect_calls, 1);

		{
			let mut state = supervisor.connector().state.write().unwrap_or_else(PoisonError::into_inner);
			state.session.connection = ConnectionState::Connecting;
			state.session.reconnect_deadline = Some(Instant::now() + Duration::from_millis(50));
		}
		supervisor.ensure_live().expect("recovery window still open");
		assert!(supervisor.is_alive());
		assert_eq!(supervisor.connector().connect_calls, 1);

		thread::sleep(Duration::from_millis(80));
		assert!(!supervisor.is_alive());
		supervisor.ensure_live().expect("expired recovery reconnects");
		assert_eq!(supervisor.connector().connect_calls, 2);
		assert_eq!(supervisor.connector().connection_state(), ConnectionState::Connected);
		assert_eq!(supervisor.connector().reconnect_deadline(), None);
		assert_eq!(supervisor.stats().connect_failures, 1);
	}

	#[test]
	fn supervisor_does_not_retry_rejected_credentials() {
		struct Refusing(FlakyConnector);
		let mut inner = FlakyConnector::new();
		inner.fail_first_connect = false;
		let mut supervisor = Supervisor::new(Refusing(inner), fast_config());

		impl Connector for Refusing {
			fn venue(&self) -> &str {
				"TEST"
			}
			fn connect(&mut self, _credentials: Credentials) -> Result<(), BrokerError> {
				self.0.connect_calls += 1;
				Err(BrokerError::PermissionDenied(vec!["enableFutures".to_string()]))
			}
			fn disconnect(&mut self) -> Result<(), BrokerError> {
				self.0.disconnect()
			}
			fn send_order(&mut self, request: &OrderRequest) -> Result<CommandReceipt, BrokerError> {
				self.0.send_order(request)
			}
			fn replace_order(&mut self, request: &ReplaceRequest) -> Result<CommandReceipt, BrokerError> {
				self.0.replace_order(request)
			}
			fn cancel_order(&mut self, request: &CancelRequest) -> Result<CommandReceipt, BrokerError> {
				self.0.cancel_order(request)
			}
			fn subscribe(&mut self, security: &SecurityKey) -> Result<(), BrokerError> {
				self.0.subscribe(security)
			}
			fn unsubscribe(&mut self, security: &SecurityKey) -> Result<(), BrokerError> {
				self.0.unsubscribe(security)
			}
			fn request_historical_bars(
				&mut self,
				security: &SecurityKey,
				timeframe: Timeframe,
				count: usize,
			) -> Result<(), BrokerError> {
				self.0.request_historical_bars(security, timeframe, count)
			}
			fn request_security_info(&mut self, security: &SecurityKey) -> Result<(), BrokerError> {
				self.0.request_security_info(security)
			}
			fn request_portfolio_info(&mut self) -> Result<(), BrokerError> {
				self.0.request_portfolio_info()
			}
			fn state(&self) -> StateView {
				self.0.state()
			}
		}

		let err = supervisor
			.connect(Credentials::api_key("key", "secret"))
			.expect_err("permission failure is final");
		assert!(matches!(err, BrokerError::PermissionDenied(_)));
		assert_eq!(supervisor.connector().0.connect_calls, 1);
		assert_eq!(supervisor.connector().connection_state(), ConnectionState::Disconnected);
	}
}
