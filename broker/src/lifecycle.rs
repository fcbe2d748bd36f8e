use std::thread;
use std::time::{Duration as StdDuration, Instant};

use tracing::{info, warn};
use tradelink::{ConnectionState, SecurityKey};

use crate::error::BrokerError;
use crate::protocol::{Connector, Credentials};

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            max_delay_ms: 2000,
            max_retries: 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// How long an accepted connect may stay `Connecting` before it is retried.
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2000,
            heartbeat_timeout_ms: 10_000,
            connect_timeout_ms: 15_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LifecycleStats {
    pub reconnect_total: u64,
    pub connect_failures: u64,
    pub heartbeat_failures: u64,
    pub subscription_replays: u64,
}

const SESSION_POLL: StdDuration = StdDuration::from_millis(10);

/// Keeps a connector connected: reconnects with backoff when the session
/// drops or heartbeats stall, then replays tick subscriptions.
///
/// A connect that the venue accepts may still complete asynchronously.
/// Subscriptions are replayed only once the session reports `Connected`,
/// either within `connect_timeout_ms` of the connect call or on a later
/// `ensure_live` step.
pub struct Supervisor<C: Connector> {
    connector: C,
    config: LifecycleConfig,
    credentials: Option<Credentials>,
    last_seen: Option<Instant>,
    connect_started: Option<Instant>,
    replay_pending: bool,
    subscriptions: Vec<SecurityKey>,
    stats: LifecycleStats,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(connector: C, config: LifecycleConfig) -> Self {
        Self {
            connector,
            config,
            credentials: None,
            last_seen: None,
            connect_started: None,
            replay_pending: false,
            subscriptions: Vec::new(),
            stats: LifecycleStats::default(),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn connector_mut(&mut self) -> &mut C {
        &mut self.connector
    }

    pub fn into_inner(self) -> C {
        self.connector
    }

    /// Records the subscription and forwards it when the session is up.
    pub fn subscribe(&mut self, security: SecurityKey) -> Result<(), BrokerError> {
        if !self.subscriptions.contains(&security) {
            self.subscriptions.push(security.clone());
        }
        if self.is_connected() {
            self.connector.subscribe(&security)?;
        } else {
            self.replay_pending = true;
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, security: &SecurityKey) -> Result<(), BrokerError> {
        self.subscriptions.retain(|s| s != security);
        if self.is_connected() {
            self.connector.unsubscribe(security)?;
        }
        Ok(())
    }

    pub fn connect(&mut self, credentials: Credentials) -> Result<(), BrokerError> {
        self.credentials = Some(credentials);
        self.reconnect_with_backoff()
    }

    pub fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.credentials = None;
        self.last_seen = None;
        self.connect_started = None;
        self.replay_pending = false;
        self.connector.disconnect()
    }

    /// One supervision step; call it periodically from the owning thread.
    pub fn ensure_live(&mut self) -> Result<(), BrokerError> {
        if self.credentials.is_none() {
            return Err(BrokerError::NotConnected);
        }
        if !self.is_alive() {
            warn!(
                venue = self.connector.venue(),
                state = ?self.connector.connection_state(),
                "session lost, reconnecting"
            );
            self.stats.connect_failures += 1;
            return self.reconnect_with_backoff();
        }
        if !self.is_connected() {
            // Opening or recovering inside its window; heartbeats resume once up.
            self.last_seen = Some(Instant::now());
            return Ok(());
        }
        self.connect_started = None;
        if self.replay_pending {
            self.replay_subscriptions()?;
        }

        if let Some(last) = self.last_seen {
            let elapsed_ms = last.elapsed().as_millis() as u64;
            if elapsed_ms >= self.config.heartbeat_timeout_ms {
                self.stats.heartbeat_failures += 1;
                return self.reconnect_with_backoff();
            }

            if elapsed_ms >= self.config.heartbeat_interval_ms {
                if let Err(err) = self.connector.heartbeat() {
                    warn!(venue = self.connector.venue(), error = %err, "heartbeat failed");
                    self.stats.heartbeat_failures += 1;
                    return self.reconnect_with_backoff();
                }
                self.last_seen = Some(Instant::now());
            }
        }

        Ok(())
    }

    pub fn stats(&self) -> LifecycleStats {
        self.stats.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connector.connection_state() == ConnectionState::Connected
    }

    /// Connected, or `Connecting` while the recovery deadline (or, for a
    /// fresh connect, the connect timeout) has not passed.
    pub fn is_alive(&self) -> bool {
        match self.connector.connection_state() {
            ConnectionState::Connected => true,
            ConnectionState::Connecting => match self.connector.reconnect_deadline() {
                Some(deadline) => Instant::now() < deadline,
                None => self
                    .connect_started
                    .is_some_and(|started| started.elapsed() < self.connect_timeout()),
            },
            ConnectionState::Disconnected | ConnectionState::Disconnecting => false,
        }
    }

    /// True when there are subscriptions still to be sent to the venue.
    pub fn replay_pending(&self) -> bool {
        self.replay_pending
    }

    /// Blocks until the session reports `Connected`, at most `timeout`.
    pub fn wait_connected(&self, timeout: StdDuration) -> bool {
        let started = Instant::now();
        loop {
            if self.is_connected() {
                return true;
            }
            if started.elapsed() >= timeout {
                return false;
            }
            thread::sleep(SESSION_POLL.min(timeout));
        }
    }

    fn connect_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.config.connect_timeout_ms)
    }

    fn reconnect_with_backoff(&mut self) -> Result<(), BrokerError> {
        let Some(credentials) = self.credentials.clone() else {
            return Err(BrokerError::NotConnected);
        };
        let retries = self.config.reconnect.max_retries.max(1);
        let mut last_error = None;
        for attempt in 0..retries {
            if attempt > 0 {
                let backoff = compute_backoff_ms(self.config.reconnect, attempt);
                if backoff > 0 {
                    thread::sleep(StdDuration::from_millis(backoff));
                }
            }

            match self.connector.connect(credentials.clone()) {
                Ok(()) => {
                    self.last_seen = Some(Instant::now());
                    self.connect_started = Some(Instant::now());
                    self.replay_pending = !self.subscriptions.is_empty();
                    self.stats.reconnect_total += 1;
                    if self.wait_connected(self.connect_timeout()) {
                        info!(venue = self.connector.venue(), attempt, "session established");
                        self.connect_started = None;
                        if self.replay_pending {
                            self.replay_subscriptions()?;
                        }
                    } else {
                        info!(
                            venue = self.connector.venue(),
                            attempt,
                            "connect accepted, session still opening"
                        );
                    }
                    return Ok(());
                }
                // Bad credentials or permissions do not improve with retries.
                Err(err @ (BrokerError::InvalidRequest(_)
                | BrokerError::PermissionDenied(_)
                | BrokerError::ClockSkew { .. }
                | BrokerError::Fatal(_))) => {
                    self.stats.connect_failures += 1;
                    return Err(err);
                }
                Err(err) => {
                    warn!(venue = self.connector.venue(), attempt, error = %err, "connect failed");
                    self.stats.connect_failures += 1;
                    last_error = Some(err);
                }
            }
        }

        Err(BrokerError::ConnectionFailed(format!(
            "reconnect retries exhausted: {}",
            last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string())
        )))
    }

    fn replay_subscriptions(&mut self) -> Result<(), BrokerError> {
        for security in self.subscriptions.clone() {
            self.connector.subscribe(&security)?;
            self.stats.subscription_replays += 1;
        }
        self.replay_pending = false;
        Ok(())
    }
}

fn compute_backoff_ms(policy: ReconnectPolicy, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(10);
    let scaled = policy.initial_delay_ms.saturating_mul(1u64 << shift);
    scaled.min(policy.max_delay_ms.max(policy.initial_delay_ms))
}
