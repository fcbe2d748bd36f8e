//! Blocking command calls with a bounded wait.
//!
//! The foreign call itself cannot be cancelled, so each command runs on its
//! own short-lived thread and only the caller's wait is bounded. An answer
//! that arrives after the caller gave up is forwarded to the ingestion queue.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError};
use tracing::{debug, warn};
use tradelink::{SecurityKey, Timeframe};

use super::command::{decode_result, Command};
use super::ffi::ForeignTransport;
use crate::error::BrokerError;
use crate::ingest::IngestSender;
use crate::protocol::CommandReceipt;
use crate::recalc::HistorySource;
use crate::state::StateView;

/// Extra wait on top of the server-side request timeout.
pub const RESPONSE_GRACE: Duration = Duration::from_secs(5);

pub struct CommandChannel {
    transport: Arc<dyn ForeignTransport>,
    late_responses: IngestSender<String>,
    wait: Duration,
    view: StateView,
}

impl CommandChannel {
    pub fn new(
        transport: Arc<dyn ForeignTransport>,
        late_responses: IngestSender<String>,
        request_timeout: Duration,
        view: StateView,
    ) -> Self {
        Self {
            transport,
            late_responses,
            wait: request_timeout + RESPONSE_GRACE,
            view,
        }
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn dispatch(&self, command: Command) -> Result<CommandReceipt, BrokerError> {
        let kind = command.kind();
        let (reply, response) = channel::bounded(1);
        let abandoned = Arc::new(Mutex::new(false));
        let transport = Arc::clone(&self.transport);
        let late = self.late_responses.clone();
        let caller_gone = Arc::clone(&abandoned);

        thread::Builder::new()
            .name(format!("txml-{kind}"))
            .spawn(move || {
                let result = transport.send_command(command.as_bytes());
                drop(command);
                let gone = caller_gone.lock().unwrap_or_else(PoisonError::into_inner);
                if !*gone {
                    let _ = reply.send(result);
                    return;
                }
                match result {
                    Ok(text) => {
                        debug!(command = kind, "forwarding late response");
                        late.push(text);
                    }
                    Err(err) => warn!(command = kind, error = %err, "late command failure"),
                }
            })
            .map_err(|err| BrokerError::Transport(format!("cannot start dispatch thread: {err}")))?;

        match response.recv_timeout(self.wait) {
            Ok(result) => decode_result(&result?),
            Err(RecvTimeoutError::Timeout) => {
                let mut gone = abandoned.lock().unwrap_or_else(PoisonError::into_inner);
                *gone = true;
                // The answer may have landed between the timeout and the lock.
                if let Ok(result) = response.try_recv() {
                    return decode_result(&result?);
                }
                warn!(command = kind, wait = ?self.wait, "command timed out");
                Err(BrokerError::Timeout(self.wait))
            }
            Err(RecvTimeoutError::Disconnected) => Err(BrokerError::Transport(format!(
                "dispatch thread for {kind} ended without an answer"
            ))),
        }
    }
}

impl HistorySource for CommandChannel {
    fn request_history(&self, seccode: &str, timeframe: Timeframe, count: usize) -> Result<(), BrokerError> {
        let security = self
            .view
            .security(seccode)
            .ok_or_else(|| BrokerError::InvalidRequest(format!("unknown security {seccode}")))?;
        let kind = self
            .view
            .candle_kind_for(timeframe)
            .ok_or_else(|| BrokerError::InvalidRequest(format!("no candle kind for {timeframe}")))?;
        let key = SecurityKey::new(security.board, security.seccode);
        self.dispatch(Command::history(&key, kind.id, count, true)).map(|_| ())
    }
}
