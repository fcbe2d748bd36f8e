use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::adapters::transaq::ffi::{CallbackSink, ForeignTransport};
use crate::BrokerError;

/// In-process stand-in for the native connector library.
///
/// Answers every command with success (order commands get a fresh
/// transaction id), emits `server_status` on connect and disconnect, and lets
/// tests push arbitrary server payloads through the registered callback.
/// With [`MockTransport::hold_session_status`] the connect answer arrives
/// alone and the status is left for the test to push, as a live server does.
pub struct MockTransport {
    sink: RwLock<Option<CallbackSink>>,
    sent: Mutex<Vec<String>>,
    next_transaction_id: AtomicU64,
    reject_next: Mutex<Option<String>>,
    response_delay: Mutex<Duration>,
    hold_status: AtomicBool,
    initialize_error: Option<String>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            sink: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
            next_transaction_id: AtomicU64::new(1),
            reject_next: Mutex::new(None),
            response_delay: Mutex::new(Duration::ZERO),
            hold_status: AtomicBool::new(false),
            initialize_error: None,
        }
    }

    /// A transport whose `initialize` fails with `message`.
    pub fn failing_initialize(message: impl Into<String>) -> Self {
        Self {
            initialize_error: Some(message.into()),
            ..Self::new()
        }
    }

    /// Delivers `payload` as if the server had pushed it.
    pub fn push(&self, payload: impl Into<String>) -> bool {
        let sink = self.sink.read().unwrap_or_else(PoisonError::into_inner);
        match sink.as_ref() {
            Some(sink) => {
                sink(payload.into());
                true
            }
            None => false,
        }
    }

    /// Commands sent so far, with the password element blanked.
    pub fn sent_commands(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn reject_next(&self, message: impl Into<String>) {
        *self.reject_next.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    pub fn delay_responses(&self, delay: Duration) {
        *self.response_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Stops `connect` and `disconnect` from emitting `server_status`.
    pub fn hold_session_status(&self, hold: bool) {
        self.hold_status.store(hold, Ordering::Relaxed);
    }

    fn push_status(&self, payload: &str) {
        if !self.hold_status.load(Ordering::Relaxed) {
            self.push(payload);
        }
    }
}

impl ForeignTransport for MockTransport {
    fn initialize(&self, _log_dir: &Path, _log_level: u8) -> Result<(), BrokerError> {
        match &self.initialize_error {
            Some(message) => Err(BrokerError::Fatal(message.clone())),
            None => Ok(()),
        }
    }

    fn set_callback(&self, sink: CallbackSink) -> Result<(), BrokerError> {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
        Ok(())
    }

    fn clear_callback(&self) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn send_command(&self, command: &[u8]) -> Result<String, BrokerError> {
        let text = std::str::from_utf8(command.strip_suffix(b"\0").unwrap_or(command))
            .map_err(|_| BrokerError::InvalidRequest("command is not utf-8".to_string()))?;
        let kind = command_kind(text).unwrap_or("unknown").to_string();
        debug!(command = %kind, "mock transport received command");
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(redact_password(text));

        let delay = *self.response_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        if let Some(message) = self.reject_next.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Ok(format!(
                "<result success=\"false\"><message>{message}</message></result>"
            ));
        }

        let response = match kind.as_str() {
            "connect" => {
                self.push_status(r#"<server_status connected="true"/>"#);
                r#"<result success="true"/>"#.to_string()
            }
            "disconnect" => {
                self.push_status(r#"<server_status connected="false"/>"#);
                r#"<result success="true"/>"#.to_string()
            }
            "neworder" | "moveorder" => {
                let id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);
                format!(r#"<result success="true" transactionid="{id}"/>"#)
            }
            _ => r#"<result success="true"/>"#.to_string(),
        };
        Ok(response)
    }

    fn uninitialize(&self) -> Result<(), BrokerError> {
        self.clear_callback();
        Ok(())
    }
}

fn command_kind(text: &str) -> Option<&str> {
    let start = text.find("id=\"")? + 4;
    let len = text[start..].find('"')?;
    Some(&text[start..start + len])
}

fn redact_password(text: &str) -> String {
    match (text.find("<password>"), text.find("</password>")) {
        (Some(open), Some(close)) if open < close => {
            format!("{}<password>***{}", &text[..open], &text[close..])
        }
        _ => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::MockTransport;
    use crate::adapters::transaq::ffi::ForeignTransport;

    #[test]
    fn connect_emits_status_and_password_is_redacted() {
        let transport = MockTransport::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        transport
            .set_callback(Arc::new(move |payload: String| sink.lock().expect("lock").push(payload)))
            .expect("callback");

        let response = transport
            .send_command(b"<command id=\"connect\"><login>l</login><password>secret</password></command>\0")
            .expect("response");
        assert_eq!(response, r#"<result success="true"/>"#);
        assert_eq!(received.lock().expect("lock").len(), 1);
        let sent = transport.sent_commands();
        assert!(sent[0].contains("<password>***</password>"));
        assert!(!sent[0].contains("secret"));

        transport.clear_callback();
        assert!(!transport.push("<orders/>"));
    }
}
