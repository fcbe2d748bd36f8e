//! Debounced follow-up work after a bar opens.
//!
//! When a live update opens a new bar the parser schedules one task per
//! instrument: after the debounce delay it asks the downstream collaborator
//! to recalculate and re-requests recent history so provider-side revisions
//! of the bar that just closed get reconciled. A newer schedule for the same
//! instrument cancels the pending one. Every task is a handle that can be
//! cancelled or joined, and failures surface through `drain_finished`.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::NaiveDateTime;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};
use tradelink::Timeframe;

use crate::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecalcRequest {
    pub seccode: String,
    pub timeframe: Timeframe,
    pub opened_at: NaiveDateTime,
}

/// Downstream consumer of recalculation requests.
pub trait RecalcSink: Send + Sync {
    fn request_recalc(&self, request: RecalcRequest) -> Result<(), BrokerError>;
}

/// Connector-side re-request of recent bars for one instrument.
pub trait HistorySource: Send + Sync {
    fn request_history(&self, seccode: &str, timeframe: Timeframe, count: usize) -> Result<(), BrokerError>;
}

/// Sink that only logs; used when no collaborator is attached.
#[derive(Debug, Default)]
pub struct LoggingSink;

impl RecalcSink for LoggingSink {
    fn request_recalc(&self, request: RecalcRequest) -> Result<(), BrokerError> {
        info!(
            seccode = %request.seccode,
            timeframe = %request.timeframe,
            opened_at = %request.opened_at,
            "recalculation requested"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecalcConfig {
    pub debounce: Duration,
    /// Bars re-requested after a bar opens; zero disables the re-request.
    pub history_count: usize,
}

impl Default for RecalcConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            history_count: 3,
        }
    }
}

pub struct ScheduledRecalc {
    seccode: String,
    cancel: Sender<()>,
    handle: JoinHandle<Result<(), BrokerError>>,
}

impl ScheduledRecalc {
    pub fn seccode(&self) -> &str {
        &self.seccode
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn cancel(&self) {
        let _ = self.cancel.try_send(());
    }

    pub fn join(self) -> Result<(), BrokerError> {
        self.handle
            .join()
            .unwrap_or_else(|_| Err(BrokerError::Fatal("recalculation task panicked".to_string())))
    }
}

pub struct RecalcScheduler {
    config: RecalcConfig,
    sink: Arc<dyn RecalcSink>,
    history: Option<Arc<dyn HistorySource>>,
    tasks: Mutex<Vec<ScheduledRecalc>>,
}

impl RecalcScheduler {
    pub fn new(
        config: RecalcConfig,
        sink: Arc<dyn RecalcSink>,
        history: Option<Arc<dyn HistorySource>>,
    ) -> Self {
        Self {
            config,
            sink,
            history,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts the debounced task; an earlier pending task for the same
    /// instrument is cancelled.
    pub fn schedule(&self, request: RecalcRequest) -> Result<(), BrokerError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.iter().filter(|t| t.seccode == request.seccode && !t.is_finished()) {
            task.cancel();
        }

        let (cancel, cancelled) = channel::bounded(1);
        let debounce = self.config.debounce;
        let history_count = self.config.history_count;
        let sink = Arc::clone(&self.sink);
        let history = self.history.clone();
        let seccode = request.seccode.clone();
        let handle = thread::Builder::new()
            .name(format!("recalc-{}", request.seccode))
            .spawn(move || {
                match cancelled.recv_timeout(debounce) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!(seccode = %request.seccode, "recalculation cancelled");
                        return Ok(());
                    }
                }
                let seccode = request.seccode.clone();
                let timeframe = request.timeframe;
                sink.request_recalc(request)?;
                if let Some(history) = history.filter(|_| history_count > 0) {
                    history.request_history(&seccode, timeframe, history_count)?;
                }
                Ok(())
            })
            .map_err(|err| BrokerError::Transport(format!("cannot start recalculation task: {err}")))?;

        tasks.push(ScheduledRecalc {
            seccode,
            cancel,
            handle,
        });
        Ok(())
    }

    pub fn pending(&self) -> usize {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Joins completed tasks, logging each failure. Returns the failure count.
    pub fn drain_finished(&self) -> usize {
        let finished = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            let (done, running): (Vec<_>, Vec<_>) = tasks.drain(..).partition(|t| t.is_finished());
            *tasks = running;
            done
        };
        let mut failures = 0;
        for task in finished {
            let seccode = task.seccode.clone();
            if let Err(err) = task.join() {
                failures += 1;
                warn!(seccode = %seccode, error = %err, "recalculation task failed");
            }
        }
        failures
    }

    /// Cancels every pending task and waits for all of them.
    pub fn cancel_all(&self) -> usize {
        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *tasks)
        };
        for task in &tasks {
            task.cancel();
        }
        let mut failures = 0;
        for task in tasks {
            let seccode = task.seccode.clone();
            if let Err(err) = task.join() {
                failures += 1;
                warn!(seccode = %seccode, error = %err, "recalculation task failed");
            }
        }
        failures
    }
}

impl Drop for RecalcScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
