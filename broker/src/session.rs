//! State and threads every connector owns, composed into each implementation.
//!
//! Also holds the two steps both wire parsers end in: merging a history
//! batch into an instrument series and reacting to a freshly opened bar.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use market::{Bars, Distributor, LiveUpdate, SeriesEvent};
use tracing::{debug, warn};
use tradelink::{ConnectionState, Order, Timeframe};

use crate::error::BrokerError;
use crate::ingest::{IngestQueue, IngestSender, IngestWorker, MessageHandler};
use crate::metrics::IngestMetrics;
use crate::recalc::{RecalcRequest, RecalcScheduler};
use crate::state::{SessionEvent, SharedState, StateView, TradingState};

pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ConnectorBase<M: Send + 'static> {
    venue: String,
    state: SharedState,
    sender: IngestSender<M>,
    worker: IngestWorker<M>,
    recalc: Arc<RecalcScheduler>,
    flush_timeout: Duration,
}

impl<M: Send + 'static> ConnectorBase<M> {
    pub fn start<H>(
        venue: impl Into<String>,
        state: SharedState,
        queue: IngestQueue<M>,
        handler: H,
        recalc: Arc<RecalcScheduler>,
    ) -> Result<Self, BrokerError>
    where
        H: MessageHandler<Message = M>,
    {
        let venue = venue.into();
        let sender = queue.sender();
        let thread_name = format!("{}-ingest", venue.to_ascii_lowercase());
        let worker = IngestWorker::spawn(&thread_name, queue, Arc::clone(&state), handler)?;
        Ok(Self {
            venue,
            state,
            sender,
            worker,
            recalc,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        })
    }

    pub fn venue(&self) -> &str {
        &self.venue
    }

    pub fn state_view(&self) -> StateView {
        StateView::new(Arc::clone(&self.state))
    }

    pub fn sender(&self) -> IngestSender<M> {
        self.sender.clone()
    }

    pub fn recalc(&self) -> &Arc<RecalcScheduler> {
        &self.recalc
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_view().connection_state()
    }

    pub fn require_connected(&self) -> Result<(), BrokerError> {
        match self.connection_state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(BrokerError::NotConnected),
        }
    }

    /// Waits until every message queued so far has been applied.
    pub fn flush(&self) -> Result<(), BrokerError> {
        self.worker.flush(self.flush_timeout)
    }

    pub fn reset_session(&self) {
        self.sender.push_session(SessionEvent::Reset);
    }

    pub fn transition(&self, connection: ConnectionState) {
        debug!(venue = %self.venue, state = ?connection, "connection state requested");
        self.sender.push_session(SessionEvent::Transition(connection));
    }

    pub fn submit_local_order(&self, order: Order) {
        self.sender.push_session(SessionEvent::OrderSubmitted(order));
    }

    pub fn metrics(&self) -> IngestMetrics {
        self.worker.metrics()
    }

    pub fn shutdown(&mut self) {
        let failures = self.recalc.cancel_all();
        if failures > 0 {
            warn!(venue = %self.venue, failures, "recalculation tasks failed before shutdown");
        }
        self.worker.shutdown();
    }
}

/// Reconciles one history batch into the instrument's series and reports the
/// outcome to subscribers. A rejected batch leaves the series untouched.
pub fn merge_history_batch(state: &mut TradingState, distributor: &Distributor, seccode: &str, bars: Bars) {
    if bars.is_empty() {
        debug!(seccode, "empty history batch");
        return;
    }
    let incoming_len = bars.len();
    let series = state.series_mut(seccode);
    match series.merge_history(bars) {
        Ok(merge) => {
            let len = series.source().map_or(0, |s| s.len());
            debug!(seccode, ?merge, incoming_len, len, "history batch applied");
            distributor.publish(SeriesEvent::Reconciled {
                seccode: seccode.to_string(),
                merge,
                len,
            });
        }
        Err(err) => {
            warn!(seccode, incoming_len, error = %err, "history batch rejected");
            distributor.publish(SeriesEvent::Rejected {
                seccode: seccode.to_string(),
                reason: err.to_string(),
            });
        }
    }
}

/// Publishes a bar opening and schedules the debounced recalculation.
pub fn on_live_update(
    update: &LiveUpdate,
    seccode: &str,
    timeframe: Timeframe,
    distributor: &Distributor,
    recalc: &RecalcScheduler,
) {
    let LiveUpdate::Opened { opened_at, .. } = update else {
        return;
    };
    let opened_at: NaiveDateTime = *opened_at;
    distributor.publish(SeriesEvent::BarOpened {
        seccode: seccode.to_string(),
        opened_at,
    });
    let request = RecalcRequest {
        seccode: seccode.to_string(),
        timeframe,
        opened_at,
    };
    if let Err(err) = recalc.schedule(request) {
        warn!(seccode, error = %err, "cannot schedule recalculation");
    }
    recalc.drain_finished();
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;
    use market::{BarRow, Bars, Distributor, MergeKind, SeriesConfig, SeriesEvent};
    use tradelink::Timeframe;

    use super::merge_history_batch;
    use crate::state::TradingState;

    fn batch(start_hour: u32, count: i64) -> Bars {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(start_hour, 0, 0))
            .expect("valid datetime");
        Bars::from_rows(
            Timeframe::M5,
            (0..count).map(|i| BarRow::flat(start + chrono::Duration::minutes(5 * i), 10.0, 1.0)),
        )
        .expect("increasing rows")
    }

    #[test]
    fn rejected_backfill_is_published_and_leaves_series() {
        let distributor = Arc::new(Distributor::new(8));
        let mut events = distributor.subscribe("ABC");
        let mut state = TradingState::new(SeriesConfig::default());

        merge_history_batch(&mut state, &distributor, "ABC", batch(10, 4));
        let far_past = Bars::from_rows(
            Timeframe::M5,
            [BarRow::flat(
                NaiveDate::from_ymd_opt(2024, 1, 2)
                    .and_then(|d| d.and_hms_opt(10, 0, 0))
                    .expect("valid datetime"),
                9.0,
                1.0,
            )],
        )
        .expect("single row");
        merge_history_batch(&mut state, &distributor, "ABC", far_past);

        assert!(matches!(
            events.try_recv(),
            Ok(SeriesEvent::Reconciled { merge: MergeKind::Replaced, len: 4, .. })
        ));
        assert!(matches!(events.try_recv(), Ok(SeriesEvent::Rejected { .. })));
        assert_eq!(state.series["ABC"].source().map(|s| s.len()), Some(4));
    }
}
