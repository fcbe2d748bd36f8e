//! Single-consumer ingestion.
//!
//! Producers (foreign callbacks, socket loops, command dispatch threads) push
//! into an unbounded channel and never block. One named thread drains it in
//! FIFO order and applies each message under the state write lock. A failing
//! or panicking message is logged and counted; the loop keeps going.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::error::BrokerError;
use crate::metrics::{IngestCounters, IngestMetrics};
use crate::state::{SessionEvent, SharedState, TradingState};

pub enum Inbound<M> {
    Message(M),
    Session(SessionEvent),
    /// Acknowledged once everything queued before it has been applied.
    Flush(Sender<()>),
    Shutdown,
}

pub trait MessageHandler: Send + 'static {
    type Message: Send + 'static;

    fn handle(&mut self, state: &mut TradingState, message: Self::Message) -> Result<(), BrokerError>;
}

pub struct IngestQueue<M> {
    sender: Sender<Inbound<M>>,
    receiver: Receiver<Inbound<M>>,
    counters: Arc<IngestCounters>,
}

impl<M> Default for IngestQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> IngestQueue<M> {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            sender,
            receiver,
            counters: Arc::new(IngestCounters::default()),
        }
    }

    pub fn sender(&self) -> IngestSender<M> {
        IngestSender {
            sender: self.sender.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

/// Cloneable producer handle; pushing never blocks.
pub struct IngestSender<M> {
    sender: Sender<Inbound<M>>,
    counters: Arc<IngestCounters>,
}

impl<M> Clone for IngestSender<M> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<M> IngestSender<M> {
    /// Returns `false` when the worker is gone and the message was dropped.
    pub fn push(&self, message: M) -> bool {
        self.send(Inbound::Message(message))
    }

    pub fn push_session(&self, event: SessionEvent) -> bool {
        self.send(Inbound::Session(event))
    }

    fn send(&self, inbound: Inbound<M>) -> bool {
        match self.sender.send(inbound) {
            Ok(()) => {
                self.counters.on_enqueued();
                true
            }
            Err(_) => {
                self.counters.on_dropped();
                false
            }
        }
    }
}

pub struct IngestWorker<M: Send + 'static> {
    sender: Sender<Inbound<M>>,
    counters: Arc<IngestCounters>,
    handle: Option<JoinHandle<()>>,
}

impl<M: Send + 'static> IngestWorker<M> {
    pub fn spawn<H>(
        name: &str,
        queue: IngestQueue<M>,
        state: SharedState,
        handler: H,
    ) -> Result<Self, BrokerError>
    where
        H: MessageHandler<Message = M>,
    {
        let IngestQueue {
            sender,
            receiver,
            counters,
        } = queue;
        let loop_counters = Arc::clone(&counters);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(receiver, state, handler, loop_counters))
            .map_err(|err| BrokerError::Fatal(format!("cannot start ingestion thread: {err}")))?;
        Ok(Self {
            sender,
            counters,
            handle: Some(handle),
        })
    }

    /// Blocks until every message queued before this call has been applied.
    pub fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let (ack, done) = channel::bounded(1);
        self.sender
            .send(Inbound::Flush(ack))
            .map_err(|_| BrokerError::Transport("ingestion thread stopped".to_string()))?;
        done.recv_timeout(timeout).map_err(|_| BrokerError::Timeout(timeout))
    }

    pub fn metrics(&self) -> IngestMetrics {
        self.counters.snapshot()
    }

    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.sender.send(Inbound::Shutdown);
        if handle.join().is_err() {
            error!("ingestion thread terminated abnormally");
        }
    }
}

impl<M: Send + 'static> Drop for IngestWorker<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<H: MessageHandler>(
    receiver: Receiver<Inbound<H::Message>>,
    state: SharedState,
    mut handler: H,
    counters: Arc<IngestCounters>,
) {
    while let Ok(inbound) = receiver.recv() {
        match inbound {
            Inbound::Message(message) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut guard = state.write().unwrap_or_else(PoisonError::into_inner);
                    handler.handle(&mut guard, message)
                }));
                match outcome {
                    Ok(Ok(())) => counters.on_processed(),
                    Ok(Err(err)) => {
                        counters.on_failed();
                        warn!(error = %err, "message abandoned");
                    }
                    Err(payload) => {
                        counters.on_panicked();
                        state.clear_poison();
                        error!(panic = panic_message(payload.as_ref()), "message handler panicked");
                    }
                }
            }
            Inbound::Session(event) => {
                let mut guard = state.write().unwrap_or_else(PoisonError::into_inner);
                guard.apply_session_event(event);
            }
            Inbound::Flush(ack) => {
                let _ = ack.send(());
            }
            Inbound::Shutdown => break,
        }
    }
    debug!("ingestion thread stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use market::SeriesConfig;
    use tradelink::{Market, Security};

    use super::{IngestQueue, IngestWorker, MessageHandler};
    use crate::state::{SessionEvent, TradingState};
    use crate::BrokerError;

    struct Recorder;

    impl MessageHandler for Recorder {
        type Message = &'static str;

        fn handle(&mut self, state: &mut TradingState, message: &'static str) -> Result<(), BrokerError> {
            match message {
                "panic" => panic!("boom"),
                "bad" => Err(BrokerError::Malformed("bad".to_string())),
                code => {
                    state.securities.insert(code.to_string(), Security::new(code, "TQBR"));
                    Ok(())
                }
            }
        }
    }

    #[test]
    fn worker_survives_failures_and_keeps_fifo_order() {
        let state = TradingState::shared(SeriesConfig::default());
        let queue = IngestQueue::new();
        let sender = queue.sender();
        let worker = IngestWorker::spawn("ingest-test", queue, state.clone(), Recorder).expect("spawn");

        assert!(sender.push("AAA"));
        assert!(sender.push("panic"));
        assert!(sender.push("bad"));
        assert!(sender.push("BBB"));
        worker.flush(Duration::from_secs(5)).expect("flush");

        let guard = state.read().expect("lock not poisoned after recovery");
        assert!(guard.securities.contains_key("AAA"));
        assert!(guard.securities.contains_key("BBB"));
        drop(guard);

        let metrics = worker.metrics();
        assert_eq!(metrics.enqueued, 4);
        assert_eq!(metrics.processed, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.panicked, 1);
    }

    #[test]
    fn session_events_apply_in_queue_order() {
        let state = TradingState::shared(SeriesConfig::default());
        let queue = IngestQueue::new();
        let sender = queue.sender();
        let mut worker = IngestWorker::spawn("ingest-test", queue, state.clone(), Recorder).expect("spawn");

        state
            .write()
            .expect("lock")
            .markets
            .insert(1, Market { id: 1, name: "MICEX".to_string() });
        assert!(sender.push_session(SessionEvent::Reset));
        assert!(sender.push("CCC"));
        worker.flush(Duration::from_secs(5)).expect("flush");
        {
            let guard = state.read().expect("lock");
            assert!(guard.markets.is_empty());
            assert!(guard.securities.contains_key("CCC"));
        }

        worker.shutdown();
        assert!(!sender.push("DDD"));
        assert_eq!(worker.metrics().dropped, 1);
    }
}
