use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tradelink::Timeframe;

use super::parser::{interval_for, RestMessage};
use crate::error::BrokerError;
use crate::ingest::IngestSender;

/// Kline stream reader on its own thread and single-threaded runtime.
///
/// Frames go to the ingestion queue untouched; the handler decodes them.
pub struct KlineStream {
    endpoint: String,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
    last_message_ms: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl KlineStream {
    pub fn spawn(endpoint: String, sender: IngestSender<RestMessage>) -> Result<Self, BrokerError> {
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));
        let last_message_ms = Arc::new(AtomicU64::new(now_millis()));

        let task_cancel = cancel.clone();
        let task_running = Arc::clone(&running);
        let task_last = Arc::clone(&last_message_ms);
        let task_endpoint = endpoint.clone();
        let handle = thread::Builder::new()
            .name("binance-stream".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(err) => {
                        warn!(error = %err, "cannot build stream runtime");
                        task_running.store(false, Ordering::Release);
                        return;
                    }
                };
                runtime.block_on(read_frames(task_endpoint, sender, task_cancel, task_last));
                task_running.store(false, Ordering::Release);
            })
            .map_err(|err| BrokerError::Transport(format!("cannot start stream thread: {err}")))?;

        Ok(Self {
            endpoint,
            cancel,
            running,
            last_message_ms,
            handle: Some(handle),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Milliseconds since the last frame, ping or pong.
    pub fn idle_ms(&self) -> u64 {
        now_millis().saturating_sub(self.last_message_ms.load(Ordering::Relaxed))
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("stream thread panicked");
            }
        }
    }
}

impl Drop for KlineStream {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn read_frames(
    endpoint: String,
    sender: IngestSender<RestMessage>,
    cancel: CancellationToken,
    last_message_ms: Arc<AtomicU64>,
) {
    let connection = tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio_tungstenite::connect_async(endpoint.as_str()) => result,
    };
    let (stream, _) = match connection {
        Ok(ok) => ok,
        Err(err) => {
            warn!(endpoint = %endpoint, error = %err, "stream connect failed");
            return;
        }
    };
    info!(endpoint = %endpoint, "stream connected");

    let (mut write, mut read) = stream.split();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            frame = read.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                last_message_ms.store(now_millis(), Ordering::Relaxed);
                if !sender.push(RestMessage::Stream(text)) {
                    debug!("ingestion queue closed, stopping stream");
                    break;
                }
            }
            Some(Ok(Message::Ping(payload))) => {
                last_message_ms.store(now_millis(), Ordering::Relaxed);
                let _ = write.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Pong(_))) => {
                last_message_ms.store(now_millis(), Ordering::Relaxed);
            }
            Some(Ok(Message::Close(_))) | None => {
                info!(endpoint = %endpoint, "stream closed by server");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!(endpoint = %endpoint, error = %err, "stream read failed");
                break;
            }
        }
    }
}

pub fn kline_stream_name(symbol: &str, timeframe: Timeframe) -> String {
    format!("{}@kline_{}", symbol.to_ascii_lowercase(), interval_for(timeframe))
}

/// One stream uses the raw endpoint; several use the combined one, whose
/// frames wrap the event in `data`.
pub fn stream_endpoint(base: &str, streams: &[String]) -> Option<String> {
    let mut streams = streams.to_vec();
    streams.sort();
    streams.dedup();
    let base = base.trim_end_matches('/');
    match streams.as_slice() {
        [] => None,
        [single] => Some(format!("{base}/ws/{single}")),
        many => Some(format!("{base}/stream?streams={}", many.join("/"))),
    }
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use tradelink::Timeframe;

    use super::{kline_stream_name, stream_endpoint};

    #[test]
    fn endpoint_switches_to_combined_streams() {
        let base = "wss://fstream.binance.com/";
        let one = vec![kline_stream_name("BTCUSDT", Timeframe::M5)];
        assert_eq!(
            stream_endpoint(base, &one).as_deref(),
            Some("wss://fstream.binance.com/ws/btcusdt@kline_5m")
        );

        let many = vec![
            kline_stream_name("ETHUSDT", Timeframe::H1),
            kline_stream_name("BTCUSDT", Timeframe::H1),
            kline_stream_name("BTCUSDT", Timeframe::H1),
        ];
        assert_eq!(
            stream_endpoint(base, &many).as_deref(),
            Some("wss://fstream.binance.com/stream?streams=btcusdt@kline_1h/ethusdt@kline_1h")
        );
        assert_eq!(stream_endpoint(base, &[]), None);
    }
}
