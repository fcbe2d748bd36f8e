use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const WORKER_ID_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
const MAX_WORKER_ID: u64 = (1 << WORKER_ID_BITS) - 1;
const WORKER_ID_SHIFT: u64 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u64 = SEQUENCE_BITS + WORKER_ID_BITS;

const EPOCH_MS: u64 = 1735689600000;

#[derive(Debug)]
struct Inner {
    sequence: u64,
    last_timestamp: u64,
}

/// Snowflake-style generator for locally issued transaction ids.
///
/// Ids are unique per worker and increase monotonically, so they double as
/// client order ids on venues that let the caller choose one.
#[derive(Debug)]
pub struct IdGenerator {
    worker_id: u64,
    inner: Mutex<Inner>,
}

impl IdGenerator {
    pub fn new(worker_id: u64) -> Self {
        Self {
            worker_id: worker_id & MAX_WORKER_ID,
            inner: Mutex::new(Inner {
                sequence: 0,
                last_timestamp: 0,
            }),
        }
    }

    pub fn next_id(&self) -> u64 {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut ts = current_timestamp_ms();

        if ts < guard.last_timestamp {
            ts = guard.last_timestamp;
        }

        if ts == guard.last_timestamp {
            guard.sequence = (guard.sequence + 1) & MAX_SEQUENCE;
            if guard.sequence == 0 {
                while ts <= guard.last_timestamp {
                    ts = current_timestamp_ms();
                }
            }
        } else {
            guard.sequence = 0;
        }

        guard.last_timestamp = ts;

        (ts.saturating_sub(EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.worker_id << WORKER_ID_SHIFT)
            | guard.sequence
    }
}

fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(EPOCH_MS)
}

#[cfg(test)]
mod tests {
    use super::IdGenerator;

    #[test]
    fn ids_are_strictly_increasing() {
        let generator = IdGenerator::new(3);
        let mut previous = generator.next_id();
        for _ in 0..5000 {
            let next = generator.next_id();
            assert!(next > previous);
            previous = next;
        }
    }
}
