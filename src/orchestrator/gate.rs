// Concurrency gate - bounded cap on simultaneous in-flight dispatches.
//
// Acquisition polls with exponential backoff plus jitter instead of
// queueing, so a saturated gateway sheds load after the acquire budget
// instead of building an unbounded backlog.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const BACKOFF_BASE_MS: u64 = 50;
const BACKOFF_FACTOR: f64 = 1.5;
const BACKOFF_CAP_MS: u64 = 2000;

pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout,
        }
    }

    /// Default sizing: `max(50, cpu_count × 4)`.
    pub fn default_capacity() -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cpus * 4).max(50)
    }

    /// Try to take a slot within the acquire budget. `None` means the
    /// dispatch is rejected, not queued.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        let started = Instant::now();
        let mut backoff = Duration::from_millis(BACKOFF_BASE_MS);

        loop {
            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => return Some(permit),
                Err(_) => {
                    if started.elapsed() >= self.acquire_timeout {
                        tracing::warn!(
                            "[Gate] Acquire timed out after {}ms ({} in flight)",
                            started.elapsed().as_millis(),
                            self.in_flight()
                        );
                        return None;
                    }
                    let jittered = jitter(backoff);
                    let remaining = self.acquire_timeout.saturating_sub(started.elapsed());
                    tokio::time::sleep(jittered.min(remaining)).await;
                    backoff = next_backoff(backoff);
                }
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

fn next_backoff(current: Duration) -> Duration {
    let next_ms = (current.as_millis() as f64 * BACKOFF_FACTOR) as u64;
    Duration::from_millis(next_ms.min(BACKOFF_CAP_MS))
}

/// Half fixed, half random, so concurrent waiters spread out.
fn jitter(delay: Duration) -> Duration {
    let half = delay.as_millis() as u64 / 2;
    let extra = rand::thread_rng().gen_range(0..=half.max(1));
    Duration::from_millis(half + extra)
}
