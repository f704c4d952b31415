use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Default progress notification interval (at most 5 updates per second).
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Shortest interval the emitter ticks at.
pub const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(1);

/// Callback invoked with aggregated progress.
pub type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Returned when an increment would push the counter past the total.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("progress would reach {attempted} of {total} bytes")]
pub struct ProgressOverflow {
    pub attempted: u64,
    pub total: u64,
}

// ---------------------------------------------------------------------------
// ProgressState
// ---------------------------------------------------------------------------

/// Bytes acknowledged so far for one upload attempt.
///
/// Shared by every chunk task; all mutations are atomic. The counter never
/// exceeds `total`: an increment that would is refused.
#[derive(Debug)]
pub struct ProgressState {
    uploaded: AtomicU64,
    total: u64,
}

impl ProgressState {
    pub fn new(total: u64) -> Self {
        Self {
            uploaded: AtomicU64::new(0),
            total,
        }
    }

    /// Adds `delta` bytes and returns the new total.
    pub fn add(&self, delta: u64) -> Result<u64, ProgressOverflow> {
        let total = self.total;
        self.uploaded
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(delta).filter(|next| *next <= total)
            })
            .map(|previous| previous + delta)
            .map_err(|current| ProgressOverflow {
                attempted: current.saturating_add(delta),
                total,
            })
    }

    /// Removes `delta` bytes previously added by a failed transmission.
    pub fn rollback(&self, delta: u64) {
        let _ = self
            .uploaded
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(delta))
            });
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Fraction of the file acknowledged, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.uploaded() as f64 / self.total as f64
    }
}

// ---------------------------------------------------------------------------
// ProgressEmitter
// ---------------------------------------------------------------------------

/// A progress notification as seen by the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub bytes_per_second: f64,
    pub eta: Option<Duration>,
}

impl ProgressUpdate {
    /// Returns the progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.bytes_uploaded as f64 / self.total_bytes as f64 * 100.0
    }
}

struct EmitterShared {
    state: Arc<ProgressState>,
    callback: ProgressCallback,
    speed: SpeedCalculator,
    last_emitted: Mutex<Option<u64>>,
}

impl EmitterShared {
    /// Emits `value` unless it would not advance past the last emission.
    ///
    /// Rolled-back chunks make the raw counter dip; the sink never sees it.
    fn emit(&self, value: u64) {
        let mut last = self.last_emitted.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last
            && value <= previous
        {
            return;
        }
        if let Some(previous) = *last {
            self.speed.add_sample(value - previous);
        }
        *last = Some(value);
        drop(last);

        let total = self.state.total();
        (self.callback)(ProgressUpdate {
            bytes_uploaded: value,
            total_bytes: total,
            bytes_per_second: self.speed.bytes_per_second(),
            eta: self.speed.eta(total.saturating_sub(value)),
        });
    }
}

/// Forwards a [`ProgressState`] to a callback at a bounded rate.
///
/// Emitted values are non-decreasing. Dropping the emitter stops the
/// background task.
pub struct ProgressEmitter {
    shared: Arc<EmitterShared>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ProgressEmitter {
    /// Starts periodic notifications in a background tokio task.
    ///
    /// Intervals below [`MIN_PROGRESS_INTERVAL`] are raised to it.
    pub fn start(state: Arc<ProgressState>, interval: Duration, callback: ProgressCallback) -> Self {
        let shared = Arc::new(EmitterShared {
            state,
            callback,
            speed: SpeedCalculator::new(None, None),
            last_emitted: Mutex::new(None),
        });

        let (tx, mut rx) = oneshot::channel();
        let task_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_PROGRESS_INTERVAL));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        task_shared.emit(task_shared.state.uploaded());
                    }
                    _ = &mut rx => {
                        break;
                    }
                }
            }
        });

        Self {
            shared,
            stop: Some(tx),
            task: Some(task),
        }
    }

    /// Stops the periodic task and waits for it to exit.
    pub async fn stop(&mut self) {
        // Dropping the sender signals the task to exit.
        drop(self.stop.take());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Stops the periodic task and emits the final 100% update.
    pub async fn complete(mut self) {
        self.stop().await;
        let total = self.shared.state.total();
        self.shared.emit(total);
    }

    /// Last value handed to the callback, if any.
    pub fn last_emitted(&self) -> Option<u64> {
        *self
            .shared
            .last_emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ProgressEmitter {
    fn drop(&mut self) {
        drop(self.stop.take());
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a sample of `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.lock();
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 if fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.lock();
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        if s.samples.len() < 2 {
            return 0.0;
        }

        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }

        // The first sample only anchors the window start.
        let total_bytes: u64 = s.samples.iter().skip(1).map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(remaining_bytes as f64 / speed).ok()
    }
}
