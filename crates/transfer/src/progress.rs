use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Span of the rolling throughput window.
const RATE_WINDOW: Duration = Duration::from_secs(5);

/// Samples kept in the window at most.
const RATE_SAMPLES: usize = 128;

/// Byte counter for one transfer, shared between the engine and its logs.
pub struct TransferProgress {
    bytes: AtomicU64,
    total: OnceLock<u64>,
    started: Instant,
    rate: RateWindow,
}

impl TransferProgress {
    /// Starts counting. `total` is `None` when the size is not known yet.
    pub fn new(total: Option<u64>) -> Self {
        let progress = Self {
            bytes: AtomicU64::new(0),
            total: OnceLock::new(),
            started: Instant::now(),
            rate: RateWindow::new(RATE_WINDOW, RATE_SAMPLES),
        };
        if let Some(total) = total {
            progress.set_total(total);
        }
        progress
    }

    /// Records the object size once it is known. Later calls are ignored.
    pub fn set_total(&self, total: u64) {
        let _ = self.total.set(total);
    }

    /// Records `bytes` more bytes as transferred.
    pub fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
        self.rate.record(Instant::now(), bytes);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> Option<u64> {
        self.total.get().copied()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Throughput over the last few seconds, in bytes/second.
    pub fn bytes_per_second(&self) -> f64 {
        self.rate.bytes_per_second()
    }

    /// Estimated time to finish. `None` until the size and a rate are known.
    pub fn eta(&self) -> Option<Duration> {
        let remaining = self.total()?.saturating_sub(self.bytes());
        let rate = self.bytes_per_second();
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }
}

/// Rolling window of `(instant, bytes)` samples.
struct RateWindow {
    samples: Mutex<VecDeque<(Instant, u64)>>,
    span: Duration,
    capacity: usize,
}

impl RateWindow {
    fn new(span: Duration, capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            span,
            capacity: capacity.max(2),
        }
    }

    fn record(&self, at: Instant, bytes: u64) {
        let mut samples = self.samples.lock().unwrap();
        samples.push_back((at, bytes));
        while samples.len() > self.capacity {
            samples.pop_front();
        }
        while samples
            .front()
            .is_some_and(|(first, _)| at.duration_since(*first) > self.span)
        {
            samples.pop_front();
        }
    }

    /// Bytes recorded after the oldest sample, over the time since it.
    fn bytes_per_second(&self) -> f64 {
        let samples = self.samples.lock().unwrap();
        let (Some((first, _)), Some((last, _))) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let span = last.duration_since(*first);
        if span.is_zero() {
            return 0.0;
        }
        let bytes: u64 = samples.iter().skip(1).map(|(_, bytes)| bytes).sum();
        bytes as f64 / span.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn progress_counts_bytes() {
        let progress = TransferProgress::new(Some(100));
        progress.add(30);
        progress.add(20);
        assert_eq!(progress.bytes(), 50);
        assert_eq!(progress.total(), Some(100));
    }

    #[test]
    fn total_is_set_once() {
        let progress = TransferProgress::new(None);
        assert_eq!(progress.total(), None);
        progress.set_total(4096);
        progress.set_total(1);
        assert_eq!(progress.total(), Some(4096));
    }

    #[test]
    fn progress_without_total_has_no_eta() {
        let progress = TransferProgress::new(None);
        progress.add(10);
        std::thread::sleep(Duration::from_millis(10));
        progress.add(10);
        assert!(progress.bytes_per_second() > 0.0);
        assert!(progress.eta().is_none());
    }

    #[test]
    fn eta_follows_remaining_bytes() {
        let progress = TransferProgress::new(None);
        progress.set_total(10_000);
        progress.add(500);
        std::thread::sleep(Duration::from_millis(20));
        progress.add(500);
        let eta = progress.eta().unwrap();
        assert!(eta > Duration::ZERO);

        progress.add(9_000);
        assert_eq!(progress.eta(), Some(Duration::ZERO));
    }

    #[test]
    fn rate_needs_two_samples() {
        let window = RateWindow::new(RATE_WINDOW, RATE_SAMPLES);
        assert_eq!(window.bytes_per_second(), 0.0);
        window.record(Instant::now(), 100);
        assert_eq!(window.bytes_per_second(), 0.0);
    }

    #[test]
    fn rate_over_known_span() {
        let window = RateWindow::new(Duration::from_secs(10), RATE_SAMPLES);
        let start = Instant::now();
        window.record(start, 1_000);
        window.record(start + Duration::from_secs(1), 500);
        window.record(start + Duration::from_secs(2), 500);
        assert_eq!(window.bytes_per_second(), 500.0);
    }

    #[test]
    fn old_samples_leave_the_window() {
        let window = RateWindow::new(Duration::from_secs(5), RATE_SAMPLES);
        let start = Instant::now();
        window.record(start, 1_000_000);
        window.record(start + Duration::from_secs(1), 1_000_000);
        window.record(start + Duration::from_secs(10), 10);
        window.record(start + Duration::from_secs(11), 10);
        assert_eq!(window.bytes_per_second(), 10.0);
    }

    #[test]
    fn window_is_capped() {
        let window = RateWindow::new(Duration::from_secs(60), 5);
        let start = Instant::now();
        for i in 0..20 {
            window.record(start + Duration::from_millis(i), 10);
        }
        assert_eq!(window.samples.lock().unwrap().len(), 5);
    }

    #[test]
    fn progress_shared_across_threads() {
        let progress = Arc::new(TransferProgress::new(Some(1000)));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let p = Arc::clone(&progress);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        p.add(10);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(progress.bytes(), 1000);
    }
}
