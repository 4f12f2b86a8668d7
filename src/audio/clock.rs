//! Device clocks
//!
//! cpal does not expose a device's hardware time or rate scalar, so each
//! stream callback stamps its running sample time against the host's
//! monotonic clock. The rate scalar is the measured frame rate divided by
//! the nominal one: slightly above 1.0 for a device running fast, below
//! for one running slow.
//!
//! The `(sample_time, host_nanos)` pair is published through the same
//! generation-counted history the ring buffer uses for its bounds, so the
//! output callback can read the input device's clock without locking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use super::time_bounds::TimeBoundsHistory;

/// Minimum measurement window before a rate scalar other than 1.0 is reported
const MIN_MEASURE_NANOS: i64 = 500_000_000;

/// A device's position and speed at the last callback
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClockTime {
    /// Running sample time of the device stream
    pub sample_time: f64,
    /// Measured rate relative to the nominal sample rate
    pub rate_scalar: f64,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockError {
    #[error("Device clock has not started")]
    NotRunning,

    #[error("Could not read a consistent clock snapshot")]
    Contended,
}

/// Anything the offset tracker can ask for the current device time
pub trait ClockSource {
    fn current_time(&self) -> Result<ClockTime, ClockError>;
}

impl<T: ClockSource + ?Sized> ClockSource for Arc<T> {
    fn current_time(&self) -> Result<ClockTime, ClockError> {
        (**self).current_time()
    }
}

/// Clock driven by one device's stream callback
pub struct DeviceClock {
    nominal_rate: f64,
    max_deviation: f64,
    epoch: Instant,
    /// (sample_time, host nanos since epoch)
    history: TimeBoundsHistory,
    /// Start of the rate measurement, same layout as `history`
    anchor: TimeBoundsHistory,
    needs_anchor: AtomicBool,
}

impl DeviceClock {
    /// # Arguments
    /// * `nominal_rate` - The device's configured sample rate
    /// * `max_deviation` - Measured rate scalars are clamped to `1.0 ± max_deviation`
    /// * `epoch` - Shared host time origin
    pub fn new(nominal_rate: f64, max_deviation: f64, epoch: Instant) -> Self {
        Self {
            nominal_rate,
            max_deviation: max_deviation.abs(),
            epoch,
            history: TimeBoundsHistory::new(),
            anchor: TimeBoundsHistory::new(),
            needs_anchor: AtomicBool::new(true),
        }
    }

    /// Stamp the stream's current sample time. Called from the device callback only.
    pub fn advance(&self, sample_time: i64) {
        let nanos = self.epoch.elapsed().as_nanos().min(i64::MAX as u128) as i64;
        self.advance_at(sample_time, nanos);
    }

    fn advance_at(&self, sample_time: i64, host_nanos: i64) {
        if self.needs_anchor.load(Ordering::Acquire) {
            // The new anchor must be visible before the flag clears
            self.anchor.publish(sample_time, host_nanos);
            self.needs_anchor.store(false, Ordering::Release);
        }
        self.history.publish(sample_time, host_nanos);
    }

    /// Restart the rate measurement on the next callback (after a stream restart)
    pub fn restart(&self) {
        self.needs_anchor.store(true, Ordering::Release);
    }

    fn rate_scalar(&self, (anchor_sample, anchor_nanos): (i64, i64), sample_time: i64, host_nanos: i64) -> f64 {
        let frames = (sample_time - anchor_sample) as f64;
        let nanos = host_nanos - anchor_nanos;
        if nanos < MIN_MEASURE_NANOS || frames <= 0.0 || self.nominal_rate <= 0.0 {
            return 1.0;
        }
        let measured = frames / (nanos as f64 * 1e-9);
        (measured / self.nominal_rate).clamp(1.0 - self.max_deviation, 1.0 + self.max_deviation)
    }
}

impl ClockSource for DeviceClock {
    fn current_time(&self) -> Result<ClockTime, ClockError> {
        if self.history.updates() == 0 || self.needs_anchor.load(Ordering::Acquire) {
            return Err(ClockError::NotRunning);
        }
        let anchor = self.anchor.snapshot().ok_or(ClockError::Contended)?;
        let (sample_time, host_nanos) = self.history.snapshot().ok_or(ClockError::Contended)?;
        Ok(ClockTime {
            sample_time: sample_time as f64,
            rate_scalar: self.rate_scalar(anchor, sample_time, host_nanos),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> DeviceClock {
        DeviceClock::new(48_000.0, 0.02, Instant::now())
    }

    #[test]
    fn test_not_running_before_first_callback() {
        assert_eq!(clock().current_time(), Err(ClockError::NotRunning));
    }

    #[test]
    fn test_unity_rate_until_measured() {
        let clock = clock();
        clock.advance_at(0, 0);
        clock.advance_at(480, 10_000_000);
        let now = clock.current_time().unwrap();
        assert_eq!(now.sample_time, 480.0);
        assert_eq!(now.rate_scalar, 1.0);
    }

    #[test]
    fn test_measures_fast_device() {
        let clock = clock();
        clock.advance_at(0, 0);
        // 48048 frames in one second: 0.1% fast
        clock.advance_at(48_048, 1_000_000_000);
        let rate = clock.current_time().unwrap().rate_scalar;
        assert!((rate - 1.001).abs() < 1e-9);
    }

    #[test]
    fn test_rate_is_clamped() {
        let clock = clock();
        clock.advance_at(0, 0);
        clock.advance_at(96_000, 1_000_000_000);
        let rate = clock.current_time().unwrap().rate_scalar;
        assert!((rate - 1.02).abs() < 1e-9);
    }

    #[test]
    fn test_restart_reanchors() {
        let clock = clock();
        clock.advance_at(0, 0);
        clock.advance_at(48_000, 1_000_000_000);

        // Stream paused for a second, then restarted
        clock.restart();
        assert_eq!(clock.current_time(), Err(ClockError::NotRunning));

        clock.advance_at(48_000, 2_000_000_000);
        clock.advance_at(72_000, 2_500_000_000);
        let rate = clock.current_time().unwrap().rate_scalar;
        assert!((rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_anchor_pairs_are_never_mixed() {
        // Every anchor is stamped at 1000 ns per frame; a torn pair would break that
        let clock = Arc::new(clock());
        let done = Arc::new(AtomicBool::new(false));

        let callback = {
            let clock = Arc::clone(&clock);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for n in 1..100_000i64 {
                    clock.restart();
                    clock.advance_at(n, n * 1000);
                }
                done.store(true, Ordering::Release);
            })
        };

        while !done.load(Ordering::Acquire) {
            if let Some((sample, nanos)) = clock.anchor.snapshot() {
                assert_eq!(nanos, sample * 1000);
            }
        }
        callback.join().unwrap();
        assert_eq!(clock.anchor.snapshot(), Some((99_999, 99_999_000)));
    }

    #[test]
    fn test_real_time_advance() {
        let clock = clock();
        clock.advance(128);
        assert_eq!(clock.current_time().unwrap().sample_time, 128.0);
    }
}
