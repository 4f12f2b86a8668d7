//! Input-to-output sample offset tracking
//!
//! The input and output streams count sample time independently and start
//! at different moments. The tracker records when each side first ran and
//! keeps the offset that maps an output sample time onto the input sample
//! time the ring buffer was written at:
//!
//! ```text
//! read position = output sample time - in_to_out_offset
//! ```
//!
//! ## States (per run)
//!
//! - **Idle**: the input callback has not fired yet
//! - **Armed**: input has fired, the output side records its first time
//!   and folds the startup skew into the offset
//! - **Streaming**: reads follow the offset, with a hard resync whenever a
//!   read falls completely outside the buffered history
//!
//! `first_input_time` is the only value written from the input thread.
//! It goes from the unset sentinel to a value once per run; the output
//! thread reading a stale sentinel just arms one callback later.

use portable_atomic::AtomicF64;
use std::sync::atomic::Ordering;

/// Sentinel for a first time that has not been recorded yet
pub const UNSET_TIME: f64 = -1.0;

/// Where the output side of a run currently is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerPhase {
    Idle,
    Armed,
    Streaming,
}

/// Fold the startup skew between the two streams into the offset
///
/// `delta = first_input - first_output`. A negative delta widens the
/// offset, otherwise the offset is replaced by `-delta + offset`.
pub fn fold_start_delta(first_input_time: f64, first_output_time: f64, offset: f64) -> f64 {
    let delta = first_input_time - first_output_time;
    if delta < 0.0 {
        offset - delta
    } else {
        -delta + offset
    }
}

/// Offset state shared by the session and both callbacks
pub struct TrackerState {
    first_input_time: AtomicF64,
    first_output_time: AtomicF64,
    in_to_out_offset: AtomicF64,
    /// Initial latency between the devices: safety offsets plus buffer sizes
    thru_offset: f64,
}

impl TrackerState {
    pub fn new(thru_offset: f64) -> Self {
        Self {
            first_input_time: AtomicF64::new(UNSET_TIME),
            first_output_time: AtomicF64::new(UNSET_TIME),
            in_to_out_offset: AtomicF64::new(thru_offset),
            thru_offset,
        }
    }

    /// Forget both first times so the next run arms again
    pub fn reset(&self) {
        self.first_input_time.store(UNSET_TIME, Ordering::Release);
        self.first_output_time.store(UNSET_TIME, Ordering::Release);
    }

    pub fn thru_offset(&self) -> f64 {
        self.thru_offset
    }

    pub fn first_input_time(&self) -> f64 {
        self.first_input_time.load(Ordering::Acquire)
    }

    pub fn first_output_time(&self) -> f64 {
        self.first_output_time.load(Ordering::Acquire)
    }

    pub fn offset(&self) -> f64 {
        self.in_to_out_offset.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> TrackerPhase {
        if self.first_input_time() < 0.0 {
            TrackerPhase::Idle
        } else if self.first_output_time() < 0.0 {
            TrackerPhase::Armed
        } else {
            TrackerPhase::Streaming
        }
    }

    /// Input callback: record the first input sample time of the run
    pub fn record_input(&self, sample_time: f64) {
        if self.first_input_time.load(Ordering::Relaxed) < 0.0 {
            self.first_input_time.store(sample_time, Ordering::Release);
        }
    }

    /// Output callback, Armed state: record the first output time and
    /// rebase the offset on the thru latency plus the startup skew
    pub fn arm(&self, output_sample_time: f64) -> f64 {
        self.first_output_time.store(output_sample_time, Ordering::Release);
        let offset = fold_start_delta(self.first_input_time(), output_sample_time, self.thru_offset);
        self.in_to_out_offset.store(offset, Ordering::Release);
        offset
    }

    /// Output callback: hard resync so the next read starts at the oldest buffered frame
    pub fn resync(&self, output_sample_time: f64, buffer_start_time: i64) -> f64 {
        let offset = output_sample_time - buffer_start_time as f64;
        self.in_to_out_offset.store(offset, Ordering::Release);
        offset
    }

    /// Input sample time that output sample time `output_sample_time` reads from
    pub fn read_position(&self, output_sample_time: f64) -> i64 {
        (output_sample_time - self.offset()) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_negative_delta_widens() {
        // Output started 50 frames after input
        assert_eq!(fold_start_delta(1000.0, 1050.0, 0.0), 50.0);
        assert_eq!(fold_start_delta(1000.0, 1050.0, 512.0), 562.0);
    }

    #[test]
    fn test_fold_positive_delta() {
        assert_eq!(fold_start_delta(1050.0, 1000.0, 512.0), 462.0);
        assert_eq!(fold_start_delta(1000.0, 1000.0, 512.0), 512.0);
    }

    #[test]
    fn test_phases() {
        let tracker = TrackerState::new(0.0);
        assert_eq!(tracker.phase(), TrackerPhase::Idle);

        tracker.record_input(1000.0);
        assert_eq!(tracker.phase(), TrackerPhase::Armed);

        // Later input callbacks do not move the first time
        tracker.record_input(1512.0);
        assert_eq!(tracker.first_input_time(), 1000.0);

        tracker.arm(1050.0);
        assert_eq!(tracker.phase(), TrackerPhase::Streaming);

        tracker.reset();
        assert_eq!(tracker.phase(), TrackerPhase::Idle);
        assert_eq!(tracker.first_output_time(), UNSET_TIME);
    }

    #[test]
    fn test_arm_offset_update() {
        let tracker = TrackerState::new(0.0);
        tracker.record_input(1000.0);
        let offset = tracker.arm(1050.0);
        assert_eq!(offset, 50.0);
        assert_eq!(tracker.offset(), 50.0);
        assert_eq!(tracker.first_output_time(), 1050.0);

        // Output time 1050 reads the frame the input wrote at 1000
        assert_eq!(tracker.read_position(1050.0), 1000);
    }

    #[test]
    fn test_arm_rebases_on_thru_offset() {
        let tracker = TrackerState::new(1024.0);
        tracker.record_input(0.0);
        tracker.resync(5000.0, 100);
        assert_eq!(tracker.offset(), 4900.0);

        tracker.reset();
        tracker.record_input(200.0);
        assert_eq!(tracker.arm(300.0), 1124.0);
    }

    #[test]
    fn test_resync() {
        let tracker = TrackerState::new(256.0);
        assert_eq!(tracker.resync(10_000.0, 9_000), 1_000.0);
        assert_eq!(tracker.read_position(10_000.0), 9_000);
    }
}
