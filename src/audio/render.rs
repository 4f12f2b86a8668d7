//! Per-callback render logic for both sides of a playthrough
//!
//! The cpal boundary in `session` turns interleaved device buffers into
//! per-channel `f32` slices and hands them to these renderers, so
//! everything here can be driven directly from tests.
//!
//! Neither renderer allocates, locks, or logs. Anything worth reporting
//! is counted in [`SessionStats`] and picked up by the control thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::clock::{ClockSource, DeviceClock};
use super::dc_filter::DcRejectionFilter;
use super::ring_buffer::{RingBufferError, RingReader, RingWriter};
use super::tracker::{TrackerPhase, TrackerState};
use super::varispeed::RateControl;
use crate::analysis::FftFeed;

/// Counters updated from the audio callbacks
#[derive(Default)]
pub struct SessionStats {
    input_callbacks: AtomicU64,
    output_callbacks: AtomicU64,
    dropped_writes: AtomicU64,
    overloads: AtomicU64,
    resyncs: AtomicU64,
    clock_misses: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub input_callbacks: u64,
    pub output_callbacks: u64,
    /// Input blocks larger than the ring capacity
    pub dropped_writes: u64,
    /// Bounds reads that never saw a consistent snapshot
    pub overloads: u64,
    pub resyncs: u64,
    /// Output callbacks silenced because a device clock was unreadable
    pub clock_misses: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            input_callbacks: self.input_callbacks.load(Ordering::Relaxed),
            output_callbacks: self.output_callbacks.load(Ordering::Relaxed),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            overloads: self.overloads.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            clock_misses: self.clock_misses.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One-shot flag set by the control thread, consumed by a callback
#[derive(Default)]
pub struct RestartFlag(AtomicBool);

impl RestartFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once per `raise`
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Analysis path of the input side: mono mix, DC filter, FFT staging
pub struct AnalysisTap {
    feed: FftFeed,
    filter: DcRejectionFilter,
    mono: Vec<f32>,
}

impl AnalysisTap {
    /// `max_frames` bounds the block size passed to [`InputRenderer::render`]
    pub fn new(feed: FftFeed, max_frames: usize) -> Self {
        Self {
            feed,
            filter: DcRejectionFilter::new(),
            mono: vec![0.0; max_frames],
        }
    }

    fn process(&mut self, frames: &[Vec<f32>], frame_count: usize) {
        if !self.feed.needs_new_data() {
            return;
        }
        let n = frame_count.min(self.mono.len());
        let mono = &mut self.mono[..n];
        mono.fill(0.0);
        for channel in frames {
            for (sum, &sample) in mono.iter_mut().zip(channel.iter()) {
                *sum += sample;
            }
        }
        self.filter.process_in_place(mono);
        self.feed.copy_audio_data(mono);
    }
}

/// Input callback: stamps the clock, feeds the analysis tap and stores frames
pub struct InputRenderer {
    writer: RingWriter,
    tracker: Arc<TrackerState>,
    clock: Arc<DeviceClock>,
    stats: Arc<SessionStats>,
    restart: Arc<RestartFlag>,
    analysis: Option<AnalysisTap>,
    sample_time: i64,
}

impl InputRenderer {
    pub fn new(
        writer: RingWriter,
        tracker: Arc<TrackerState>,
        clock: Arc<DeviceClock>,
        stats: Arc<SessionStats>,
        restart: Arc<RestartFlag>,
        analysis: Option<AnalysisTap>,
    ) -> Self {
        Self {
            writer,
            tracker,
            clock,
            stats,
            restart,
            analysis,
            sample_time: 0,
        }
    }

    /// Handle one block of `frame_count` captured frames per channel
    pub fn render(&mut self, frames: &[Vec<f32>], frame_count: usize) {
        SessionStats::bump(&self.stats.input_callbacks);

        if self.restart.take() {
            // Skip a full ring so the next store evicts audio from before the stop
            self.sample_time += self.writer.capacity_frames() as i64;
            if let Some(tap) = self.analysis.as_mut() {
                tap.filter.reset();
            }
        }

        self.clock.advance(self.sample_time);
        self.tracker.record_input(self.sample_time as f64);

        if let Some(tap) = self.analysis.as_mut() {
            tap.process(frames, frame_count);
        }

        match self.writer.store(frames, frame_count, self.sample_time) {
            Ok(()) => {}
            Err(RingBufferError::TooMuch { .. }) => SessionStats::bump(&self.stats.dropped_writes),
            Err(_) => SessionStats::bump(&self.stats.overloads),
        }

        self.sample_time += frame_count as i64;
    }
}

/// What an output render produced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputOutcome {
    /// Input has not started; silence
    Idle,
    /// A device clock could not be read; silence
    ClockMiss,
    /// First output callback of the run; offset folded, silence
    Armed,
    /// Frames copied from the ring buffer (the rest is silence)
    Played(usize),
    /// Read fell outside the buffered history; silence and offset reset
    Resynced,
}

/// Output side: follows the offset tracker and reads from the ring buffer
///
/// `sample_time` passed to [`render`](Self::render) is the pull-side time
/// of the varispeed, so reads happen in the input device's time domain.
pub struct OutputRenderer<C: ClockSource> {
    reader: RingReader,
    tracker: Arc<TrackerState>,
    input_clock: C,
    output_clock: C,
    stats: Arc<SessionStats>,
}

impl<C: ClockSource> OutputRenderer<C> {
    pub fn new(
        reader: RingReader,
        tracker: Arc<TrackerState>,
        input_clock: C,
        output_clock: C,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            reader,
            tracker,
            input_clock,
            output_clock,
            stats,
        }
    }

    /// Fill `out[..][..frame_count]` for output sample time `sample_time`
    pub fn render(
        &mut self,
        out: &mut [Vec<f32>],
        frame_count: usize,
        sample_time: f64,
        rate: &mut dyn RateControl,
    ) -> OutputOutcome {
        SessionStats::bump(&self.stats.output_callbacks);

        if self.tracker.phase() == TrackerPhase::Idle {
            silence(out, frame_count);
            return OutputOutcome::Idle;
        }

        let (input_now, output_now) = match (self.input_clock.current_time(), self.output_clock.current_time()) {
            (Ok(input), Ok(output)) => (input, output),
            _ => {
                SessionStats::bump(&self.stats.clock_misses);
                silence(out, frame_count);
                return OutputOutcome::ClockMiss;
            }
        };

        rate.set_playback_rate(input_now.rate_scalar / output_now.rate_scalar);

        if self.tracker.phase() == TrackerPhase::Armed {
            self.tracker.arm(sample_time);
            silence(out, frame_count);
            return OutputOutcome::Armed;
        }

        let read_at = self.tracker.read_position(sample_time);
        match self.reader.fetch(out, frame_count, read_at) {
            Ok(copied) if copied > 0 => OutputOutcome::Played(copied),
            Ok(_) => self.resync(out, frame_count, sample_time),
            Err(_) => {
                SessionStats::bump(&self.stats.overloads);
                self.resync(out, frame_count, sample_time)
            }
        }
    }

    fn resync(&mut self, out: &mut [Vec<f32>], frame_count: usize, sample_time: f64) -> OutputOutcome {
        silence(out, frame_count);
        if let Ok((start, _)) = self.reader.time_bounds() {
            self.tracker.resync(sample_time, start);
            SessionStats::bump(&self.stats.resyncs);
        }
        OutputOutcome::Resynced
    }
}

fn silence(out: &mut [Vec<f32>], frame_count: usize) {
    for channel in out.iter_mut() {
        let n = frame_count.min(channel.len());
        channel[..n].fill(0.0);
    }
}
