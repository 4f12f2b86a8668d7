//! Playthrough session - one input device routed to one output device
//!
//! A session owns both cpal streams and everything their callbacks share:
//! the ring buffer halves, the offset tracker, both device clocks and the
//! FFT staging queue. It is built once for a device pair and format, and
//! thrown away (see `host`) when either changes.
//!
//! ## Signal path
//!
//! ```text
//! input callback  -> InputRenderer  -> RingWriter
//!                                   -> AnalysisTap -> FftFeed
//! output callback -> Varispeed -> OutputRenderer -> RingReader
//! ```

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use thiserror::Error;

use super::clock::DeviceClock;
use super::device::{AudioDevice, DeviceError};
use super::render::{AnalysisTap, InputRenderer, OutputRenderer, RestartFlag, SessionStats, StatsSnapshot};
use super::ring_buffer::{RingBuffer, RingBufferError};
use super::tracker::TrackerState;
use super::varispeed::Varispeed;
use crate::analysis::{BufferManager, SpectrumReader};

/// Session construction parameters
#[derive(Clone, Debug, PartialEq)]
pub struct PlaythroughConfig {
    /// Buffer size requested from both devices, in frames
    pub buffer_size_frames: u32,
    /// Ring capacity as a multiple of the buffer size
    pub ring_capacity_multiplier: u32,
    /// Largest block handed to the renderers at once
    pub max_frames_per_slice: usize,
    /// Analysis window in samples, `None` disables the analysis path
    pub analysis_window: Option<usize>,
    /// Measured clock rates are clamped to `1.0 ± max_rate_deviation`
    pub max_rate_deviation: f64,
}

impl Default for PlaythroughConfig {
    fn default() -> Self {
        Self {
            buffer_size_frames: 512,
            ring_capacity_multiplier: 20,
            max_frames_per_slice: 4096,
            analysis_window: Some(4096),
            max_rate_deviation: 0.02,
        }
    }
}

impl PlaythroughConfig {
    /// Requested ring buffer capacity before power-of-two rounding
    pub fn ring_capacity_frames(&self) -> u32 {
        self.buffer_size_frames.saturating_mul(self.ring_capacity_multiplier).max(1)
    }
}

#[derive(Error, Debug)]
pub enum PlaythroughError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Ring buffer error: {0}")]
    RingBuffer(#[from] RingBufferError),

    #[error("Failed to build stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("Failed to start stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("Failed to stop stream: {0}")]
    PauseStream(#[from] cpal::PauseStreamError),

    #[error("Unsupported sample format: {0:?}")]
    UnsupportedFormat(SampleFormat),

    #[error("'{0}' is not an {1} device")]
    WrongDirection(String, &'static str),
}

/// Something the control thread should react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A stream reported an error and is probably unusable
    StreamError { is_input: bool, message: String },
}

/// Thru latency: both devices' safety offsets and buffer sizes
pub fn thru_offset(input_safety: u32, input_buffer: u32, output_safety: u32, output_buffer: u32) -> f64 {
    (input_safety as f64) + (input_buffer as f64) + (output_safety as f64) + (output_buffer as f64)
}

/// State the output callback drives: varispeed in front of the renderer
struct OutputStage {
    renderer: OutputRenderer<Arc<DeviceClock>>,
    varispeed: Varispeed,
    clock: Arc<DeviceClock>,
    restart: Arc<RestartFlag>,
    scratch: Vec<Vec<f32>>,
    device_time: i64,
}

impl OutputStage {
    /// Render `frame_count` frames into `scratch`
    fn process(&mut self, frame_count: usize) {
        if self.restart.take() {
            self.varispeed.reset();
        }

        self.clock.advance(self.device_time);
        self.device_time += frame_count as i64;

        let renderer = &mut self.renderer;
        self.varispeed.render(&mut self.scratch, frame_count, |request| {
            renderer.render(request.buffers, request.frames, request.sample_time as f64, request.rate);
        });
    }
}

/// A running (or stopped) route from one input device to one output device
pub struct Playthrough {
    input_name: String,
    output_name: String,
    input_stream: Stream,
    output_stream: Stream,
    running: bool,
    channels: usize,
    tracker: Arc<TrackerState>,
    input_clock: Arc<DeviceClock>,
    output_clock: Arc<DeviceClock>,
    input_restart: Arc<RestartFlag>,
    output_restart: Arc<RestartFlag>,
    stats: Arc<SessionStats>,
    spectrum: Option<SpectrumReader>,
    ring_capacity: usize,
}

impl Playthrough {
    /// Build a stopped session between `input` and `output`
    ///
    /// Stream errors are reported on `events` for the owner to act on.
    pub fn new(
        input: &AudioDevice,
        output: &AudioDevice,
        config: &PlaythroughConfig,
        events: Sender<SessionEvent>,
    ) -> Result<Self, PlaythroughError> {
        if !input.is_input() {
            return Err(PlaythroughError::WrongDirection(input.name().to_string(), "input"));
        }
        if output.is_input() {
            return Err(PlaythroughError::WrongDirection(output.name().to_string(), "output"));
        }

        let channels = input.channel_count().min(output.channel_count());
        let max_chunk = config.max_frames_per_slice.max(1);

        let (input_config, input_buffer) = input.stream_config(config.buffer_size_frames);
        let (output_config, output_buffer) = output.stream_config(config.buffer_size_frames);

        let ring = RingBuffer::new(channels, config.ring_capacity_frames())?;
        let ring_capacity = ring.capacity_frames();
        log::debug!(
            "Ring buffer: {} channels x {} frames ({} bytes each)",
            ring.channel_count(),
            ring_capacity,
            ring.capacity_bytes()
        );
        let (writer, reader) = ring.split();

        let thru = thru_offset(input.safety_offset(), input_buffer, output.safety_offset(), output_buffer);
        let tracker = Arc::new(TrackerState::new(thru));

        let epoch = Instant::now();
        let input_rate = input.sample_rate() as f64;
        let output_rate = output.sample_rate() as f64;
        let input_clock = Arc::new(DeviceClock::new(input_rate, config.max_rate_deviation, epoch));
        let output_clock = Arc::new(DeviceClock::new(output_rate, config.max_rate_deviation, epoch));

        let stats = Arc::new(SessionStats::new());
        let input_restart = Arc::new(RestartFlag::new());
        let output_restart = Arc::new(RestartFlag::new());

        let (tap, spectrum) = match config.analysis_window {
            Some(window) => {
                let manager = BufferManager::new(window, input_rate);
                log::debug!("Analysis window: {} frames", manager.window_len());
                let (feed, reader) = manager.split();
                (Some(AnalysisTap::new(feed, max_chunk)), Some(reader))
            }
            None => (None, None),
        };

        let input_renderer = InputRenderer::new(
            writer,
            Arc::clone(&tracker),
            Arc::clone(&input_clock),
            Arc::clone(&stats),
            Arc::clone(&input_restart),
            tap,
        );

        let stage = OutputStage {
            renderer: OutputRenderer::new(
                reader,
                Arc::clone(&tracker),
                Arc::clone(&input_clock),
                Arc::clone(&output_clock),
                Arc::clone(&stats),
            ),
            varispeed: Varispeed::new(channels, input_rate, output_rate, max_chunk),
            clock: Arc::clone(&output_clock),
            restart: Arc::clone(&output_restart),
            scratch: vec![vec![0.0; max_chunk]; channels],
            device_time: 0,
        };

        log::info!(
            "Building playthrough '{}' -> '{}': {} channels, {} Hz -> {} Hz, ring {} frames, thru offset {}",
            input.name(),
            output.name(),
            channels,
            input.sample_rate(),
            output.sample_rate(),
            ring_capacity,
            thru
        );

        let input_stream = match input.sample_format() {
            SampleFormat::F32 => build_input::<f32>(input, &input_config, input_renderer, max_chunk, events.clone())?,
            SampleFormat::I16 => build_input::<i16>(input, &input_config, input_renderer, max_chunk, events.clone())?,
            SampleFormat::U16 => build_input::<u16>(input, &input_config, input_renderer, max_chunk, events.clone())?,
            format => return Err(PlaythroughError::UnsupportedFormat(format)),
        };

        let output_stream = match output.sample_format() {
            SampleFormat::F32 => build_output::<f32>(output, &output_config, stage, max_chunk, events)?,
            SampleFormat::I16 => build_output::<i16>(output, &output_config, stage, max_chunk, events)?,
            SampleFormat::U16 => build_output::<u16>(output, &output_config, stage, max_chunk, events)?,
            format => return Err(PlaythroughError::UnsupportedFormat(format)),
        };

        // Some backends start streams on creation
        for stream in [&input_stream, &output_stream] {
            if let Err(e) = stream.pause() {
                log::warn!("Could not pause new stream: {}", e);
            }
        }

        Ok(Self {
            input_name: input.name().to_string(),
            output_name: output.name().to_string(),
            input_stream,
            output_stream,
            running: false,
            channels,
            tracker,
            input_clock,
            output_clock,
            input_restart,
            output_restart,
            stats,
            spectrum,
            ring_capacity,
        })
    }

    /// Start both streams. Does nothing if already running.
    pub fn start(&mut self) -> Result<(), PlaythroughError> {
        if self.running {
            return Ok(());
        }

        self.tracker.reset();
        self.input_clock.restart();
        self.output_clock.restart();
        self.input_restart.raise();
        self.output_restart.raise();

        play_pair(&self.input_stream, &self.output_stream)?;

        self.running = true;
        log::info!("Playthrough started: '{}' -> '{}'", self.input_name, self.output_name);
        Ok(())
    }

    /// Stop both streams. Does nothing if already stopped.
    pub fn stop(&mut self) -> Result<(), PlaythroughError> {
        if !self.running {
            return Ok(());
        }
        self.running = false;

        let output = self.output_stream.pause();
        let input = self.input_stream.pause();
        log::info!("Playthrough stopped: '{}' -> '{}'", self.input_name, self.output_name);
        output?;
        input?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// Channels routed through the ring buffer
    pub fn channel_count(&self) -> usize {
        self.channels
    }

    pub fn ring_capacity_frames(&self) -> usize {
        self.ring_capacity
    }

    pub fn thru_offset(&self) -> f64 {
        self.tracker.thru_offset()
    }

    /// Current input-to-output offset in frames
    pub fn offset(&self) -> f64 {
        self.tracker.offset()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Consumer side of the analysis path, if enabled
    pub fn spectrum(&mut self) -> Option<&mut SpectrumReader> {
        self.spectrum.as_mut()
    }
}

/// Start input then output, pausing the input again if the output fails
fn play_pair(input: &impl StreamTrait, output: &impl StreamTrait) -> Result<(), PlaythroughError> {
    input.play()?;
    if let Err(e) = output.play() {
        if let Err(pause_err) = input.pause() {
            log::warn!("Error stopping input stream: {}", pause_err);
        }
        return Err(e.into());
    }
    Ok(())
}

impl Drop for Playthrough {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Error stopping playthrough: {}", e);
        }
    }
}

fn build_input<T>(
    device: &AudioDevice,
    config: &StreamConfig,
    mut renderer: InputRenderer,
    max_chunk: usize,
    events: Sender<SessionEvent>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let device_channels = (config.channels as usize).max(1);
    let channels = device.channel_count().min(device_channels);
    let mut scratch = vec![vec![0.0f32; max_chunk]; channels];

    device.cpal_device().build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for block in data.chunks(max_chunk * device_channels) {
                let frames = block.len() / device_channels;
                for (i, frame) in block.chunks_exact(device_channels).enumerate() {
                    for (buffer, &sample) in scratch.iter_mut().zip(frame.iter()) {
                        buffer[i] = sample.to_sample::<f32>();
                    }
                }
                renderer.render(&scratch, frames);
            }
        },
        move |err| {
            let _ = events.send(SessionEvent::StreamError {
                is_input: true,
                message: err.to_string(),
            });
        },
        None,
    )
}

fn build_output<T>(
    device: &AudioDevice,
    config: &StreamConfig,
    mut stage: OutputStage,
    max_chunk: usize,
    events: Sender<SessionEvent>,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let device_channels = (config.channels as usize).max(1);

    device.cpal_device().build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            for block in data.chunks_mut(max_chunk * device_channels) {
                let frames = block.len() / device_channels;
                stage.process(frames);
                for (i, frame) in block.chunks_exact_mut(device_channels).enumerate() {
                    for (ch, sample) in frame.iter_mut().enumerate() {
                        // Extra output channels get silence
                        *sample = match stage.scratch.get(ch) {
                            Some(buffer) => T::from_sample(buffer[i]),
                            None => T::EQUILIBRIUM,
                        };
                    }
                }
            }
        },
        move |err| {
            let _ = events.send(SessionEvent::StreamError {
                is_input: false,
                message: err.to_string(),
            });
        },
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PlaythroughConfig::default();
        assert_eq!(config.buffer_size_frames, 512);
        assert_eq!(config.ring_capacity_frames(), 10_240);
        assert_eq!(config.analysis_window, Some(4096));
    }

    #[test]
    fn test_ring_capacity_saturates() {
        let config = PlaythroughConfig {
            buffer_size_frames: u32::MAX,
            ..Default::default()
        };
        assert_eq!(config.ring_capacity_frames(), u32::MAX);

        let config = PlaythroughConfig {
            buffer_size_frames: 0,
            ..Default::default()
        };
        assert_eq!(config.ring_capacity_frames(), 1);
    }

    #[test]
    fn test_thru_offset_sums_latencies() {
        assert!((thru_offset(0, 512, 0, 256) - 768.0).abs() < 1e-9);
        assert!((thru_offset(32, 512, 16, 256) - 816.0).abs() < 1e-9);
    }

    struct FakeStream {
        fail_play: bool,
        fail_pause: bool,
        playing: std::cell::Cell<bool>,
    }

    impl FakeStream {
        fn new(fail_play: bool, fail_pause: bool) -> Self {
            Self {
                fail_play,
                fail_pause,
                playing: std::cell::Cell::new(false),
            }
        }
    }

    impl StreamTrait for FakeStream {
        fn play(&self) -> Result<(), cpal::PlayStreamError> {
            if self.fail_play {
                return Err(cpal::PlayStreamError::DeviceNotAvailable);
            }
            self.playing.set(true);
            Ok(())
        }

        fn pause(&self) -> Result<(), cpal::PauseStreamError> {
            if self.fail_pause {
                return Err(cpal::PauseStreamError::DeviceNotAvailable);
            }
            self.playing.set(false);
            Ok(())
        }
    }

    #[test]
    fn test_play_pair_starts_both() {
        let (input, output) = (FakeStream::new(false, false), FakeStream::new(false, false));
        play_pair(&input, &output).unwrap();
        assert!(input.playing.get());
        assert!(output.playing.get());
    }

    #[test]
    fn test_play_pair_rolls_back_input() {
        let (input, output) = (FakeStream::new(false, false), FakeStream::new(true, false));
        let result = play_pair(&input, &output);
        assert!(matches!(result, Err(PlaythroughError::PlayStream(_))));
        assert!(!input.playing.get());
    }

    #[test]
    fn test_play_pair_reports_play_error_when_rollback_fails() {
        // The pause failure is only logged; the caller sees why the output failed
        let (input, output) = (FakeStream::new(false, true), FakeStream::new(true, false));
        let result = play_pair(&input, &output);
        assert!(matches!(result, Err(PlaythroughError::PlayStream(_))));
        assert!(input.playing.get());
    }

    #[test]
    fn test_output_stage_streams_input() {
        let (mut writer, reader) = RingBuffer::new(1, 1024).unwrap().split();
        let tracker = Arc::new(TrackerState::new(0.0));
        let epoch = Instant::now();
        let input_clock = Arc::new(DeviceClock::new(48_000.0, 0.02, epoch));
        let output_clock = Arc::new(DeviceClock::new(48_000.0, 0.02, epoch));
        let stats = Arc::new(SessionStats::new());

        let mut stage = OutputStage {
            renderer: OutputRenderer::new(
                reader,
                Arc::clone(&tracker),
                Arc::clone(&input_clock),
                Arc::clone(&output_clock),
                Arc::clone(&stats),
            ),
            varispeed: Varispeed::new(1, 48_000.0, 48_000.0, 64),
            clock: Arc::clone(&output_clock),
            restart: Arc::new(RestartFlag::new()),
            scratch: vec![vec![0.0; 64]],
            device_time: 0,
        };

        let block: Vec<f32> = (0..512).map(|i| i as f32).collect();
        writer.store(&[&block], 512, 0).unwrap();
        input_clock.advance(0);
        tracker.record_input(0.0);

        // First pass arms, the following ones stream
        stage.process(64);
        stage.process(64);
        stage.process(64);

        let snapshot = stats.snapshot();
        assert!(snapshot.output_callbacks >= 3);
        assert_eq!(tracker.phase(), crate::audio::tracker::TrackerPhase::Streaming);
        assert!(stage.scratch[0].iter().any(|&s| s != 0.0));
    }
}
