//! Varispeed resampler between the ring buffer and the output device
//!
//! Pulls frames at the input device's rate and produces frames at the
//! output device's rate, using linear interpolation. On top of the fixed
//! nominal-rate ratio a playback rate multiplier can be applied; the offset
//! tracker sets it every callback to follow the measured drift between the
//! two device clocks.
//!
//! The pull side keeps its own running sample time, which is the clock
//! domain the offset tracker works in for the output path.

/// Something that accepts a playback rate
pub trait RateControl {
    fn set_playback_rate(&mut self, rate: f64);
}

/// Allowed playback rate range
const MIN_RATE: f64 = 0.5;
const MAX_RATE: f64 = 2.0;

/// Rate requested from inside a pull, applied to the following chunk
#[derive(Debug, Default)]
pub struct PendingRate(Option<f64>);

impl PendingRate {
    /// Last rate set, if any
    pub fn requested(&self) -> Option<f64> {
        self.0
    }
}

impl RateControl for PendingRate {
    fn set_playback_rate(&mut self, rate: f64) {
        self.0 = Some(rate);
    }
}

/// One request for source frames
pub struct SourceRequest<'a> {
    /// Per-channel buffers to fill, at least `frames` long each
    pub buffers: &'a mut [Vec<f32>],
    pub frames: usize,
    /// Source sample time of the first requested frame
    pub sample_time: i64,
    /// Playback rate changes made while serving the request
    pub rate: &'a mut PendingRate,
}

pub struct Varispeed {
    /// Source frames per output frame at unity playback rate
    base_ratio: f64,
    playback_rate: f64,
    max_chunk: usize,
    /// Source frames waiting to be interpolated
    source: Vec<Vec<f32>>,
    available: usize,
    /// Fractional read position into `source`
    position: f64,
    /// Scratch the pull callback writes into
    pulled: Vec<Vec<f32>>,
    source_time: i64,
}

impl Varispeed {
    /// # Arguments
    /// * `channels` - Channel count on both sides
    /// * `source_rate` - Nominal rate of the pulled frames (input device)
    /// * `output_rate` - Nominal rate of the produced frames (output device)
    /// * `max_chunk` - Largest number of output frames rendered per pull
    pub fn new(channels: usize, source_rate: f64, output_rate: f64, max_chunk: usize) -> Self {
        let base_ratio = if output_rate > 0.0 { source_rate / output_rate } else { 1.0 };
        let max_chunk = max_chunk.max(1);
        let max_step = base_ratio * MAX_RATE;
        let capacity = (max_step * (max_chunk + 1) as f64).ceil() as usize + 4;

        Self {
            base_ratio,
            playback_rate: 1.0,
            max_chunk,
            source: vec![vec![0.0; capacity]; channels],
            available: 0,
            position: 0.0,
            pulled: vec![vec![0.0; capacity]; channels],
            source_time: 0,
        }
    }

    /// Drop buffered source frames and restart the source clock at zero
    pub fn reset(&mut self) {
        self.available = 0;
        self.position = 0.0;
        self.source_time = 0;
    }

    /// Fill `out[..][..frame_count]`, pulling source frames as needed
    ///
    /// `frame_count` is processed in chunks of at most `max_chunk` frames.
    pub fn render<F>(&mut self, out: &mut [Vec<f32>], frame_count: usize, mut pull: F)
    where
        F: FnMut(SourceRequest<'_>),
    {
        let mut done = 0;
        while done < frame_count {
            let n = (frame_count - done).min(self.max_chunk);
            self.render_chunk(out, done, n, &mut pull);
            done += n;
        }
    }

    fn render_chunk<F>(&mut self, out: &mut [Vec<f32>], out_offset: usize, n: usize, pull: &mut F)
    where
        F: FnMut(SourceRequest<'_>),
    {
        let step = self.base_ratio * self.playback_rate;

        // Interpolation reads frames idx and idx + 1 for the last output frame
        let last_index = (self.position + step * (n - 1) as f64).floor() as usize + 1;
        let needed = (last_index + 1).saturating_sub(self.available);

        if needed > 0 {
            let mut pending = PendingRate::default();
            pull(SourceRequest {
                buffers: &mut self.pulled,
                frames: needed,
                sample_time: self.source_time,
                rate: &mut pending,
            });

            for (source, pulled) in self.source.iter_mut().zip(self.pulled.iter()) {
                source[self.available..self.available + needed].copy_from_slice(&pulled[..needed]);
            }
            self.available += needed;
            self.source_time += needed as i64;

            if let Some(rate) = pending.requested() {
                self.set_playback_rate(rate);
            }
        }

        for i in 0..n {
            let position = self.position + step * i as f64;
            let index = position.floor() as usize;
            let frac = (position - index as f64) as f32;
            for (ch, dest) in out.iter_mut().enumerate() {
                let Some(source) = self.source.get(ch) else {
                    continue;
                };
                if let Some(sample) = dest.get_mut(out_offset + i) {
                    let a = source[index];
                    let b = source[index + 1];
                    *sample = a + (b - a) * frac;
                }
            }
        }

        let position = self.position + step * n as f64;

        let consumed = (position.floor() as usize).min(self.available);
        for source in &mut self.source {
            source.copy_within(consumed..self.available, 0);
        }
        self.available -= consumed;
        self.position = position - consumed as f64;
    }
}

impl RateControl for Varispeed {
    fn set_playback_rate(&mut self, rate: f64) {
        if rate.is_finite() {
            self.playback_rate = rate.clamp(MIN_RATE, MAX_RATE);
        }
    }
}
