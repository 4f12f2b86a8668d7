//! FFT staging between the input callback and the analysis consumer
//!
//! The input callback asks [`FftFeed::needs_new_data`] before doing any
//! analysis work. While it returns true, DC-filtered samples are pushed
//! until a full window has been staged; the feed then flips the handshake
//! to "has new data" and stops pushing. The consumer computes the spectrum
//! from the staged window and flips the handshake back.
//!
//! Staged samples travel through a `ringbuf` SPSC queue sized to exactly
//! one window, so the callback never allocates or blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::fft::{dominant_frequency, SpectrumAnalyzer};
use crate::audio::bits::next_power_of_two;

/// Largest analysis window
const MAX_WINDOW: u32 = 1 << 20;

/// Handshake flags shared by both halves
struct Handshake {
    needs_new_data: AtomicBool,
    has_new_data: AtomicBool,
}

/// Owns the staging queue until it is split between the two threads
pub struct BufferManager {
    window_len: usize,
    sample_rate: f64,
    ring: HeapRb<f32>,
}

impl BufferManager {
    /// # Arguments
    /// * `window_len` - Samples per analysis window, rounded up to a power of two
    /// * `sample_rate` - Rate of the staged samples, for bin frequencies
    pub fn new(window_len: usize, sample_rate: f64) -> Self {
        let window_len = u32::try_from(window_len.max(2))
            .ok()
            .and_then(next_power_of_two)
            .unwrap_or(MAX_WINDOW)
            .min(MAX_WINDOW) as usize;
        Self {
            window_len,
            sample_rate,
            ring: HeapRb::new(window_len),
        }
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Split into the callback-side feed and the consumer-side reader
    pub fn split(self) -> (FftFeed, SpectrumReader) {
        let handshake = Arc::new(Handshake {
            needs_new_data: AtomicBool::new(true),
            has_new_data: AtomicBool::new(false),
        });
        let (producer, consumer) = self.ring.split();

        (
            FftFeed {
                handshake: Arc::clone(&handshake),
                producer,
            },
            SpectrumReader {
                handshake,
                consumer,
                analyzer: SpectrumAnalyzer::new(self.window_len),
                window: vec![0.0; self.window_len],
                spectrum: vec![0.0; self.window_len / 2],
                sample_rate: self.sample_rate,
            },
        )
    }
}

/// Input-callback side of the staging queue
pub struct FftFeed {
    handshake: Arc<Handshake>,
    producer: HeapProd<f32>,
}

impl FftFeed {
    pub fn needs_new_data(&self) -> bool {
        self.handshake.needs_new_data.load(Ordering::Acquire)
    }

    /// Stage as many samples as still fit in the current window
    pub fn copy_audio_data(&mut self, samples: &[f32]) {
        if !self.needs_new_data() {
            return;
        }
        self.producer.push_slice(samples);
        if self.producer.is_full() {
            self.handshake.needs_new_data.store(false, Ordering::Release);
            self.handshake.has_new_data.store(true, Ordering::Release);
        }
    }
}

/// Consumer side: turns staged windows into spectra
pub struct SpectrumReader {
    handshake: Arc<Handshake>,
    consumer: HeapCons<f32>,
    analyzer: SpectrumAnalyzer,
    window: Vec<f32>,
    spectrum: Vec<f32>,
    sample_rate: f64,
}

impl SpectrumReader {
    pub fn has_new_data(&self) -> bool {
        self.handshake.has_new_data.load(Ordering::Acquire)
    }

    /// Spectrum in dB of the staged window, if one is complete
    ///
    /// Consuming the window re-arms the feed for the next one.
    pub fn fft_output(&mut self) -> Option<&[f32]> {
        if !self.has_new_data() {
            return None;
        }

        let read = self.consumer.pop_slice(&mut self.window);
        self.window[read..].fill(0.0);
        self.analyzer.compute(&self.window, &mut self.spectrum);

        self.handshake.has_new_data.store(false, Ordering::Release);
        self.handshake.needs_new_data.store(true, Ordering::Release);
        Some(&self.spectrum)
    }

    /// Frequency and level of the loudest bin of the latest window
    pub fn dominant_frequency(&mut self) -> Option<(f64, f32)> {
        let window_len = self.analyzer.window_len();
        let sample_rate = self.sample_rate;
        let spectrum = self.fft_output()?;
        dominant_frequency(spectrum, window_len, sample_rate)
    }
}
