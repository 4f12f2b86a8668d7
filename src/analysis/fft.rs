//! Magnitude spectrum of a window of captured audio
//!
//! A real window of N samples produces N/2 bins in decibels. The power of
//! each bin is normalised by the window length and offset by a tiny
//! constant so silence bottoms out around -128 dB instead of -inf.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Added to every bin's power before the dB conversion (-128 dB)
const ADJUST_0DB: f32 = 1.5849e-13;

pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    len: usize,
    norm: f32,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    /// Plan an analyzer for windows of `len` samples
    pub fn new(len: usize) -> Self {
        let len = len.max(2);
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(len);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        Self {
            fft,
            len,
            norm: 1.0 / len as f32,
            buffer: vec![Complex::new(0.0, 0.0); len],
            scratch,
        }
    }

    pub fn window_len(&self) -> usize {
        self.len
    }

    /// Number of bins produced per window
    pub fn output_len(&self) -> usize {
        self.len / 2
    }

    /// Compute the dB spectrum of `input` into `out`
    ///
    /// `input` shorter than the window is zero padded; `out` receives
    /// at most [`output_len`](Self::output_len) bins.
    pub fn compute(&mut self, input: &[f32], out: &mut [f32]) {
        for (i, c) in self.buffer.iter_mut().enumerate() {
            *c = Complex::new(input.get(i).copied().unwrap_or(0.0), 0.0);
        }

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        for (bin, value) in out.iter_mut().zip(self.buffer.iter()).take(self.output_len()) {
            let scaled = *value * self.norm;
            let power = scaled.norm_sqr() + ADJUST_0DB;
            *bin = 10.0 * power.log10();
        }
    }
}

/// Frequency and level of the loudest bin, ignoring DC
pub fn dominant_frequency(bins: &[f32], window_len: usize, sample_rate: f64) -> Option<(f64, f32)> {
    bins.iter()
        .enumerate()
        .skip(1)
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(k, &db)| (k as f64 * sample_rate / window_len as f64, db))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f64, rate: f64, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f64::consts::PI * freq * i as f64 / rate).sin() as f32)
            .collect()
    }

    #[test]
    fn test_silence_floor() {
        let mut analyzer = SpectrumAnalyzer::new(256);
        let mut out = vec![0.0; analyzer.output_len()];
        analyzer.compute(&vec![0.0; 256], &mut out);
        assert_eq!(out.len(), 128);
        for db in out {
            assert!((db - (-128.0)).abs() < 0.1);
        }
    }

    #[test]
    fn test_tone_peak_bin() {
        // Bin 32 of a 1024-point window at 48k is exactly 1500 Hz
        let mut analyzer = SpectrumAnalyzer::new(1024);
        let mut out = vec![0.0; analyzer.output_len()];
        analyzer.compute(&tone(1500.0, 48_000.0, 1024, 1.0), &mut out);

        let (freq, db) = dominant_frequency(&out, 1024, 48_000.0).unwrap();
        assert!((freq - 1500.0).abs() < 1e-6);
        // Full-scale sine: |X| / N = 0.5 -> -6 dB
        assert!((db - (-6.02)).abs() < 0.1);
    }

    #[test]
    fn test_short_input_is_padded() {
        let mut analyzer = SpectrumAnalyzer::new(64);
        let mut out = vec![0.0; 32];
        analyzer.compute(&[1.0; 8], &mut out);
        assert!(out.iter().all(|db| db.is_finite()));
    }

    #[test]
    fn test_dominant_frequency_empty() {
        assert!(dominant_frequency(&[], 64, 48_000.0).is_none());
        assert!(dominant_frequency(&[0.0], 64, 48_000.0).is_none());
    }
}
