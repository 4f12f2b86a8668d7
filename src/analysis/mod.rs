//! Spectral analysis of the captured signal
//!
//! - FFT staging between the input callback and the consumer
//! - dB magnitude spectrum and dominant-frequency lookup

mod buffer_manager;
mod fft;

pub use buffer_manager::{BufferManager, FftFeed, SpectrumReader};
pub use fft::{dominant_frequency, SpectrumAnalyzer};
