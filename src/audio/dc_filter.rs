//! DC rejection filter for the analysis path
//!
//! A single-pole high-pass: `y[n] = x[n] - x[n-1] + R * y[n-1]`.
//! Only the captured signal sent to spectrum analysis goes through it;
//! the audio written to the ring buffer stays untouched.

/// Default pole distance from the unit circle
pub const DEFAULT_POLE: f32 = 0.975;

/// Stateful DC blocker, processes buffers in place
#[derive(Clone, Debug)]
pub struct DcRejectionFilter {
    pole: f32,
    /// Previous input sample
    x1: f32,
    /// Previous output sample
    y1: f32,
}

impl DcRejectionFilter {
    pub fn new() -> Self {
        Self {
            pole: DEFAULT_POLE,
            x1: 0.0,
            y1: 0.0,
        }
    }

    /// Filter `samples` in place, carrying state over from the previous call
    pub fn process_in_place(&mut self, samples: &mut [f32]) {
        for sample in samples.iter_mut() {
            let x = *sample;
            let y = x - self.x1 + self.pole * self.y1;
            self.x1 = x;
            self.y1 = y;
            *sample = y;
        }
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.y1 = 0.0;
    }
}

impl Default for DcRejectionFilter {
    fn default() -> Self {
        Self::new()
    }
}
