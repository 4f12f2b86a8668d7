//! Time-addressed ring buffer shared between the input and output callbacks
//!
//! Frames are stored per channel at absolute sample times. The physical
//! position of frame `t` is `t & mask`, so the capacity is always a power
//! of two. The readable region is tracked as `[start, end)` in absolute
//! frames and published through a [`TimeBoundsHistory`], which lets the
//! writer (input callback) and the reader (output callback) run at the
//! same time without ever taking a lock.
//!
//! ## Design Notes
//!
//! Samples live in `AtomicU32` cells holding `f32` bits. Relaxed loads and
//! stores compile down to plain moves, and the history's release/acquire
//! pointer handoff is what makes freshly written frames visible to the
//! reader: new bounds are always published *after* the frames they cover.
//!
//! Every operation copies in at most two contiguous segments per channel,
//! one up to the physical end of storage and one from its start.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

use super::bits::next_power_of_two;
use super::time_bounds::TimeBoundsHistory;

/// Absolute frame position in a device's stream
pub type SampleTime = i64;

/// Errors reported by ring buffer operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("Write of {frames} frames exceeds ring capacity of {capacity} frames")]
    TooMuch { frames: usize, capacity: usize },

    #[error("Could not read consistent time bounds")]
    CpuOverload,

    #[error("Invalid ring buffer capacity: {0} frames")]
    InvalidCapacity(u32),

    #[error("Ring buffer needs at least one channel")]
    NoChannels,
}

/// Storage and bounds shared by the writer and reader halves
struct Storage {
    channels: Vec<Box<[AtomicU32]>>,
    capacity_frames: usize,
    capacity_mask: i64,
    history: TimeBoundsHistory,
}

impl Storage {
    fn allocate(channel_count: usize, requested_frames: u32) -> Result<Self, RingBufferError> {
        if channel_count == 0 {
            return Err(RingBufferError::NoChannels);
        }
        if requested_frames == 0 {
            return Err(RingBufferError::InvalidCapacity(requested_frames));
        }
        let capacity = next_power_of_two(requested_frames)
            .ok_or(RingBufferError::InvalidCapacity(requested_frames))? as usize;

        let channels = (0..channel_count)
            .map(|_| (0..capacity).map(|_| AtomicU32::new(0)).collect())
            .collect();

        Ok(Self {
            channels,
            capacity_frames: capacity,
            capacity_mask: capacity as i64 - 1,
            history: TimeBoundsHistory::new(),
        })
    }

    fn frame_offset(&self, frame: SampleTime) -> usize {
        (frame & self.capacity_mask) as usize
    }

    /// Split `count` frames starting at `frame` into at most two physical runs.
    /// Calls `f(physical_offset, logical_offset, len)` for each run.
    fn for_each_segment(&self, frame: SampleTime, count: usize, mut f: impl FnMut(usize, usize, usize)) {
        if count == 0 {
            return;
        }
        let offset = self.frame_offset(frame);
        let first = count.min(self.capacity_frames - offset);
        f(offset, 0, first);
        if count > first {
            f(0, first, count - first);
        }
    }

    fn zero_range(&self, frame: SampleTime, count: usize) {
        self.for_each_segment(frame, count, |phys, _, len| {
            for channel in &self.channels {
                for cell in &channel[phys..phys + len] {
                    cell.store(0, Ordering::Relaxed);
                }
            }
        });
    }

    fn store<S: AsRef<[f32]>>(
        &self,
        frames: &[S],
        frame_count: usize,
        start_write: SampleTime,
    ) -> Result<(), RingBufferError> {
        if frame_count == 0 {
            return Ok(());
        }
        if frame_count > self.capacity_frames {
            return Err(RingBufferError::TooMuch {
                frames: frame_count,
                capacity: self.capacity_frames,
            });
        }

        let capacity = self.capacity_frames as i64;
        let end_write = start_write + frame_count as i64;
        let (start, end) = self.history.current();

        if start_write < end {
            // Going backwards: throw everything out
            self.history.publish(start_write, start_write);
        } else if end_write - start > capacity {
            // Advance the start past the region about to be overwritten
            let new_start = end_write - capacity;
            let new_end = new_start.max(end);
            self.history.publish(new_start, new_end);
        }

        let (start, end) = self.history.current();

        // Skipped frames become silence
        if start_write > end {
            self.zero_range(end, (start_write - end) as usize);
        }

        self.for_each_segment(start_write, frame_count, |phys, src, len| {
            for (ch, channel) in self.channels.iter().enumerate() {
                let source = frames.get(ch).map(|s| s.as_ref()).unwrap_or(&[]);
                for (i, cell) in channel[phys..phys + len].iter().enumerate() {
                    let sample = source.get(src + i).copied().unwrap_or(0.0);
                    cell.store(sample.to_bits(), Ordering::Relaxed);
                }
            }
        });

        // Publishing the new end makes the frames above visible to the reader
        self.history.publish(start, end_write);
        Ok(())
    }

    fn time_bounds(&self) -> Result<(SampleTime, SampleTime), RingBufferError> {
        self.history.snapshot().ok_or(RingBufferError::CpuOverload)
    }

    fn fetch<D: AsMut<[f32]>>(
        &self,
        out: &mut [D],
        frame_count: usize,
        start_read: SampleTime,
    ) -> Result<usize, RingBufferError> {
        if frame_count == 0 {
            return Ok(0);
        }

        let end_read = start_read + frame_count as i64;
        let (start_time, end_time) = self.time_bounds()?;

        let (clipped_start, clipped_end) = if start_read > end_time || end_read < start_time {
            (start_read, start_read)
        } else {
            let s = start_read.max(start_time);
            let e = end_read.min(end_time).max(s);
            (s, e)
        };

        let leading = (clipped_start - start_read) as usize;
        let copied = (clipped_end - clipped_start) as usize;

        for (ch, dest) in out.iter_mut().enumerate() {
            let dest = dest.as_mut();
            let limit = frame_count.min(dest.len());
            let Some(channel) = self.channels.get(ch) else {
                dest[..limit].fill(0.0);
                continue;
            };

            // Silence before the valid region and after it
            dest[..leading.min(limit)].fill(0.0);
            if leading + copied < limit {
                dest[leading + copied..limit].fill(0.0);
            }

            self.for_each_segment(clipped_start, copied, |phys, dst, len| {
                for (i, cell) in channel[phys..phys + len].iter().enumerate() {
                    if let Some(sample) = dest.get_mut(leading + dst + i) {
                        *sample = f32::from_bits(cell.load(Ordering::Relaxed));
                    }
                }
            });
        }

        Ok(copied)
    }
}

/// Multi-channel ring buffer addressed by absolute sample time
///
/// Owns its storage until [`split`](RingBuffer::split) hands out a writer
/// and a reader for the two audio callbacks.
///
/// ## Example
///
/// ```ignore
/// let mut ring = RingBuffer::new(2, 100)?; // capacity rounds up to 128
/// ring.store(&[left, right], 64, 0)?;
/// let copied = ring.fetch(&mut out, 64, 0)?;
/// ```
pub struct RingBuffer {
    storage: Storage,
}

impl RingBuffer {
    /// Allocate a ring buffer
    ///
    /// # Arguments
    /// * `channel_count` - Number of independent channel buffers
    /// * `capacity_frames` - Requested capacity, rounded up to a power of two
    pub fn new(channel_count: usize, capacity_frames: u32) -> Result<Self, RingBufferError> {
        Ok(Self {
            storage: Storage::allocate(channel_count, capacity_frames)?,
        })
    }

    /// Reallocate, discarding all content and resetting the time bounds
    pub fn allocate(&mut self, channel_count: usize, capacity_frames: u32) -> Result<(), RingBufferError> {
        self.storage = Storage::allocate(channel_count, capacity_frames)?;
        Ok(())
    }

    /// Write `frame_count` frames per channel starting at `start_write`
    ///
    /// Fails with [`RingBufferError::TooMuch`] when more frames than the
    /// capacity are written, leaving the buffer untouched.
    pub fn store<S: AsRef<[f32]>>(
        &mut self,
        frames: &[S],
        frame_count: usize,
        start_write: SampleTime,
    ) -> Result<(), RingBufferError> {
        self.storage.store(frames, frame_count, start_write)
    }

    /// Read `frame_count` frames per channel starting at `start_read`
    ///
    /// Any part of the window outside the valid region is filled with
    /// silence. Returns the number of frames actually copied from the
    /// buffer; 0 means the whole window was silence.
    pub fn fetch<D: AsMut<[f32]>>(
        &self,
        out: &mut [D],
        frame_count: usize,
        start_read: SampleTime,
    ) -> Result<usize, RingBufferError> {
        self.storage.fetch(out, frame_count, start_read)
    }

    /// Current valid region `[start, end)`
    pub fn time_bounds(&self) -> Result<(SampleTime, SampleTime), RingBufferError> {
        self.storage.time_bounds()
    }

    pub fn channel_count(&self) -> usize {
        self.storage.channels.len()
    }

    pub fn capacity_frames(&self) -> usize {
        self.storage.capacity_frames
    }

    /// Bytes per frame of one channel buffer
    pub fn bytes_per_frame(&self) -> usize {
        std::mem::size_of::<f32>()
    }

    /// Bytes held by one channel buffer
    pub fn capacity_bytes(&self) -> usize {
        self.bytes_per_frame() * self.capacity_frames()
    }

    /// Split into the input-callback writer and the output-callback reader
    pub fn split(self) -> (RingWriter, RingReader) {
        let storage = Arc::new(self.storage);
        (
            RingWriter {
                storage: Arc::clone(&storage),
            },
            RingReader { storage },
        )
    }
}

/// Writing half of a split [`RingBuffer`]
pub struct RingWriter {
    storage: Arc<Storage>,
}

impl RingWriter {
    /// See [`RingBuffer::store`]
    pub fn store<S: AsRef<[f32]>>(
        &mut self,
        frames: &[S],
        frame_count: usize,
        start_write: SampleTime,
    ) -> Result<(), RingBufferError> {
        self.storage.store(frames, frame_count, start_write)
    }

    pub fn capacity_frames(&self) -> usize {
        self.storage.capacity_frames
    }
}

/// Reading half of a split [`RingBuffer`]
pub struct RingReader {
    storage: Arc<Storage>,
}

impl RingReader {
    /// See [`RingBuffer::fetch`]
    pub fn fetch<D: AsMut<[f32]>>(
        &self,
        out: &mut [D],
        frame_count: usize,
        start_read: SampleTime,
    ) -> Result<usize, RingBufferError> {
        self.storage.fetch(out, frame_count, start_read)
    }

    /// See [`RingBuffer::time_bounds`]
    pub fn time_bounds(&self) -> Result<(SampleTime, SampleTime), RingBufferError> {
        self.storage.time_bounds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Channel `ch` of frame `t` carries a recognisable value
    fn tagged(ch: usize, t: i64) -> f32 {
        (ch as f32 + 1.0) * 1000.0 + t as f32
    }

    fn block(channels: usize, start: i64, frames: usize) -> Vec<Vec<f32>> {
        (0..channels)
            .map(|ch| (0..frames).map(|i| tagged(ch, start + i as i64)).collect())
            .collect()
    }

    fn out_buffers(channels: usize, frames: usize) -> Vec<Vec<f32>> {
        vec![vec![-1.0; frames]; channels]
    }

    #[test]
    fn test_capacity_rounding() {
        assert_eq!(RingBuffer::new(1, 100).unwrap().capacity_frames(), 128);
        assert_eq!(RingBuffer::new(1, 128).unwrap().capacity_frames(), 128);
        assert_eq!(RingBuffer::new(1, 1).unwrap().capacity_frames(), 1);
        assert_eq!(RingBuffer::new(2, 129).unwrap().capacity_frames(), 256);

        let ring = RingBuffer::new(2, 100).unwrap();
        assert_eq!(ring.bytes_per_frame(), 4);
        assert_eq!(ring.capacity_bytes(), 512);
    }

    #[test]
    fn test_invalid_allocation() {
        assert_eq!(RingBuffer::new(0, 64).err(), Some(RingBufferError::NoChannels));
        assert_eq!(
            RingBuffer::new(1, 0).err(),
            Some(RingBufferError::InvalidCapacity(0))
        );
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut ring = RingBuffer::new(2, 128).unwrap();
        let input = block(2, 0, 128);
        ring.store(&input, 128, 0).unwrap();

        let mut out = out_buffers(2, 128);
        let copied = ring.fetch(&mut out, 128, 0).unwrap();
        assert_eq!(copied, 128);
        assert_eq!(out, input);
        assert_eq!(ring.time_bounds().unwrap(), (0, 128));
    }

    #[test]
    fn test_fetch_empty_buffer_is_silent() {
        let ring = RingBuffer::new(2, 64).unwrap();
        let mut out = out_buffers(2, 10);
        let copied = ring.fetch(&mut out, 10, 0).unwrap();
        assert_eq!(copied, 0);
        assert!(out.iter().flatten().all(|&s| s == 0.0));
    }

    #[test]
    fn test_fetch_clips_both_edges() {
        let mut ring = RingBuffer::new(1, 64).unwrap();
        ring.store(&block(1, 0, 64), 64, 0).unwrap();
        ring.store(&block(1, 64, 10), 10, 64).unwrap();
        assert_eq!(ring.time_bounds().unwrap(), (10, 74));

        // Window [5, 80) overlaps [10, 74)
        let mut out = out_buffers(1, 75);
        let copied = ring.fetch(&mut out, 75, 5).unwrap();
        assert_eq!(copied, 64);
        assert!(out[0][..5].iter().all(|&s| s == 0.0));
        for i in 0..64 {
            assert_eq!(out[0][5 + i], tagged(0, 10 + i as i64));
        }
        assert!(out[0][69..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_first_write_after_zero_zero_fills_lead_in() {
        let mut ring = RingBuffer::new(1, 64).unwrap();
        ring.store(&block(1, 10, 10), 10, 10).unwrap();
        // Start stays at 0; [0, 10) is valid silence
        assert_eq!(ring.time_bounds().unwrap(), (0, 20));

        let mut out = out_buffers(1, 20);
        assert_eq!(ring.fetch(&mut out, 20, 5).unwrap(), 15);
        assert!(out[0][..5].iter().all(|&s| s == 0.0));
        assert_eq!(out[0][5], tagged(0, 10));
        assert!(out[0][15..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_negative_read_is_silent() {
        let mut ring = RingBuffer::new(1, 64).unwrap();
        ring.store(&block(1, 0, 16), 16, 0).unwrap();

        // Entirely before zero
        let mut out = out_buffers(1, 8);
        assert_eq!(ring.fetch(&mut out, 8, -20).unwrap(), 0);
        assert!(out[0].iter().all(|&s| s == 0.0));

        // Straddling zero: leading frames are silence, no clamping to 0
        let mut out = out_buffers(1, 8);
        assert_eq!(ring.fetch(&mut out, 8, -4).unwrap(), 4);
        assert!(out[0][..4].iter().all(|&s| s == 0.0));
        for i in 0..4 {
            assert_eq!(out[0][4 + i], tagged(0, i as i64));
        }
    }

    #[test]
    fn test_fetch_past_end_is_silent() {
        let mut ring = RingBuffer::new(1, 64).unwrap();
        ring.store(&block(1, 0, 16), 16, 0).unwrap();

        let mut out = out_buffers(1, 8);
        assert_eq!(ring.fetch(&mut out, 8, 40).unwrap(), 0);
        assert!(out[0].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_backward_seek_discards_content() {
        let mut ring = RingBuffer::new(1, 128).unwrap();
        ring.store(&block(1, 0, 70), 70, 0).unwrap();
        assert_eq!(ring.time_bounds().unwrap(), (0, 70));

        ring.store(&block(1, 10, 5), 5, 10).unwrap();
        assert_eq!(ring.time_bounds().unwrap(), (10, 15));

        // The old [50, 70) range is gone
        let mut out = out_buffers(1, 20);
        assert_eq!(ring.fetch(&mut out, 20, 50).unwrap(), 0);
        assert!(out[0].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_wraparound() {
        let mut ring = RingBuffer::new(2, 128).unwrap();
        ring.store(&block(2, 0, 100), 100, 0).unwrap();
        let second = block(2, 100, 100);
        ring.store(&second, 100, 100).unwrap();

        // The start advanced so the window is one capacity wide
        assert_eq!(ring.time_bounds().unwrap(), (72, 200));

        let mut out = out_buffers(2, 100);
        assert_eq!(ring.fetch(&mut out, 100, 100).unwrap(), 100);
        assert_eq!(out, second);
    }

    #[test]
    fn test_oversized_write_rejected() {
        let mut ring = RingBuffer::new(1, 64).unwrap();
        ring.store(&block(1, 0, 8), 8, 0).unwrap();

        let result = ring.store(&block(1, 8, 65), 65, 8);
        assert_eq!(
            result,
            Err(RingBufferError::TooMuch {
                frames: 65,
                capacity: 64
            })
        );
        assert_eq!(ring.time_bounds().unwrap(), (0, 8));
    }

    #[test]
    fn test_forward_skip_zero_fills_gap() {
        let mut ring = RingBuffer::new(1, 64).unwrap();
        // Leave stale data in the physical slots the gap will cover
        ring.store(&block(1, 0, 64), 64, 0).unwrap();
        ring.store(&block(1, 64, 8), 8, 64).unwrap();

        // Skip [72, 80)
        ring.store(&block(1, 80, 8), 8, 80).unwrap();
        assert_eq!(ring.time_bounds().unwrap(), (24, 88));

        let mut out = out_buffers(1, 24);
        assert_eq!(ring.fetch(&mut out, 24, 64).unwrap(), 24);
        for i in 0..8 {
            assert_eq!(out[0][i], tagged(0, 64 + i as i64));
            assert_eq!(out[0][8 + i], 0.0);
            assert_eq!(out[0][16 + i], tagged(0, 80 + i as i64));
        }
    }

    #[test]
    fn test_zero_frame_operations() {
        let mut ring = RingBuffer::new(1, 16).unwrap();
        ring.store(&block(1, 0, 0), 0, 5).unwrap();
        assert_eq!(ring.time_bounds().unwrap(), (0, 0));

        let mut out = out_buffers(1, 4);
        assert_eq!(ring.fetch(&mut out, 0, 0).unwrap(), 0);
        // Untouched
        assert!(out[0].iter().all(|&s| s == -1.0));
    }

    #[test]
    fn test_extra_output_channels_are_silent() {
        let mut ring = RingBuffer::new(1, 16).unwrap();
        ring.store(&block(1, 0, 4), 4, 0).unwrap();

        let mut out = out_buffers(3, 4);
        ring.fetch(&mut out, 4, 0).unwrap();
        assert_eq!(out[0][3], tagged(0, 3));
        assert!(out[1].iter().chain(out[2].iter()).all(|&s| s == 0.0));
    }

    #[test]
    fn test_reallocate_discards_content() {
        let mut ring = RingBuffer::new(1, 16).unwrap();
        ring.store(&block(1, 0, 16), 16, 0).unwrap();
        ring.allocate(2, 40).unwrap();
        assert_eq!(ring.channel_count(), 2);
        assert_eq!(ring.capacity_frames(), 64);
        assert_eq!(ring.time_bounds().unwrap(), (0, 0));
    }

    #[test]
    fn test_split_concurrent_stream() {
        // Writer streams blocks of a ramp; the reader lags behind and checks
        // every frame it manages to copy is the ramp value for its time.
        const BLOCK: usize = 32;
        const BLOCKS: i64 = 20_000;

        let ring = RingBuffer::new(2, 1024).unwrap();
        let (mut writer, reader) = ring.split();

        let producer = std::thread::spawn(move || {
            let mut frames = vec![vec![0.0f32; BLOCK]; 2];
            for b in 0..BLOCKS {
                let start = b * BLOCK as i64;
                for (ch, channel) in frames.iter_mut().enumerate() {
                    for (i, s) in channel.iter_mut().enumerate() {
                        *s = tagged(ch, start + i as i64);
                    }
                }
                writer.store(&frames, BLOCK, start).unwrap();
            }
        });

        let mut out = vec![vec![0.0f32; BLOCK]; 2];
        loop {
            let Ok((start, end)) = reader.time_bounds() else {
                continue;
            };
            // Read a block a little behind the write head
            let read_at = (end - 256).max(start);
            if let Ok(copied) = reader.fetch(&mut out, BLOCK, read_at) {
                // Skip blocks the writer may have lapped while we copied
                let still_valid = reader
                    .time_bounds()
                    .map(|(s, _)| s <= read_at)
                    .unwrap_or(false);
                if copied == BLOCK && still_valid {
                    for i in 0..BLOCK {
                        assert_eq!(out[1][i], tagged(1, read_at + i as i64));
                    }
                }
            }
            if end >= BLOCKS * BLOCK as i64 {
                break;
            }
        }
        producer.join().unwrap();
    }
}
