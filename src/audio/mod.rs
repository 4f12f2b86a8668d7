//! Audio module - routes one input device to one output device
//!
//! This module provides:
//! - Time-addressed ring buffer shared by the two device callbacks
//! - Offset tracking and varispeed rate matching between device clocks
//! - cpal device enumeration, the playthrough session and its host

pub mod bits;
mod clock;
mod dc_filter;
mod device;
mod host;
mod render;
mod ring_buffer;
mod session;
mod time_bounds;
mod tracker;
mod varispeed;

// Re-export public types
pub use clock::{ClockError, ClockSource, ClockTime, DeviceClock};
pub use dc_filter::DcRejectionFilter;
pub use device::{default_device, find_device, list_devices, AudioDevice, DeviceError, DeviceFormat, DeviceId};
pub use host::{PlaythroughHost, RebuildReason};
pub use render::{InputRenderer, OutputOutcome, OutputRenderer, SessionStats, StatsSnapshot};
pub use ring_buffer::{RingBuffer, RingBufferError, RingReader, RingWriter, SampleTime};
pub use session::{thru_offset, Playthrough, PlaythroughConfig, PlaythroughError, SessionEvent};
pub use time_bounds::TimeBoundsHistory;
pub use tracker::{fold_start_delta, TrackerPhase, TrackerState};
pub use varispeed::{RateControl, Varispeed};
