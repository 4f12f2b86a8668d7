//! Audio device descriptors and enumeration
//!
//! Thin layer over cpal's host API. A device is identified by its name,
//! which is also what the settings file and the command line refer to.

use std::fmt;

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{BufferSize, SampleFormat, StreamConfig, SupportedBufferSize, SupportedStreamConfig};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No default {0} device")]
    NoDefault(&'static str),

    #[error("No {kind} device named '{name}'")]
    NotFound { kind: &'static str, name: String },

    #[error("Failed to enumerate devices: {0}")]
    Enumerate(#[from] cpal::DevicesError),

    #[error("Failed to read device name: {0}")]
    Name(#[from] cpal::DeviceNameError),

    #[error("Failed to read default stream config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),
}

fn kind(is_input: bool) -> &'static str {
    if is_input {
        "input"
    } else {
        "output"
    }
}

/// Stable identifier of a device: its name as reported by the host
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The parts of a device's default format that force a session rebuild
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
}

/// One input or output device and its default stream format
pub struct AudioDevice {
    id: DeviceId,
    is_input: bool,
    device: cpal::Device,
    config: SupportedStreamConfig,
}

impl AudioDevice {
    /// Describe a cpal device, reading its default stream config
    pub fn from_cpal(device: cpal::Device, is_input: bool) -> Result<Self, DeviceError> {
        let id = DeviceId(device.name()?);
        let config = default_config(&device, is_input)?;
        Ok(Self {
            id,
            is_input,
            device,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.id.0
    }

    pub fn is_input(&self) -> bool {
        self.is_input
    }

    pub fn channel_count(&self) -> usize {
        self.config.channels() as usize
    }

    /// Nominal sample rate in Hz
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate().0
    }

    pub fn sample_format(&self) -> SampleFormat {
        self.config.sample_format()
    }

    /// Frames of extra device latency. cpal does not report one.
    pub fn safety_offset(&self) -> u32 {
        0
    }

    /// Supported buffer size range in frames, when the backend reports one
    pub fn buffer_size_range(&self) -> Option<(u32, u32)> {
        match self.config.buffer_size() {
            SupportedBufferSize::Range { min, max } => Some((*min, *max)),
            SupportedBufferSize::Unknown => None,
        }
    }

    pub fn format(&self) -> DeviceFormat {
        DeviceFormat {
            channels: self.config.channels(),
            sample_rate: self.sample_rate(),
            sample_format: self.sample_format(),
        }
    }

    /// Query the device's current default format again
    pub fn current_format(&self) -> Result<DeviceFormat, DeviceError> {
        let config = default_config(&self.device, self.is_input)?;
        Ok(DeviceFormat {
            channels: config.channels(),
            sample_rate: config.sample_rate().0,
            sample_format: config.sample_format(),
        })
    }

    /// Stream config requesting `buffer_frames`, plus the buffer size to assume
    ///
    /// A fixed size is only requested when the backend reports a range
    /// containing it; otherwise the backend default is used and the
    /// requested size stands in as the latency estimate.
    pub fn stream_config(&self, buffer_frames: u32) -> (StreamConfig, u32) {
        let mut config = self.config.config();
        match self.buffer_size_range() {
            Some((min, max)) if (min..=max).contains(&buffer_frames) => {
                config.buffer_size = BufferSize::Fixed(buffer_frames);
            }
            _ => {
                log::warn!(
                    "{} device '{}' does not support a {} frame buffer, using backend default",
                    kind(self.is_input),
                    self.id,
                    buffer_frames
                );
                config.buffer_size = BufferSize::Default;
            }
        }
        (config, buffer_frames)
    }

    pub fn cpal_device(&self) -> &cpal::Device {
        &self.device
    }
}

impl fmt::Debug for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioDevice")
            .field("id", &self.id)
            .field("is_input", &self.is_input)
            .field("channels", &self.channel_count())
            .field("sample_rate", &self.sample_rate())
            .field("sample_format", &self.sample_format())
            .finish()
    }
}

fn default_config(device: &cpal::Device, is_input: bool) -> Result<SupportedStreamConfig, DeviceError> {
    let config = if is_input {
        device.default_input_config()?
    } else {
        device.default_output_config()?
    };
    Ok(config)
}

/// Every input (or output) device of the default host
///
/// Devices whose name or default config cannot be read are skipped.
pub fn list_devices(is_input: bool) -> Result<Vec<AudioDevice>, DeviceError> {
    let host = cpal::default_host();
    let devices: Vec<cpal::Device> = if is_input {
        host.input_devices()?.collect()
    } else {
        host.output_devices()?.collect()
    };

    Ok(devices
        .into_iter()
        .filter_map(|device| match AudioDevice::from_cpal(device, is_input) {
            Ok(d) => Some(d),
            Err(e) => {
                log::debug!("Skipping {} device: {}", kind(is_input), e);
                None
            }
        })
        .collect())
}

/// The host's default input (or output) device
pub fn default_device(is_input: bool) -> Result<AudioDevice, DeviceError> {
    let host = cpal::default_host();
    let device = if is_input {
        host.default_input_device()
    } else {
        host.default_output_device()
    };
    let device = device.ok_or(DeviceError::NoDefault(kind(is_input)))?;
    AudioDevice::from_cpal(device, is_input)
}

/// Device named `name`, or the default device when no name is given
pub fn find_device(name: Option<&str>, is_input: bool) -> Result<AudioDevice, DeviceError> {
    let Some(name) = name else {
        return default_device(is_input);
    };
    list_devices(is_input)?
        .into_iter()
        .find(|d| d.name() == name)
        .ok_or_else(|| DeviceError::NotFound {
            kind: kind(is_input),
            name: name.to_string(),
        })
}
