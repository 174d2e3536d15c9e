//! Audio device sessions and enumeration
//!
//! The engines only talk to a device through [`DeviceSession`] and its
//! direction-specific extensions, so the loop logic stays independent of the
//! host audio API. [`crate::audio::cpal_session`] provides the cpal-backed
//! implementation.

use cpal::traits::{DeviceTrait, HostTrait};
use crossbeam_channel::Receiver;
use serde::Serialize;

use crate::audio::format::AudioFormat;
use crate::error::AudioError;

/// Device-driven "buffer ready" signal.
///
/// Behaves like an auto-reset event: one message means the device has
/// data (capture) or room (render) since the last wake-up.
pub type BufferReady = Receiver<()>;

/// Transfer direction of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Capture,
    Render,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Capture => f.write_str("capture"),
            Direction::Render => f.write_str("render"),
        }
    }
}

/// Capability interface of one device session
pub trait DeviceSession: Send + 'static {
    /// The device's native mix format
    fn mix_format(&self) -> Result<AudioFormat, AudioError>;

    /// Open the session in shared, event-driven mode at `format`.
    ///
    /// Fails with [`AudioError::Format`] if the device rejects the format.
    fn initialize(&mut self, format: &AudioFormat) -> Result<BufferReady, AudioError>;

    /// Negotiated buffer size in frames; valid after `initialize`
    fn buffer_frames(&self) -> u32;

    fn start(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;

    /// Drop any queued audio so the next start begins clean
    fn reset(&mut self) -> Result<(), AudioError>;
}

/// Capture service of a session
pub trait CaptureDevice: DeviceSession {
    /// Copy the frames currently available into `buf`.
    ///
    /// Returns the number of whole frames copied, never more than fit in `buf`.
    fn read_frames(&mut self, buf: &mut [u8]) -> Result<u32, AudioError>;
}

/// Render service of a session
pub trait RenderDevice: DeviceSession {
    /// Frames already queued for playback and not yet consumed
    fn padding(&self) -> Result<u32, AudioError>;

    /// Queue whole frames for playback
    fn write_frames(&mut self, data: &[u8]) -> Result<(), AudioError>;
}

/// Factory for device sessions
pub trait AudioBackend: Send + Sync + 'static {
    type Capture: CaptureDevice;
    type Render: RenderDevice;

    fn capture_device(&self) -> Result<Self::Capture, AudioError>;

    fn render_device(&self) -> Result<Self::Render, AudioError>;
}

/// Device description for listings
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available audio devices
pub fn list_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<DeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            let Ok(name) = device.name() else { continue };
            let (sample_rates, channels) = device_capabilities(&device, Direction::Capture);

            devices.push(DeviceInfo {
                is_default: default_input_name.as_ref() == Some(&name),
                name,
                is_input: true,
                is_output: false,
                sample_rates,
                channels,
            });
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            let Ok(name) = device.name() else { continue };
            let is_default = default_output_name.as_ref() == Some(&name);

            // Duplex devices show up once
            if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                existing.is_output = true;
                existing.is_default |= is_default;
                continue;
            }

            let (sample_rates, channels) = device_capabilities(&device, Direction::Render);
            devices.push(DeviceInfo {
                name,
                is_input: false,
                is_output: true,
                is_default,
                sample_rates,
                channels,
            });
        }
    }

    devices
}

fn device_capabilities(device: &cpal::Device, direction: Direction) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = match direction {
        Direction::Capture => device
            .supported_input_configs()
            .map(|configs| configs.collect())
            .unwrap_or_default(),
        Direction::Render => device
            .supported_output_configs()
            .map(|configs| configs.collect())
            .unwrap_or_default(),
    };

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();

    for config in &configs {
        for rate in [8000u32, 11025, 16000, 22050, 32000, 44100, 48000, 96000] {
            let in_range = cpal::SampleRate(rate) >= config.min_sample_rate()
                && cpal::SampleRate(rate) <= config.max_sample_rate();
            if in_range && !sample_rates.contains(&rate) {
                sample_rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }

    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

/// Find a device by name, or the host default when `name` is `None`
pub fn find_device(direction: Direction, name: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        let device = match direction {
            Direction::Capture => host.default_input_device(),
            Direction::Render => host.default_output_device(),
        };
        return device
            .ok_or_else(|| AudioError::DeviceNotFound(format!("no default {} device", direction)));
    };

    let devices = match direction {
        Direction::Capture => host.input_devices(),
        Direction::Render => host.output_devices(),
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(AudioError::DeviceNotFound(name.to_string()))
}
