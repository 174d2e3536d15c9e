//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod cpal_session;
pub mod device;
pub mod engine;
pub mod format;
pub mod level;
pub mod render;
pub mod wav;

#[cfg(test)]
pub(crate) mod mock;

pub use buffer::{FifoBuffer, FifoReader, FifoWriter, PlayoutReader, SharedFifo};
pub use capture::CaptureEngine;
pub use cpal_session::{CpalBackend, CpalDevice};
pub use device::{
    list_devices, AudioBackend, CaptureDevice, DeviceInfo, DeviceSession, Direction, RenderDevice,
};
pub use engine::EngineState;
pub use format::{AudioFormat, WaveEncoding};
pub use level::apply_gain;
pub use render::RenderEngine;
pub use wav::{wav_header, WavReader};
