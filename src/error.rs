//! Error types for the voice transport

use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The device rejected the requested format at open time
    #[error("Unsupported format: {0}")]
    Format(String),

    /// Sink or source I/O failed inside a capture/render loop
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("The engine has already been started")]
    AlreadyStarted,

    #[error("Worker did not stop within the allotted time")]
    StopTimeout,

    #[error("Device error: {0}")]
    Device(String),

    #[error("Invalid WAV data: {0}")]
    InvalidWav(String),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Unsupported codec configuration: {0}")]
    Unsupported(String),
}

/// RTP transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Socket bind failed: {0}")]
    Bind(String),

    #[error("Send to {peer} failed: {source}")]
    Send {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Receive failed: {0}")]
    Receive(#[source] std::io::Error),

    #[error("Payload must be {expected} bytes, got {actual}")]
    PayloadSize { expected: usize, actual: usize },

    #[error("Transport is already open")]
    AlreadyOpen,

    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
