//! Voice pipeline on top of the audio engines and the RTP transport

pub mod controls;
pub mod loopback;
pub mod receive;
pub mod session;
pub mod transmit;

pub use controls::{ReceivePredicate, TransmitPredicate, VoiceControls, VoiceOptions, VoiceStats};
pub use loopback::VoiceLoopback;
pub use receive::VoiceReceiver;
pub use session::VoiceSession;
pub use transmit::{PacketSink, Transmitter};
