//! Network subsystem for RTP voice transport

pub mod packet;
pub mod peers;
pub mod rtp;
pub mod sequence;
pub mod socket;

pub use packet::{ReceivedPacket, RtpHeader, HEADER_SIZE};
pub use peers::PeerRegistry;
pub use rtp::{RtpConfig, RtpEvent, RtpHandler, RtpStatsSnapshot, RtpTransport};
pub use sequence::SequenceState;
pub use socket::bind_socket;
