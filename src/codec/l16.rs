//! L16: uncompressed network-order PCM

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{check_frame, CodecInfo, PacketDecoder, PacketEncoder};
use crate::error::CodecError;

pub struct L16Encoder {
    info: CodecInfo,
}

impl L16Encoder {
    pub fn new(info: CodecInfo) -> Self {
        Self { info }
    }
}

impl PacketEncoder for L16Encoder {
    fn info(&self) -> &CodecInfo {
        &self.info
    }

    fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, CodecError> {
        check_frame(&self.info, pcm)?;

        let mut out = BytesMut::with_capacity(pcm.len());
        for chunk in pcm.chunks_exact(2) {
            out.put_i16(i16::from_le_bytes([chunk[0], chunk[1]]));
        }
        Ok(out.freeze())
    }
}

pub struct L16Decoder {
    info: CodecInfo,
}

impl L16Decoder {
    pub fn new(info: CodecInfo) -> Self {
        Self { info }
    }
}

impl PacketDecoder for L16Decoder {
    fn info(&self) -> &CodecInfo {
        &self.info
    }

    fn decode(&mut self, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        if payload.len() % 2 != 0 {
            return Err(CodecError::DecodingFailed(format!(
                "odd L16 payload length {}",
                payload.len()
            )));
        }

        let mut pcm = Vec::with_capacity(payload.len());
        for chunk in payload.chunks_exact(2) {
            pcm.extend_from_slice(&i16::from_be_bytes([chunk[0], chunk[1]]).to_le_bytes());
        }
        Ok(pcm)
    }
}
