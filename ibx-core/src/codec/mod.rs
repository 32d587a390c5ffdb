use crate::error::{IbxError, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Payload codec of one stored blob, recorded in its manifest metadata.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    Store = 0,
    Zstd = 1,
}

impl TryFrom<u8> for CodecId {
    type Error = IbxError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(CodecId::Store),
            1 => Ok(CodecId::Zstd),
            other => Err(IbxError::format(format!("unknown codec {other}"))),
        }
    }
}

pub trait Compressor: Send + Sync {
    fn id(&self) -> CodecId;
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write, level: i32) -> Result<u64>;
    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64>;
}

pub fn compressor(id: CodecId) -> &'static dyn Compressor {
    match id {
        CodecId::Store => &Passthrough,
        CodecId::Zstd => &zstdc::ZstdCompressor,
    }
}

pub mod zstdc;

/// Blobs that did not shrink are kept as-is.
struct Passthrough;

impl Compressor for Passthrough {
    fn id(&self) -> CodecId {
        CodecId::Store
    }

    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write, _level: i32) -> Result<u64> {
        Ok(std::io::copy(src, dst)?)
    }

    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        Ok(std::io::copy(src, dst)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zstd_payload_decodes_to_source() {
        let src = b"chat.db ".repeat(512);
        let mut packed = Vec::new();
        let n = compressor(CodecId::Zstd)
            .compress(&mut &src[..], &mut packed, 3)
            .unwrap();
        assert_eq!(n, src.len() as u64);
        assert!(packed.len() < src.len());

        let mut out = Vec::new();
        compressor(CodecId::Zstd)
            .decompress(&mut &packed[..], &mut out)
            .unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn unknown_codec_byte_is_a_format_error() {
        assert!(matches!(CodecId::try_from(7), Err(IbxError::Format(_))));
        assert_eq!(CodecId::try_from(1).unwrap(), CodecId::Zstd);
    }
}
