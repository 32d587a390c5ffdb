use super::{CodecId, Compressor};
use crate::error::{IbxError, Result};
use std::io::{Read, Write};

pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn id(&self) -> CodecId {
        CodecId::Zstd
    }

    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write, level: i32) -> Result<u64> {
        let mut enc = zstd::stream::Encoder::new(dst, level.max(1))?;
        let _ = enc.multithread(0);
        let mut w = enc.auto_finish();
        Ok(std::io::copy(src, &mut w)?)
    }

    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        let mut dec = zstd::stream::Decoder::new(src)?;
        let mut buf = vec![0u8; 1 << 16];
        let mut written = 0u64;
        loop {
            // Read errors mean a truncated or tampered frame; write errors stay I/O.
            let k = dec
                .read(&mut buf)
                .map_err(|e| IbxError::DecryptionFailed(format!("zstd payload: {e}")))?;
            if k == 0 {
                break;
            }
            dst.write_all(&buf[..k])?;
            written += k as u64;
        }
        Ok(written)
    }
}
