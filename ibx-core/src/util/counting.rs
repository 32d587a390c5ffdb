use std::io::{Result, Write};

/// Forwards writes while counting bytes and feeding a blake3 digest.
pub struct CountingWriter<W: Write> {
    inner: W,
    hasher: blake3::Hasher,
    pub counted: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            counted: 0,
        }
    }

    pub fn digest(&self) -> blake3::Hash {
        self.hasher.finalize()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let k = self.inner.write(buf)?;
        self.hasher.update(&buf[..k]);
        self.counted += k as u64;
        Ok(k)
    }
    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
