#![forbid(unsafe_code)]

//! Checksums used by store headers, records and log entries.

/// Incremental 32-bit checksum.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far.
    fn finalize(&self) -> u32;
}

/// [`Checksum`] backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC32 over a sequence of chunks, as if they were one contiguous buffer.
pub fn record_crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_trait_reset_matches_fresh_hasher() {
        let mut c = Crc32Fast::default();
        c.update(b"node");
        let first = c.finalize();
        c.update(b" store");
        let second = c.finalize();
        assert_ne!(first, second);
        c.reset();
        c.update(b"node store");
        assert_eq!(c.finalize(), second);
    }

    #[test]
    fn chunked_crc_matches_contiguous() {
        let whole = record_crc32(&[b"sombra-record"]);
        let split = record_crc32(&[b"sombra", b"-", b"record"]);
        assert_eq!(whole, split);
        assert_ne!(whole, record_crc32(&[b"sombra-recorD"]));
    }
}
