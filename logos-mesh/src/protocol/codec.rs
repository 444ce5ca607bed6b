//! Field-level helpers over [`bytes::Buf`] / [`bytes::BufMut`].
//!
//! Strings and byte blobs are prefixed by a `u32` LE length. Reads go
//! through the `try_get_*` family, so running past the end yields
//! [`DecodeError::Truncated`] instead of a panic.

use bytes::{Buf, BufMut, TryGetError};

use super::DecodeError;

impl From<TryGetError> for DecodeError {
    fn from(e: TryGetError) -> Self {
        DecodeError::Truncated {
            needed: e.requested,
            remaining: e.available,
        }
    }
}

/// Length-prefixed writes.
pub(crate) trait PutField: BufMut {
    fn put_blob(&mut self, v: &[u8]) {
        self.put_u32_le(v.len() as u32);
        self.put_slice(v);
    }

    fn put_text(&mut self, v: &str) {
        self.put_blob(v.as_bytes());
    }
}

impl<B: BufMut + ?Sized> PutField for B {}

/// Fallible reads. Fixed-width reads leave the buffer untouched on error.
pub(crate) trait GetField: Buf {
    fn get_tag(&mut self) -> Result<u8, DecodeError> {
        Ok(self.try_get_u8()?)
    }

    fn get_u32_field(&mut self) -> Result<u32, DecodeError> {
        Ok(self.try_get_u32_le()?)
    }

    fn get_u64_field(&mut self) -> Result<u64, DecodeError> {
        Ok(self.try_get_u64_le()?)
    }

    fn get_u128_field(&mut self) -> Result<u128, DecodeError> {
        Ok(self.try_get_u128_le()?)
    }

    fn get_blob(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.get_u32_field()? as usize;
        if self.remaining() < len {
            return Err(DecodeError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let mut out = vec![0u8; len];
        self.copy_to_slice(&mut out);
        Ok(out)
    }

    fn get_text(&mut self) -> Result<String, DecodeError> {
        String::from_utf8(self.get_blob()?).map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Everything left in the buffer.
    fn get_rest(&mut self) -> Vec<u8> {
        let mut out = vec![0u8; self.remaining()];
        self.copy_to_slice(&mut out);
        out
    }

    /// Fails if unread bytes remain.
    fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

impl<B: Buf + ?Sized> GetField for B {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_layout_is_little_endian() {
        let mut buf = Vec::new();
        buf.put_u32_le(0x0102_0304);
        buf.put_text("ab");
        assert_eq!(buf, vec![0x04, 0x03, 0x02, 0x01, 2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn test_reader_truncation_is_an_error() {
        let mut r: &[u8] = &[1, 2];
        assert_eq!(
            r.get_u32_field(),
            Err(DecodeError::Truncated { needed: 4, remaining: 2 })
        );
        // Nothing consumed on failure.
        assert_eq!(r.remaining(), 2);
    }

    #[test]
    fn test_length_prefix_past_end() {
        // Declares 10 bytes, carries 1.
        let mut r: &[u8] = &[10, 0, 0, 0, 7];
        assert_eq!(
            r.get_blob(),
            Err(DecodeError::Truncated { needed: 10, remaining: 1 })
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let mut r: &[u8] = &[2, 0, 0, 0, 0xFF, 0xFE];
        assert_eq!(r.get_text(), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn test_finish_rejects_trailing() {
        let mut r: &[u8] = &[1, 2, 3];
        r.get_tag().unwrap();
        assert_eq!(r.finish(), Err(DecodeError::TrailingBytes(2)));
        assert_eq!(r.get_rest(), vec![2, 3]);
        assert_eq!(r.finish(), Ok(()));
    }
}
