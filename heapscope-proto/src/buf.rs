use core::fmt;

/// A fixed-capacity byte buffer that implements [`fmt::Write`] without
/// ever allocating.
///
/// This is the concrete stand-in for the "reentrancy-safe formatted
/// output" primitive a native profiler would otherwise get from a
/// signal-safe `snprintf`: writing into a `String` would call the very
/// allocator this crate is trying to observe, so every record is built up
/// here instead, then flushed with a single syscall by the caller.
pub struct FixedBuf<const N: usize> {
    data: [u8; N],
    len: usize,
}

impl<const N: usize> FixedBuf<N> {
    pub fn new() -> Self {
        FixedBuf {
            data: [0; N],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<const N: usize> Default for FixedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let end = self.len.checked_add(bytes.len()).ok_or(fmt::Error)?;
        if end > N {
            // A record that doesn't fit is dropped rather than truncated
            // mid-field: a truncated record would be misparsed offline as
            // a different, shorter one.
            return Err(fmt::Error);
        }
        self.data[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write;

    #[test]
    fn accumulates_writes() {
        let mut buf: FixedBuf<64> = FixedBuf::new();
        write!(buf, "{} a 0x{:x} {}\n", 123u64, 0xdeadu64, 8u64).unwrap();
        assert_eq!(buf.as_bytes(), b"123 a 0xdead 8\n");
    }

    #[test]
    fn rejects_overflow_without_partial_write() {
        let mut buf: FixedBuf<4> = FixedBuf::new();
        assert!(write!(buf, "12345").is_err());
    }

    #[test]
    fn clear_resets_length_not_capacity() {
        let mut buf: FixedBuf<16> = FixedBuf::new();
        write!(buf, "hello").unwrap();
        buf.clear();
        assert!(buf.is_empty());
        write!(buf, "hi").unwrap();
        assert_eq!(buf.as_bytes(), b"hi");
    }
}
