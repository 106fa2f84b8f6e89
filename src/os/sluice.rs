use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SluiceError {
    #[error("Buffer overflow: attempted to write {attempted} bytes, but only {available} bytes available (capacity: {capacity})")]
    BufferOverflow {
        attempted: usize,
        available: usize,
        capacity: usize,
    },
}

/// A fixed-size buffer for byte streams (stdout/stderr)
///
/// Writes past the capacity keep the bytes that still fit, so the buffer
/// always holds an exact prefix of the stream. The first write that does not
/// fit reports `BufferOverflow`; later writes are dropped silently.
#[derive(Debug, Clone)]
pub struct Sluice {
    buffer: Vec<u8>,
    capacity: usize,
    overflowed: bool,
}

impl Sluice {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity.min(64 * 1024)),
            capacity,
            overflowed: false,
        }
    }

    /// Append bytes to the buffer
    /// Returns an error the first time the stream exceeds capacity
    pub fn append(&mut self, data: &[u8]) -> Result<(), SluiceError> {
        if self.overflowed {
            return Ok(());
        }
        let available = self.capacity.saturating_sub(self.buffer.len());
        if data.len() > available {
            self.buffer.extend_from_slice(&data[..available]);
            self.overflowed = true;
            return Err(SluiceError::BufferOverflow {
                attempted: data.len(),
                available,
                capacity: self.capacity,
            });
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Whether bytes were dropped
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Get the current contents as a byte slice
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_within_capacity() {
        let mut sluice = Sluice::new(8);
        sluice.append(b"abc").unwrap();
        sluice.append(b"defgh").unwrap();
        assert_eq!(sluice.as_bytes(), b"abcdefgh");
        assert!(!sluice.overflowed());
    }

    #[test]
    fn test_overflow_keeps_exact_prefix() {
        let mut sluice = Sluice::new(5);
        sluice.append(b"abc").unwrap();
        let err = sluice.append(b"defg").unwrap_err();
        assert_eq!(
            err,
            SluiceError::BufferOverflow { attempted: 4, available: 2, capacity: 5 }
        );
        assert_eq!(sluice.as_bytes(), b"abcde");
        assert!(sluice.overflowed());

        // Later writes are discarded without another error
        sluice.append(b"zzz").unwrap();
        assert_eq!(sluice.into_bytes(), b"abcde".to_vec());
    }

    #[test]
    fn test_zero_capacity() {
        let mut sluice = Sluice::new(0);
        assert!(sluice.append(b"").is_ok());
        assert!(sluice.append(b"x").is_err());
        assert!(sluice.as_bytes().is_empty());
    }
}
