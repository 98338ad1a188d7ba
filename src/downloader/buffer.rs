//! Fixed capacity in-memory download destination

use std::sync::{Arc, Mutex, MutexGuard};

/// Shared, fixed capacity byte buffer.
///
/// The downloader copies a transfer into it only after the whole range
/// arrived, so a failed transfer leaves the previous contents untouched.
/// Clones share the same storage.
#[derive(Debug, Clone)]
pub struct MemoryBuffer {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    data: Vec<u8>,
    written: usize,
}

impl MemoryBuffer {
    /// Zero-filled buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self::from_vec(vec![0; capacity])
    }

    /// Buffer whose capacity and initial contents are `data`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { data, written: 0 })),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().data.len()
    }

    /// Number of bytes placed by the last committed transfer.
    pub fn written(&self) -> usize {
        self.lock().written
    }

    /// Copy of the whole buffer.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    /// Copy of the bytes placed by the last committed transfer.
    pub fn committed(&self) -> Vec<u8> {
        let inner = self.lock();
        inner.data[..inner.written].to_vec()
    }

    /// Place `bytes` at the start of the buffer.
    ///
    /// Returns false, leaving the buffer as it was, if they don't fit.
    pub(crate) fn commit(&self, bytes: &[u8]) -> bool {
        let mut inner = self.lock();
        if bytes.len() > inner.data.len() {
            return false;
        }
        inner.data[..bytes.len()].copy_from_slice(bytes);
        inner.written = bytes.len();
        true
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The buffer holds plain bytes; a panic elsewhere can't leave it inconsistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_respects_capacity() {
        let buffer = MemoryBuffer::from_vec(vec![7; 4]);
        assert!(!buffer.commit(b"too long"));
        assert_eq!(buffer.snapshot(), vec![7; 4]);
        assert_eq!(buffer.written(), 0);

        let alias = buffer.clone();
        assert!(alias.commit(b"ab"));
        assert_eq!(buffer.snapshot(), b"ab\x07\x07");
        assert_eq!(buffer.committed(), b"ab");
    }
}
