use crate::control::HostRegion;
use crate::error::{BridgeError, Result};

/// Host allocation whose usable window starts at a chosen alignment.
///
/// The global allocator gives no alignment guarantee beyond the element type, so the raw
/// allocation is padded by `2 * alignment` and the usable window starts at the first aligned
/// byte. The raw vector is never resized after construction, which keeps the window's address
/// stable for as long as the storage lives.
#[derive(Debug)]
pub(crate) struct AlignedStorage {
    raw: Vec<u8>,
    offset: usize,
    len: usize,
}

impl AlignedStorage {
    pub(crate) fn allocate(len: usize, alignment: usize) -> Result<Self> {
        let alignment = alignment.max(1);
        let padding = if alignment > 1 {
            alignment
                .checked_mul(2)
                .ok_or(BridgeError::OutOfMemory { len })?
        } else {
            0
        };
        let total = len
            .checked_add(padding)
            .ok_or(BridgeError::OutOfMemory { len })?;

        let mut raw = Vec::new();
        raw.try_reserve_exact(total)
            .map_err(|_| BridgeError::OutOfMemory { len })?;
        raw.resize(total, 0);

        let base = raw.as_ptr() as usize;
        let offset = base.next_multiple_of(alignment) - base;
        debug_assert!(offset + len <= raw.len());

        Ok(Self { raw, offset, len })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.raw[self.offset..self.offset + self.len]
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + self.len]
    }

    pub(crate) fn region(&mut self) -> HostRegion<'_> {
        HostRegion::from_mut_slice(self.as_mut_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_window_is_aligned() {
        for alignment in [1usize, 2, 16, 128, 4096] {
            for len in [0usize, 1, 100, 4096, 5000] {
                let mut storage = AlignedStorage::allocate(len, alignment).unwrap();
                assert_eq!(storage.len(), len);
                assert_eq!(storage.as_slice().len(), len);
                assert_eq!(storage.region().addr() % alignment, 0);
            }
        }
    }

    #[test]
    fn storage_starts_zeroed_and_is_writable() {
        let mut storage = AlignedStorage::allocate(256, 128).unwrap();
        assert!(storage.as_slice().iter().all(|&b| b == 0));
        storage.as_mut_slice().fill(0x5a);
        assert!(storage.as_slice().iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn allocation_failure_returns_error() {
        let err = AlignedStorage::allocate(usize::MAX, 128).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfMemory { len: usize::MAX }));

        let err = AlignedStorage::allocate(usize::MAX - 8, 1).unwrap_err();
        assert!(matches!(err, BridgeError::OutOfMemory { .. }));
    }
}
