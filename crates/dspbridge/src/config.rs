use crate::error::{BridgeError, Result};

/// Page granularity of the accelerator's address-space manager.
pub const PAGE_SIZE: usize = 4096;

/// Alignment applied to owned buffers and node heaps unless configured otherwise.
pub const DEFAULT_ALIGNMENT: usize = 128;

/// Extra pages reserved past the page-rounded buffer length.
///
/// The driver maps at page granularity starting from the page containing the buffer's first
/// byte, so an unaligned buffer spills into one more page than its rounded length. Older driver
/// generations expect a second guard page on top of that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardPages {
    One = 1,
    Two = 2,
}

impl GuardPages {
    pub fn count(self) -> u64 {
        self as u64
    }
}

impl TryFrom<u32> for GuardPages {
    type Error = BridgeError;

    fn try_from(v: u32) -> Result<Self> {
        match v {
            1 => Ok(GuardPages::One),
            2 => Ok(GuardPages::Two),
            _ => Err(BridgeError::InvalidConfig("guard pages must be 1 or 2")),
        }
    }
}

/// Buffer placement policy shared by every buffer created from a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    alignment: usize,
    guard_pages: GuardPages,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            guard_pages: GuardPages::One,
        }
    }
}

impl BufferConfig {
    /// `alignment` of 0 or 1 means owned storage is used exactly as the allocator returns it.
    pub fn new(alignment: usize, guard_pages: GuardPages) -> Result<Self> {
        if alignment > 1 && !alignment.is_power_of_two() {
            return Err(BridgeError::InvalidConfig(
                "alignment must be a power of two",
            ));
        }
        if alignment > PAGE_SIZE {
            return Err(BridgeError::InvalidConfig(
                "alignment must not exceed the page size",
            ));
        }
        Ok(Self {
            alignment: alignment.max(1),
            guard_pages,
        })
    }

    pub fn unaligned() -> Self {
        Self {
            alignment: 1,
            ..Self::default()
        }
    }

    pub fn with_guard_pages(self, guard_pages: GuardPages) -> Self {
        Self {
            guard_pages,
            ..self
        }
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn guard_pages(&self) -> GuardPages {
        self.guard_pages
    }

    /// Accelerator address space to reserve for a buffer of `len` bytes.
    pub fn reservation_size(&self, len: usize) -> u64 {
        round_up_to_page(len as u64) + self.guard_pages.count() * PAGE_SIZE as u64
    }
}

pub fn round_up_to_page(len: u64) -> u64 {
    let page = PAGE_SIZE as u64;
    len.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_is_aligned_with_one_guard_page() {
        let cfg = BufferConfig::default();
        assert_eq!(cfg.alignment(), 128);
        assert_eq!(cfg.guard_pages(), GuardPages::One);
        assert_eq!(cfg.reservation_size(4096), 8192);
        assert_eq!(cfg.reservation_size(1), 8192);
        assert_eq!(cfg.reservation_size(0), 4096);
    }

    #[test]
    fn two_guard_pages() {
        let cfg = BufferConfig::default().with_guard_pages(GuardPages::Two);
        assert_eq!(cfg.reservation_size(4096), 12288);
        assert_eq!(cfg.reservation_size(4097), 16384);
    }

    #[test]
    fn rejects_bad_alignment() {
        assert!(matches!(
            BufferConfig::new(96, GuardPages::One),
            Err(BridgeError::InvalidConfig(_))
        ));
        assert!(matches!(
            BufferConfig::new(8192, GuardPages::One),
            Err(BridgeError::InvalidConfig(_))
        ));
        assert_eq!(BufferConfig::new(0, GuardPages::One).unwrap().alignment(), 1);
        assert_eq!(
            BufferConfig::new(64, GuardPages::Two).unwrap().alignment(),
            64
        );
    }

    #[test]
    fn guard_pages_from_count() {
        assert_eq!(GuardPages::try_from(1).unwrap(), GuardPages::One);
        assert_eq!(GuardPages::try_from(2).unwrap(), GuardPages::Two);
        assert!(GuardPages::try_from(0).is_err());
        assert!(GuardPages::try_from(3).is_err());
    }

    proptest! {
        #[test]
        fn reservation_matches_formula(len in 0usize..(64 << 20), two in any::<bool>()) {
            let k = if two { GuardPages::Two } else { GuardPages::One };
            let cfg = BufferConfig::default().with_guard_pages(k);
            let expected = ((len as u64 + 4095) / 4096) * 4096 + k.count() * 4096;
            prop_assert_eq!(cfg.reservation_size(len), expected);
            prop_assert!(cfg.reservation_size(len) >= len as u64 + 4096);
        }
    }
}
