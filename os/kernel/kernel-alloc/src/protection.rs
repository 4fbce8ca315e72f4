//! Page protection and cache policy as seen by the VMM.

use bitflags::bitflags;

bitflags! {
    /// Access rights of a page or mapping.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl Protection {
    /// Whether a page whose maximum capability is `self` may be mapped (or
    /// accessed) with `request`.
    ///
    /// A single-right capability only admits exactly that right; a combined
    /// capability admits any non-empty subset of itself.
    ///
    /// ```
    /// # use kernel_alloc::Protection;
    /// assert!(Protection::READ_EXECUTE.permits(Protection::EXECUTE));
    /// assert!(!Protection::READ_EXECUTE.permits(Protection::WRITE));
    /// assert!(!Protection::READ.permits(Protection::READ_WRITE));
    /// ```
    #[must_use]
    pub const fn permits(self, request: Self) -> bool {
        if request.is_empty() || self.is_empty() {
            return false;
        }
        if self.bits().count_ones() == 1 {
            return self.bits() == request.bits();
        }
        self.contains(request)
    }
}

/// Caching mode requested for a mapping. Encoding it is the page mapper's job.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum CachePolicy {
    #[default]
    WriteBack,
    WriteThrough,
    WriteCombining,
    Uncached,
}
