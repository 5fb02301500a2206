//! Error code of a page fault.

bitflags::bitflags! {
    /// Page fault error code reported by the MMU.
    ///
    /// The code tells the fault handler why the access was rejected. Only the
    /// bits that the simulated MMU can raise are defined.
    pub struct PFErrorCode: u32 {
        /// When set, the page fault was caused by a page-protection violation.
        /// When not set, it was caused by a non-present page.
        const PRESENT = 1 << 0;
        /// When set, the page fault was caused by a write access.
        /// When not set, it was caused by a read access.
        const WRITE_ACCESS = 1 << 1;
        /// When set, the page fault was caused while CPL = 3.
        /// This does not necessarily mean that the page fault was a privilege violation.
        const USER = 1 << 2;
    }
}

impl PFErrorCode {
    /// Whether the faulting access was a write.
    #[inline]
    pub const fn is_write(&self) -> bool {
        self.contains(Self::WRITE_ACCESS)
    }
}
