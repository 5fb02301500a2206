//! Two-level page table of an environment.
//!
//! Each environment translates its virtual addresses through its own
//! [`PageTable`]. The table has two levels: a page directory of
//! [`NPDENTRIES`] slots, each of which either is absent or points to a page
//! table of [`NPTENTRIES`] entries. A page table is created the first time a
//! page inside its 4 MiB range is mapped and released once its last mapping
//! goes away, so an absent directory slot means that no page of the range is
//! mapped.
//!
//! Every mapping holds a [`Page`]. Mapping the same frame at several places,
//! in one or in several page tables, is how frames are shared; the frame stays
//! alive until the last mapping that refers to it is removed.
//!
//! The flags of an entry follow the x86 page table entry layout. Bits 9–11
//! are left to software; the copy-on-write marker [`PteFlags::COW`] lives
//! there.
//!
//! User code never gets a reference into a [`PageTable`]. It reads a copy of
//! an entry, a [`Pte`], through the read-only page table view exported by
//! [`Syscall::page_lookup`].
//!
//! [`Syscall::page_lookup`]: crate::syscall::Syscall::page_lookup
use super::Page;
use crate::{
    addressing::{NPDENTRIES, NPTENTRIES, PAGE_SHIFT, Pa, Va},
    memlayout::UTOP,
};

bitflags::bitflags! {
    /// Flags for pte.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page referenced by this entry
        const W = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-KByte page referenced by this entry
        const U = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed; indicates whether software has accessed the 4-KByte page referenced by this entry
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 4-KByte page referenced by this entry
        const D = 1 << 6;
        /// Global
        const G = 1 << 8;
        /// Bits available for software use.
        const AVAIL = 0xe00;
        /// Copy-on-write. The frame is shared and the first write to it must
        /// give the writer a private copy.
        const COW = 1 << 11;
        /// Flags a user environment may pass to the mapping system calls.
        const SYSCALL = Self::AVAIL.bits | Self::P.bits | Self::W.bits | Self::U.bits;
    }
}

/// A copy of a page table entry.
///
/// The low 12 bits hold the [`PteFlags`], the upper bits hold the frame
/// number of the mapped physical page.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub usize);

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if let Some(pa) = self.pa() {
            write!(f, "Pte({:08x}, {:?})", pa.into_usize(), self.flags())
        } else {
            write!(f, ".")
        }
    }
}

impl Pte {
    /// Build an entry mapping `pa` with `flags`.
    #[inline]
    pub const fn new(pa: Pa, flags: PteFlags) -> Self {
        Pte(pa.page_down().into_usize() | (flags.bits() & 0xfff))
    }

    /// Get the physical address pointed to by this entry.
    ///
    /// # Returns
    /// - `Some(Pa)` if the page is present, containing the physical address.
    /// - `None` if the page is not present (i.e., the "P" flag is not set).
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.flags().contains(PteFlags::P) {
            Some(Pa::from_pfn(self.0 >> PAGE_SHIFT))
        } else {
            None
        }
    }

    /// Get the flags associated with this page table entry.
    #[inline]
    pub const fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0xfff)
    }
}

/// Page Table Mapping Error.
///
/// This enum represents errors that can occur when working with page table
/// mappings.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PageTableMappingError {
    /// Unaligned address.
    ///
    /// This error is returned when an address is not a multiple of the page
    /// size.
    Unaligned,

    /// The address lies at or above [`UTOP`], which user page tables never
    /// map.
    OutOfRange,

    /// Not exist.
    ///
    /// This error is returned when a requested page table entry does not exist
    /// or has not been mapped yet.
    NotExist,

    /// Invalid permission.
    ///
    /// This error is returned when an attempt is made to create a mapping
    /// without the present bit.
    InvalidPermission,
}

/// Page table indices for a given virtual address.
pub struct PtIndices {
    /// The virtual address associated with this page table index breakdown.
    pub va: Va,

    /// Page Directory Index (PDEI).
    pub pdei: usize,

    /// Page Table Index (PTEI).
    pub ptei: usize,
}

impl PtIndices {
    /// Extracts page table indices from a given virtual address ([`Va`]).
    ///
    /// # Returns
    /// - `Ok(Self)`: If `va` is page-aligned and below [`UTOP`].
    /// - `Err(PageTableMappingError::Unaligned)`: If `va` is not page-aligned.
    /// - `Err(PageTableMappingError::OutOfRange)`: If `va` is not a user
    ///   address.
    pub fn from_va(va: Va) -> Result<Self, PageTableMappingError> {
        if !va.is_page_aligned() {
            Err(PageTableMappingError::Unaligned)
        } else if va >= UTOP {
            Err(PageTableMappingError::OutOfRange)
        } else {
            Ok(Self {
                va,
                pdei: va.pdx(),
                ptei: va.ptx(),
            })
        }
    }
}

#[derive(Clone)]
struct Mapping {
    page: Page,
    flags: PteFlags,
}

struct PageTableLevel {
    entries: Box<[Option<Mapping>]>,
    nr_mapped: usize,
}

impl PageTableLevel {
    fn new() -> Box<Self> {
        Box::new(PageTableLevel {
            entries: (0..NPTENTRIES).map(|_| None).collect(),
            nr_mapped: 0,
        })
    }
}

/// Page table of a single environment.
pub struct PageTable {
    pgdir: Box<[Option<Box<PageTableLevel>>]>,
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    /// Create an empty page table.
    pub fn new() -> Self {
        PageTable {
            pgdir: (0..NPDENTRIES).map(|_| None).collect(),
        }
    }

    /// Map `page` at `va` with `flags`, replacing whatever `va` mapped
    /// before.
    ///
    /// The previous page, if any, is handed back to the caller, which decides
    /// when to drop it. Mapping a frame over a slot that already maps the
    /// same frame never frees the frame in between, since `page` holds its
    /// own reference.
    ///
    /// # Returns
    /// - `Ok(Some(Page))`: `va` was mapped before; the old page is returned.
    /// - `Ok(None)`: `va` was unmapped.
    /// - `Err(PageTableMappingError)`: `va` is unaligned or not a user
    ///   address, or `flags` lacks [`PteFlags::P`].
    pub fn map(
        &mut self,
        va: Va,
        page: Page,
        flags: PteFlags,
    ) -> Result<Option<Page>, PageTableMappingError> {
        let PtIndices { pdei, ptei, .. } = PtIndices::from_va(va)?;
        if !flags.contains(PteFlags::P) {
            return Err(PageTableMappingError::InvalidPermission);
        }
        let table = self.pgdir[pdei].get_or_insert_with(PageTableLevel::new);
        let old = table.entries[ptei].replace(Mapping { page, flags });
        if old.is_none() {
            table.nr_mapped += 1;
        }
        Ok(old.map(|Mapping { page, .. }| page))
    }

    /// Unmap the given virtual address (`va`) and return the physical page that
    /// was mapped to it.
    ///
    /// # Returns
    /// A `Result` containing the physical page ([`Page`]) that was mapped to
    /// the given virtual address, or an error if the unmapping operation
    /// fails (e.g., the virtual address was not previously mapped).
    pub fn unmap(&mut self, va: Va) -> Result<Page, PageTableMappingError> {
        let PtIndices { pdei, ptei, .. } = PtIndices::from_va(va)?;
        let table = self.pgdir[pdei]
            .as_mut()
            .ok_or(PageTableMappingError::NotExist)?;
        let Mapping { page, .. } = table.entries[ptei]
            .take()
            .ok_or(PageTableMappingError::NotExist)?;
        table.nr_mapped -= 1;
        if table.nr_mapped == 0 {
            self.pgdir[pdei] = None;
        }
        Ok(page)
    }

    /// Walk through the page table to find the page table entry for the given
    /// virtual address (`va`).
    ///
    /// # Returns
    /// A copy of the entry, or an error if `va` is not mapped.
    pub fn walk(&self, va: Va) -> Result<Pte, PageTableMappingError> {
        self.get_user_page(va)
            .map(|(page, flags)| Pte::new(page.pa(), flags))
    }

    /// Find the page mapped at `va` together with its flags.
    pub fn get_user_page(&self, va: Va) -> Result<(&Page, PteFlags), PageTableMappingError> {
        let PtIndices { pdei, ptei, .. } = PtIndices::from_va(va)?;
        self.pgdir[pdei]
            .as_ref()
            .and_then(|table| table.entries[ptei].as_ref())
            .map(|Mapping { page, flags }| (page, *flags))
            .ok_or(PageTableMappingError::NotExist)
    }

    /// Whether the page table covering `va` exists, i.e. whether anything in
    /// the 4 MiB range around `va` is mapped.
    pub fn is_table_present(&self, va: Va) -> bool {
        va < UTOP && self.pgdir[va.pdx()].is_some()
    }

    /// Iterate over every mapping, in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (Va, Pte)> + '_ {
        self.pgdir
            .iter()
            .enumerate()
            .filter_map(|(pdei, table)| table.as_ref().map(|table| (pdei, table)))
            .flat_map(|(pdei, table)| {
                table
                    .entries
                    .iter()
                    .enumerate()
                    .filter_map(move |(ptei, mapping)| {
                        let Mapping { page, flags } = mapping.as_ref()?;
                        let va = Va::from_vpn(pdei * NPTENTRIES + ptei)?;
                        Some((va, Pte::new(page.pa(), *flags)))
                    })
            })
    }

    /// Number of mapped pages.
    pub fn nr_mapped(&self) -> usize {
        self.pgdir
            .iter()
            .flatten()
            .map(|table| table.nr_mapped)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        addressing::{PAGE_SIZE, PTSIZE},
        mm::FramePool,
    };

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    #[test]
    fn map_walk_unmap() {
        let pool = FramePool::new(4);
        let mut pt = PageTable::new();
        let page = Page::new(&pool).unwrap();
        let pa = page.pa();

        assert!(!pt.is_table_present(va(0x80_0000)));
        assert!(pt
            .map(va(0x80_0000), page, PteFlags::P | PteFlags::U)
            .unwrap()
            .is_none());
        assert!(pt.is_table_present(va(0x80_0000)));

        let pte = pt.walk(va(0x80_0000)).unwrap();
        assert_eq!(pte.pa(), Some(pa));
        assert_eq!(pte.flags(), PteFlags::P | PteFlags::U);
        assert_eq!(pt.walk(va(0x80_1000)), Err(PageTableMappingError::NotExist));

        let page = pt.unmap(va(0x80_0000)).unwrap();
        assert_eq!(page.pa(), pa);
        assert!(!pt.is_table_present(va(0x80_0000)));
        assert_eq!(pt.unmap(va(0x80_0000)).unwrap_err(), PageTableMappingError::NotExist);
    }

    #[test]
    fn rejects_bad_addresses_and_flags() {
        let pool = FramePool::new(4);
        let mut pt = PageTable::new();
        let page = Page::new(&pool).unwrap();

        assert_eq!(
            pt.map(va(0x80_0010), page.clone(), PteFlags::P).unwrap_err(),
            PageTableMappingError::Unaligned
        );
        assert_eq!(
            pt.map(UTOP, page.clone(), PteFlags::P).unwrap_err(),
            PageTableMappingError::OutOfRange
        );
        assert_eq!(
            pt.map(va(0x80_0000), page, PteFlags::U).unwrap_err(),
            PageTableMappingError::InvalidPermission
        );
        assert_eq!(pool.free_frames(), 4);
    }

    #[test]
    fn remap_same_frame_keeps_it_alive() {
        let pool = FramePool::new(4);
        let mut pt = PageTable::new();
        let page = Page::new(&pool).unwrap();
        page.write(0, b"keep");
        pt.map(va(0x80_0000), page, PteFlags::P | PteFlags::U | PteFlags::W)
            .unwrap();

        let same = pt.get_user_page(va(0x80_0000)).unwrap().0.clone();
        let old = pt
            .map(va(0x80_0000), same, PteFlags::P | PteFlags::U | PteFlags::COW)
            .unwrap();
        drop(old);

        let (page, flags) = pt.get_user_page(va(0x80_0000)).unwrap();
        assert_eq!(flags, PteFlags::P | PteFlags::U | PteFlags::COW);
        assert_eq!(page.ref_count(), 1);
        let mut buf = [0u8; 4];
        page.read(0, &mut buf);
        assert_eq!(&buf, b"keep");
        assert_eq!(pool.free_frames(), 3);
    }

    #[test]
    fn iter_in_address_order() {
        let pool = FramePool::new(8);
        let mut pt = PageTable::new();
        for addr in [PTSIZE * 3, PAGE_SIZE, PTSIZE * 3 + PAGE_SIZE] {
            pt.map(va(addr), Page::new(&pool).unwrap(), PteFlags::P | PteFlags::U)
                .unwrap();
        }
        let vas = pt.iter().map(|(va, _)| va.into_usize()).collect::<Vec<_>>();
        assert_eq!(vas, vec![PAGE_SIZE, PTSIZE * 3, PTSIZE * 3 + PAGE_SIZE]);
        assert_eq!(pt.nr_mapped(), 3);

        drop(pt);
        assert_eq!(pool.free_frames(), 8);
    }

    #[test]
    fn pte_encoding() {
        let pte = Pte::new(Pa::from_pfn(7), PteFlags::P | PteFlags::U | PteFlags::COW);
        assert_eq!(pte.pa(), Some(Pa::from_pfn(7)));
        assert!(pte.flags().contains(PteFlags::COW));
        assert!(!pte.flags().contains(PteFlags::W));
        assert_eq!(Pte(0).pa(), None);
        assert!(PteFlags::SYSCALL.contains(PteFlags::COW));
    }
}
