//! Physical and Virtual Memory Addressing Schemes.
//!
//! This module provides abstractions for virtual address and physical
//! address of the simulated machine. The machine has a 32-bit virtual address
//! space translated by a two-level page table: the top 10 bits of an address
//! select a page directory entry, the next 10 bits select a page table entry,
//! and the low 12 bits are the offset inside a 4 KiB page.
//!
//! ```text
//! 31                 22 21                 12 11                    0
//! +--------------------+--------------------+-----------------------+
//! |  Page Directory    |    Page Table      |   Offset within Page  |
//! |      Index         |      Index         |                       |
//! +--------------------+--------------------+-----------------------+
//!  \----- pdx(va) ----/ \----- ptx(va) ----/
//!  \-------------- vpn(va) ----------------/
//! ```
//!
//! Physical addresses name a byte inside the frame pool of the machine. The
//! frame number of a physical address is its value shifted by
//! [`PAGE_SHIFT`].
//!
//! Both [`Pa`] and [`Va`] support arithmetic operations (addition,
//! subtraction, bitwise operations), which allow straightforward address
//! arithmetic.
//!
//! ## Example Usage:
//!
//! ```
//! use abyss::addressing::{Va, PAGE_SIZE};
//!
//! let va = Va::new(0x0080_1234).unwrap();
//! assert_eq!(va.page_down().into_usize(), 0x0080_1000);
//! assert_eq!((va.page_down() + PAGE_SIZE).vpn(), va.vpn() + 1);
//! ```

/// The size of a single page in memory, in bytes.
///
/// Every mapping, every frame, and every unit of copy-on-write sharing is
/// exactly one page.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page index from a given address.
///
/// ## Example:
/// ```
/// # use abyss::addressing::PAGE_SHIFT;
/// let vpn = 0x0080_0000usize >> PAGE_SHIFT;
/// assert_eq!(vpn, 0x800);
/// ```
pub const PAGE_SHIFT: usize = 12;

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// Number of entries in a page directory.
pub const NPDENTRIES: usize = 1024;

/// Number of entries in a page table.
pub const NPTENTRIES: usize = 1024;

/// Bytes mapped by a single page directory entry.
pub const PTSIZE: usize = PAGE_SIZE * NPTENTRIES;

/// Shift of the page directory index within a virtual address.
pub const PDXSHIFT: usize = 22;

/// Represents a physical address.
///
/// The `Pa` (Physical Address) struct is a wrapper around the `usize` type,
/// which represents a location inside the frame pool of the machine.
///
/// ## Example:
/// ```
/// # use abyss::addressing::Pa;
/// let pa = Pa::from_pfn(3);
/// assert_eq!(pa.into_usize(), 0x3000);
/// assert_eq!(pa.pfn(), 3);
/// ```
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// Build the physical address of the first byte of frame `pfn`.
    #[inline]
    pub const fn from_pfn(pfn: usize) -> Self {
        Self(pfn << PAGE_SHIFT)
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Frame number that this address falls in.
    #[inline]
    pub const fn pfn(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Align down the physical address to the page boundary.
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }
}

/// Represents a virtual address.
///
/// The [`Va`] (Virtual Address) struct represents an address in the 32-bit
/// virtual address space of an environment.
///
/// This abstraction provides utility methods for validation, alignment, and
/// decomposition into page table indices, ensuring consistent handling of
/// virtual addresses.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Default)]
pub struct Va(pub(crate) usize);

impl Va {
    /// Creates a new virtual address if the address is valid.
    ///
    /// # Returns
    /// - `Some(Va)`: If the address fits in the 32-bit address space.
    /// - `None`: If the address is invalid.
    ///
    /// # Example
    /// ```
    /// # use abyss::addressing::Va;
    /// assert!(Va::new(0xeebf_e000).is_some());
    /// assert!(Va::new(0x1_0000_0000).is_none());
    /// ```
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr <= u32::MAX as usize {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Build the address of the first byte of virtual page `vpn`.
    ///
    /// Returns `None` if the page lies outside of the address space.
    #[inline]
    pub const fn from_vpn(vpn: usize) -> Option<Self> {
        if vpn < NPDENTRIES * NPTENTRIES {
            Some(Self(vpn << PAGE_SHIFT))
        } else {
            None
        }
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Virtual page number of this address.
    #[inline]
    pub const fn vpn(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Page directory index of this address.
    #[inline]
    pub const fn pdx(self) -> usize {
        (self.0 >> PDXSHIFT) & (NPDENTRIES - 1)
    }

    /// Page table index of this address.
    #[inline]
    pub const fn ptx(self) -> usize {
        (self.0 >> PAGE_SHIFT) & (NPTENTRIES - 1)
    }

    /// Aligns the virtual address down to the nearest page boundary.
    ///
    /// # Example
    /// ```
    /// # use abyss::addressing::Va;
    /// let va = Va::new(0x1234_5678).unwrap();
    /// assert_eq!(va.page_down().into_usize(), 0x1234_5000);
    /// ```
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Extracts the offset within the memory page from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Whether the address sits on a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.offset() == 0
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:08x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:08x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
