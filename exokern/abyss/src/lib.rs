//! The abyss of the simulated machine.
//!
//! This crate holds the definitions that the memory management unit of the
//! machine fixes once and for all: the shape of virtual and physical
//! addresses, the size of a page, the layout of a user address space, and the
//! error code the MMU reports when an access violates a mapping.
//!
//! Nothing in here keeps state. The [`exokern`] crate builds the kernel on
//! top of these definitions, and user-level libraries only see them through
//! the re-exports of [`exokern`].
//!
//! [`exokern`]: ../exokern/index.html
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod addressing;
pub mod interrupt;
pub mod memlayout;

pub use interrupt::PFErrorCode;
