//! # User-level `fork` with copy-on-write
//!
//! An exokernel does not implement `fork`. It exports page allocation, page
//! mapping, an `exofork` primitive that creates a child with an empty address
//! space, and page fault upcalls. This crate builds a copy-on-write `fork`
//! out of those primitives, entirely at user level.
//!
//! The work is split in three parts:
//!
//! - [`duppage`] decides, for a single page, how parent and child share it.
//!   Writable pages (and pages that are already copy-on-write) become
//!   read-only copy-on-write pages on both sides. Read-only pages are shared
//!   as they are.
//! - [`pgfault`] runs when either process writes a copy-on-write page. It
//!   gives the writer a private, writable copy of the page and leaves the
//!   other process untouched.
//! - [`fork`](fork::fork) drives the whole thing: it installs the fault
//!   handler, creates the child, walks the parent's address space calling
//!   [`duppage`] on every user page, gives the child its own exception stack,
//!   and finally lets the child run.
//!
//! The exception stack page right below
//! [`UXSTACKTOP`](exokern::memlayout::UXSTACKTOP) is where the fault handler
//! runs. It is never shared: copying it lazily would require handling a
//! fault on the very stack the fault handler needs.
//!
//! Everything a process knows about itself lives in a [`ProcessContext`].
//! The child starts with a copy of its parent's context, and the child side
//! of [`fork`](fork::fork) rebinds [`ProcessContext::thisenv`].
//!
//! [`duppage`]: mod@duppage
//! [`pgfault`]: mod@pgfault
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod duppage;
pub mod fork;
pub mod pgfault;

pub use duppage::{PageClass, classify, duppage};
pub use fork::{fork, sfork};
pub use pgfault::{FaultError, pgfault, pgfault_upcall, set_pgfault_handler};

use exokern::{
    KernelError,
    env::EnvId,
    syscall::{PgfaultUpcall, Syscall},
};

/// Process-local state of the library.
///
/// A real process keeps this in its own memory, so the child inherits a copy
/// of it at fork time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessContext {
    /// Id of the process this context belongs to.
    pub thisenv: EnvId,
    pgfault_handler: Option<PgfaultUpcall>,
}

impl ProcessContext {
    /// Context of the process `sys` runs in.
    pub fn new(sys: &dyn Syscall) -> Self {
        ProcessContext {
            thisenv: sys.getenvid(),
            pgfault_handler: None,
        }
    }

    /// The installed page fault handler, if any.
    pub fn pgfault_handler(&self) -> Option<PgfaultUpcall> {
        self.pgfault_handler
    }
}

/// Errors of [`fork`](fork::fork) and [`sfork`](fork::sfork).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A system call failed.
    #[error(transparent)]
    Kernel(#[from] KernelError),
    /// The operation is not implemented.
    #[error("not supported")]
    NotSupported,
}
