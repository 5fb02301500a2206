//! System call interface.
//!
//! The exokernel exports a deliberately narrow set of primitives. User-level
//! libraries build everything else, `fork` included, on top of them.
//!
//! | Primitive                                   | Description                                              |
//! |---------------------------------------------|----------------------------------------------------------|
//! | [`getenvid`](Syscall::getenvid)              | Id of the calling environment.                           |
//! | [`page_lookup`](Syscall::page_lookup)        | Read the caller's own page table entry for an address.   |
//! | [`page_alloc`](Syscall::page_alloc)          | Allocate a zeroed frame and map it.                      |
//! | [`page_map`](Syscall::page_map)              | Map the frame of one environment into another.           |
//! | [`page_unmap`](Syscall::page_unmap)          | Remove a mapping.                                        |
//! | [`exofork`](Syscall::exofork)                | Create a child with an empty address space.              |
//! | [`env_set_pgfault_upcall`](Syscall::env_set_pgfault_upcall) | Register the page fault entry point.   |
//! | [`env_set_status`](Syscall::env_set_status)  | Make an environment runnable or not.                     |
//! | [`env_destroy`](Syscall::env_destroy)        | Destroy an environment and release its memory.           |
//!
//! Every primitive that takes an [`EnvId`] accepts [`EnvId::SELF`] for the
//! caller, and otherwise only the caller's own id or the id of one of its
//! immediate children. Addresses must be page aligned and below
//! [`UTOP`](crate::memlayout::UTOP). Permissions must contain
//! [`PteFlags::P`] and [`PteFlags::U`] and nothing outside
//! [`PteFlags::SYSCALL`]. Violations are reported as
//! [`KernelError::InvalidArgument`].
use crate::{
    KernelError,
    addressing::Va,
    env::{EnvId, EnvStatus},
    mm::page_table::{Pte, PteFlags},
    trap::UTrapframe,
};

/// Result of [`Syscall::exofork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// Returned to the parent, with the id of the new child.
    Parent(EnvId),
    /// Returned to the child.
    Child,
}

impl Forked {
    /// The value a C-style `fork` would return: the child's id in the parent,
    /// zero in the child.
    pub fn as_envid(&self) -> EnvId {
        match self {
            Forked::Parent(id) => *id,
            Forked::Child => EnvId::SELF,
        }
    }
}

/// Entry point the kernel runs when an environment takes a page fault.
///
/// The upcall runs on the environment's exception stack with the faulting
/// access suspended. When it returns `Ok`, the kernel retries the access;
/// when it returns `Err`, the environment is destroyed.
pub type PgfaultUpcall = fn(&dyn UserContext, &UTrapframe) -> Result<(), KernelError>;

/// The system calls of the exokernel.
pub trait Syscall {
    /// Id of the calling environment.
    fn getenvid(&self) -> EnvId;

    /// Copy of the caller's page table entry for the page containing `va`.
    ///
    /// This is the read-only view of its own page table that every
    /// environment has. Returns `None` when nothing is mapped there.
    fn page_lookup(&self, va: Va) -> Option<Pte>;

    /// Whether the page table covering `va` exists in the caller's address
    /// space. When it does not, none of the 1024 pages around `va` is mapped.
    fn page_table_present(&self, va: Va) -> bool;

    /// Allocate a zero-filled page and map it at `va` of `env` with `perm`.
    ///
    /// A page already mapped at `va` is unmapped first.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if `env` cannot be touched by the caller.
    /// - [`KernelError::InvalidArgument`] for a bad `va` or `perm`.
    /// - [`KernelError::NoMemory`] if no frame is left.
    fn page_alloc(&self, env: EnvId, va: Va, perm: PteFlags) -> Result<(), KernelError>;

    /// Map the page at `srcva` of `srcenv` at `dstva` of `dstenv` with
    /// `perm`. Both mappings then refer to the same frame.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if either environment cannot be touched by
    ///   the caller.
    /// - [`KernelError::InvalidArgument`] for bad addresses or `perm`, if
    ///   `srcva` is not mapped, or if `perm` asks for [`PteFlags::W`] while
    ///   the source page is read-only.
    fn page_map(
        &self,
        srcenv: EnvId,
        srcva: Va,
        dstenv: EnvId,
        dstva: Va,
        perm: PteFlags,
    ) -> Result<(), KernelError>;

    /// Unmap the page at `va` of `env`. Unmapping an unmapped page does
    /// nothing.
    fn page_unmap(&self, env: EnvId, va: Va) -> Result<(), KernelError>;

    /// Create a child environment with an empty address space.
    ///
    /// The child is [`EnvStatus::NotRunnable`] until its parent marks it
    /// runnable. The child resumes at the point where its parent called
    /// `exofork`: its first call of `exofork` returns [`Forked::Child`]
    /// instead of creating another environment.
    ///
    /// # Errors
    /// - [`KernelError::NoFreeEnv`] if the environment table is full.
    fn exofork(&self) -> Result<Forked, KernelError>;

    /// Register `upcall` as the page fault entry point of `env`.
    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: PgfaultUpcall)
    -> Result<(), KernelError>;

    /// Set the status of `env`. Only [`EnvStatus::Runnable`] and
    /// [`EnvStatus::NotRunnable`] are accepted.
    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<(), KernelError>;

    /// Destroy `env`, releasing every frame only it maps.
    fn env_destroy(&self, env: EnvId) -> Result<(), KernelError>;
}

/// Memory access of a user environment.
///
/// These are the loads and stores the environment's code performs. An access
/// the page table does not allow raises a page fault, which the kernel
/// delivers to the environment's upcall before retrying the access.
pub trait UserMemory {
    /// Read `buf.len()` bytes starting at `va`.
    fn load(&self, va: Va, buf: &mut [u8]) -> Result<(), KernelError>;

    /// Write `data` starting at `va`.
    fn store(&self, va: Va, data: &[u8]) -> Result<(), KernelError>;
}

/// Everything code running inside an environment can do.
pub trait UserContext: Syscall + UserMemory {}

impl<T: Syscall + UserMemory + ?Sized> UserContext for T {}
